use comms::{
    RecvError,
    msg::{Action, Request, Response},
    tensor::Tensor,
};
use serde_json::json;
use tokio::io::{self, AsyncWriteExt};

const SIZE: usize = 4096;

#[tokio::test]
async fn send_recv() {
    let mut msg = Request::for_model(Action::Infer, "/models/m1.bin", "echo");
    msg.request_id = json!("r-1");
    msg.input_data.insert(
        "image".into(),
        Tensor::from_slice(vec![2, 2], &[1u8, 2, 3, 4]).unwrap().to_json(),
    );

    let (one, two) = io::duplex(SIZE);
    let (rx, tx) = io::split(one);
    let (_, mut tx) = comms::channel(rx, tx, SIZE);

    tx.send(&msg).await.unwrap();

    let (rx, tx) = io::split(two);
    let (mut rx, _) = comms::channel(rx, tx, SIZE);

    let req: Request = rx.recv().await.unwrap();

    assert_eq!(req.action, Action::Infer);
    assert_eq!(req.request_id, json!("r-1"));
    assert_eq!(req.model_path.as_deref(), Some("/models/m1.bin"));

    let image = Tensor::from_json(&req.input_data["image"]).unwrap();
    assert_eq!(image.to_vec::<u8>().unwrap(), vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn request_response_exchange() {
    let (client, server) = io::duplex(SIZE);

    let (rx, tx) = io::split(client);
    let (mut client_rx, mut client_tx) = comms::channel(rx, tx, SIZE);

    let (rx, tx) = io::split(server);
    let (mut server_rx, mut server_tx) = comms::channel(rx, tx, SIZE);

    let server = tokio::spawn(async move {
        let req: Request = server_rx.recv().await.unwrap();
        let res = Response::ok(req.request_id, json!({"pong": true}));
        server_tx.send(&res).await.unwrap();

        matches!(server_rx.recv::<Request>().await, Err(RecvError::Closed))
    });

    let mut ping = Request::new(Action::Ping);
    ping.request_id = json!(42);
    client_tx.send(&ping).await.unwrap();

    let res: Response = client_rx.recv().await.unwrap();
    assert_eq!(res.request_id, json!(42));
    assert_eq!(res.into_result().unwrap(), json!({"pong": true}));

    client_tx.shutdown().await.unwrap();
    assert!(server.await.unwrap());
}

#[tokio::test]
async fn length_prefix_larger_than_body_is_truncated() {
    let (mut client, server) = io::duplex(SIZE);

    client.write_all(&[0, 0, 0, 64]).await.unwrap();
    client.write_all(b"{\"action\":\"ping\"}").await.unwrap();
    client.shutdown().await.unwrap();

    let (rx, tx) = io::split(server);
    let (mut rx, _) = comms::channel(rx, tx, SIZE);

    match rx.recv::<Request>().await {
        Err(RecvError::Truncated { expected: 64, got: 17 }) => {}
        other => panic!("unexpected: {other:?}"),
    }
}
