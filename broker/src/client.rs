//! Async client for talking to a running broker.

use std::{error::Error, fmt, path::Path};

use comms::{
    DEFAULT_MAX_MESSAGE_BYTES, FrameReceiver, FrameSender, RecvError, SendError,
    msg::{Action, ErrorBody, Request, Response},
};
use serde_json::{Map, Value, json};
use tokio::net::{
    UnixStream,
    unix::{OwnedReadHalf, OwnedWriteHalf},
};

/// Failures seen by a client.
#[derive(Debug)]
pub enum ClientError {
    Recv(RecvError),
    Send(SendError),
    /// The broker answered with an error.
    Broker(ErrorBody),
    /// The response carried a `request_id` other than the one sent.
    Mismatch { sent: Value, got: Value },
}

impl ClientError {
    /// The broker's error kind, if the broker produced the error.
    pub fn kind(&self) -> Option<&str> {
        match self {
            ClientError::Broker(body) => Some(&body.kind),
            _ => None,
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Recv(e) => write!(f, "receive failed: {e}"),
            ClientError::Send(e) => write!(f, "send failed: {e}"),
            ClientError::Broker(body) => write!(f, "{}: {}", body.kind, body.message),
            ClientError::Mismatch { sent, got } => {
                write!(f, "sent request {sent} but got a response to {got}")
            }
        }
    }
}

impl Error for ClientError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ClientError::Recv(e) => Some(e),
            ClientError::Send(e) => Some(e),
            _ => None,
        }
    }
}

impl From<RecvError> for ClientError {
    fn from(value: RecvError) -> Self {
        Self::Recv(value)
    }
}

impl From<SendError> for ClientError {
    fn from(value: SendError) -> Self {
        Self::Send(value)
    }
}

/// One connection to the broker.
pub struct BrokerClient {
    rx: FrameReceiver<OwnedReadHalf>,
    tx: FrameSender<OwnedWriteHalf>,
    next_id: u64,
}

impl BrokerClient {
    /// Connects to the broker socket at `path` with the default frame size limit.
    pub async fn connect(path: impl AsRef<Path>) -> std::io::Result<Self> {
        Self::connect_with_limit(path, DEFAULT_MAX_MESSAGE_BYTES).await
    }

    pub async fn connect_with_limit(
        path: impl AsRef<Path>,
        max_len: usize,
    ) -> std::io::Result<Self> {
        let stream = UnixStream::connect(path).await?;
        let (rx, tx) = stream.into_split();
        let (rx, tx) = comms::channel(rx, tx, max_len);

        Ok(Self { rx, tx, next_id: 1 })
    }

    /// Sends `req` and waits for its response.
    ///
    /// A null `request_id` is replaced by the next number of this connection.
    ///
    /// # Returns
    /// The `result` payload of the response.
    pub async fn call(&mut self, mut req: Request) -> Result<Value, ClientError> {
        if req.request_id.is_null() {
            req.request_id = json!(self.next_id);
            self.next_id += 1;
        }

        self.tx.send(&req).await?;
        let res: Response = self.rx.recv().await?;

        if res.request_id != req.request_id {
            return Err(ClientError::Mismatch {
                sent: req.request_id,
                got: res.request_id,
            });
        }

        res.into_result().map_err(ClientError::Broker)
    }

    pub async fn ping(&mut self) -> Result<Value, ClientError> {
        self.call(Request::new(Action::Ping)).await
    }

    pub async fn status(&mut self) -> Result<Value, ClientError> {
        self.call(Request::new(Action::Status)).await
    }

    pub async fn load_model(
        &mut self,
        model_path: &str,
        model_type: &str,
        params: Map<String, Value>,
    ) -> Result<Value, ClientError> {
        let mut req = Request::for_model(Action::LoadModel, model_path, model_type);
        req.model_params = params;
        self.call(req).await
    }

    pub async fn infer(
        &mut self,
        model_path: &str,
        model_type: &str,
        input: Map<String, Value>,
    ) -> Result<Value, ClientError> {
        let mut req = Request::for_model(Action::Infer, model_path, model_type);
        req.input_data = input;
        self.call(req).await
    }

    pub async fn unload_model(
        &mut self,
        model_path: &str,
        model_type: &str,
    ) -> Result<Value, ClientError> {
        self.call(Request::for_model(Action::UnloadModel, model_path, model_type))
            .await
    }
}
