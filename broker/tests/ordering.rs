mod common;

use std::{sync::atomic::Ordering, time::Duration};

use futures::future::join_all;
use serde_json::{Map, json};

use common::{TestBroker, map};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_clients_never_overlap_on_the_device() {
    const CLIENTS: usize = 8;
    const ROUNDS: usize = 5;

    let broker = TestBroker::start().await;

    let mut clients = Vec::new();
    for _ in 0..CLIENTS {
        clients.push(broker.client().await);
    }

    let runs = clients.into_iter().enumerate().map(|(i, mut client)| async move {
        let path = format!("m{}", i % 3);

        for round in 0..ROUNDS {
            match (i + round) % 4 {
                0 => {
                    client.load_model(&path, "rec", Map::new()).await.unwrap();
                }
                3 => {
                    client.unload_model(&path, "rec").await.unwrap();
                }
                _ => {
                    let input = map(json!({"client": i, "round": round, "sleep_ms": 2}));
                    let out = client.infer(&path, "rec", input).await.unwrap();
                    assert_eq!(out["client"], json!(i));
                    assert_eq!(out["round"], json!(round));
                }
            }
        }
    });

    join_all(runs).await;

    let overlap = broker.overlap.clone();
    let events = broker.stop().await.all();

    assert!(!overlap.load(Ordering::SeqCst), "handler calls overlapped");
    assert_eq!(events.first().map(String::as_str), Some("acquire device"));
    assert_eq!(events.last().map(String::as_str), Some("release device"));

    // A model is never used or unloaded while absent, nor loaded twice in a row.
    let mut loaded = std::collections::HashSet::new();
    for event in &events[1..events.len() - 1] {
        let (op, path) = event.split_once(' ').unwrap();
        match op {
            "load" => assert!(loaded.insert(path), "{path} loaded twice"),
            "infer" => assert!(loaded.contains(path), "{path} used while unloaded"),
            "unload" => assert!(loaded.remove(path), "{path} unloaded while absent"),
            other => panic!("unexpected event {other}"),
        }
    }
    assert!(loaded.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ping_and_status_skip_the_queue() {
    const QUEUED: usize = 3;

    let broker = TestBroker::start().await;

    let mut blocker = broker.client().await;
    let blocked = tokio::spawn(async move {
        blocker
            .infer("slow", "rec", map(json!({"gate": true})))
            .await
            .unwrap()
    });

    while broker.events.count("infer slow") == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Enqueue one waiter at a time so their queue order is known.
    let mut observer = broker.client().await;
    let mut waiters = Vec::new();
    for i in 0..QUEUED {
        let mut client = broker.client().await;
        waiters.push(tokio::spawn(async move {
            client.infer("slow", "rec", map(json!({"tag": i}))).await.unwrap()
        }));

        let mut depth = 0;
        for _ in 0..200 {
            depth = observer.status().await.unwrap()["queue_depth"].as_u64().unwrap();
            if depth == i as u64 + 1 {
                break;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(depth, i as u64 + 1);
    }

    let pong = tokio::time::timeout(Duration::from_secs(1), observer.ping())
        .await
        .expect("ping waited behind the queue")
        .unwrap();
    assert_eq!(pong["pong"], json!(true));

    broker.gate.open();

    assert_eq!(blocked.await.unwrap(), json!({"gate": true}));
    for (i, waiter) in waiters.into_iter().enumerate() {
        assert_eq!(waiter.await.unwrap(), json!({"tag": i}));
    }

    let served: Vec<_> = broker
        .events
        .all()
        .into_iter()
        .filter(|e| e.starts_with("infer slow "))
        .collect();
    assert_eq!(served, ["infer slow 0", "infer slow 1", "infer slow 2"]);

    assert_eq!(observer.status().await.unwrap()["queue_depth"], json!(0));
    broker.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_requests_time_out_when_a_limit_is_set() {
    let broker = TestBroker::start_with(false, |cfg| {
        cfg.max_queue_wait = Some(Duration::from_millis(50));
    })
    .await;

    let mut blocker = broker.client().await;
    let blocked = tokio::spawn(async move {
        blocker.infer("slow", "rec", map(json!({"gate": true}))).await
    });

    // Wait until the gated call occupies the worker.
    let mut observer = broker.client().await;
    while broker.events.count("infer slow") == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let mut late = broker.client().await;
    let queued = tokio::spawn(async move { late.infer("slow", "rec", Map::new()).await });

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(observer.status().await.unwrap()["queue_depth"], json!(1));
    broker.gate.open();

    assert!(blocked.await.unwrap().is_ok());

    let err = queued.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), Some("QueueTimeout"));

    let events = broker.stop().await;
    assert_eq!(events.count("infer slow"), 1);
}
