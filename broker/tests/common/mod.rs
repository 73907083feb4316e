#![allow(dead_code)]

use std::{
    io,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use broker::{
    BrokerClient, BrokerConfig, Device, DeviceProvider, HandlerRegistry, ModelHandler,
    handler::{EchoHandler, HandlerError, ModelHandle},
};
use parking_lot::{Condvar, Mutex};
use serde_json::{Map, Value};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Ordered log of everything the fakes observed.
#[derive(Clone, Default)]
pub struct Events(Arc<Mutex<Vec<String>>>);

impl Events {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().push(event.into());
    }

    pub fn all(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.0.lock().iter().filter(|e| *e == event).count()
    }
}

/// Blocks handler calls until opened.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    pub fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.cv.wait(&mut open);
        }
    }

    pub fn open(&self) {
        *self.open.lock() = true;
        self.cv.notify_all();
    }
}

/// Handler echoing its input while recording every call.
///
/// Inputs steer it: `{"gate": true}` parks the call on the gate,
/// `{"sleep_ms": n}` holds it for a while, `{"fail": true}` makes it fail.
/// A `{"tag": t}` input is appended to the recorded event. Models loaded
/// from the path `stuck` cannot be unloaded.
pub struct RecordingHandler {
    events: Events,
    gate: Arc<Gate>,
    busy: AtomicBool,
    overlap: Arc<AtomicBool>,
}

impl RecordingHandler {
    fn enter(&self) {
        if self.busy.swap(true, Ordering::SeqCst) {
            self.overlap.store(true, Ordering::SeqCst);
        }
    }

    fn leave(&self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

fn path_of(handle: &ModelHandle) -> String {
    handle.downcast_ref::<String>().cloned().unwrap_or_default()
}

impl ModelHandler for RecordingHandler {
    fn load(
        &self,
        _device: &Device,
        path: &str,
        params: &Map<String, Value>,
    ) -> Result<ModelHandle, HandlerError> {
        self.enter();
        self.events.push(format!("load {path}"));
        thread::sleep(Duration::from_millis(1));
        self.leave();

        if params.contains_key("fail") {
            return Err(HandlerError::failed("artifact is corrupt"));
        }

        Ok(Box::new(path.to_string()))
    }

    fn infer(
        &self,
        handle: &mut ModelHandle,
        input: &Map<String, Value>,
    ) -> Result<Value, HandlerError> {
        self.enter();
        match input.get("tag") {
            Some(tag) => self.events.push(format!("infer {} {tag}", path_of(handle))),
            None => self.events.push(format!("infer {}", path_of(handle))),
        }

        if input.contains_key("gate") {
            self.gate.wait();
        }

        let sleep = input.get("sleep_ms").and_then(Value::as_u64).unwrap_or(1);
        thread::sleep(Duration::from_millis(sleep));
        self.leave();

        if input.contains_key("fail") {
            return Err(HandlerError::failed("bad input"));
        }

        Ok(Value::Object(input.clone()))
    }

    fn unload(&self, handle: ModelHandle) -> Result<(), HandlerError> {
        let path = path_of(&handle);
        self.enter();
        self.events.push(format!("unload {path}"));
        self.leave();

        if path == "stuck" {
            return Err(HandlerError::failed("runtime refused to free memory"));
        }

        Ok(())
    }
}

struct Lease(Events);

impl Drop for Lease {
    fn drop(&mut self) {
        self.0.push("release device");
    }
}

/// Device provider that never touches hardware.
pub struct FakeDevice {
    events: Events,
    attempts: Arc<AtomicUsize>,
    fail: bool,
}

impl DeviceProvider for FakeDevice {
    fn acquire(&mut self) -> io::Result<Device> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.events.push("acquire device");

        if self.fail {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "/dev/fake0 is held by another process",
            ));
        }

        Ok(Device::new("fake0", Lease(self.events.clone())))
    }
}

/// A broker served from a temporary directory.
pub struct TestBroker {
    pub cfg: BrokerConfig,
    pub events: Events,
    pub gate: Arc<Gate>,
    pub overlap: Arc<AtomicBool>,
    pub attempts: Arc<AtomicUsize>,
    shutdown: CancellationToken,
    task: JoinHandle<io::Result<thread::JoinHandle<()>>>,
    _dir: TempDir,
}

impl TestBroker {
    pub async fn start() -> Self {
        Self::start_with(false, |_| {}).await
    }

    /// Starts a broker whose configuration was adjusted by `tweak`.
    ///
    /// The recording handler serves `echo` and `rec`, the built-in echo
    /// handler serves `tensor`.
    pub async fn start_with(fail_device: bool, tweak: impl FnOnce(&mut BrokerConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = BrokerConfig {
            socket_path: dir.path().join("run").join("broker.sock"),
            ..BrokerConfig::default()
        };
        tweak(&mut cfg);

        let events = Events::default();
        let gate = Arc::new(Gate::default());
        let overlap = Arc::new(AtomicBool::new(false));
        let attempts = Arc::new(AtomicUsize::new(0));

        let recorder = Arc::new(RecordingHandler {
            events: events.clone(),
            gate: gate.clone(),
            busy: AtomicBool::new(false),
            overlap: overlap.clone(),
        });

        let registry = HandlerRegistry::builder()
            .register("echo", Shared(recorder.clone()))
            .register("rec", Shared(recorder))
            .register("tensor", EchoHandler)
            .build();

        let provider = FakeDevice {
            events: events.clone(),
            attempts: attempts.clone(),
            fail: fail_device,
        };

        let shutdown = CancellationToken::new();
        let task = {
            let cfg = cfg.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { broker::serve(&cfg, registry, provider, shutdown).await })
        };

        Self {
            cfg,
            events,
            gate,
            overlap,
            attempts,
            shutdown,
            task,
            _dir: dir,
        }
    }

    pub fn socket_path(&self) -> PathBuf {
        self.cfg.socket_path.clone()
    }

    /// Connects a client, waiting for the socket to come up.
    pub async fn client(&self) -> BrokerClient {
        for _ in 0..200 {
            if let Ok(client) = BrokerClient::connect(&self.cfg.socket_path).await {
                return client;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        panic!("broker never came up on {}", self.cfg.socket_path.display());
    }

    /// Connects a raw stream, for tests that speak broken protocol.
    pub async fn raw(&self) -> tokio::net::UnixStream {
        // The client connection proves the listener is up.
        drop(self.client().await);
        tokio::net::UnixStream::connect(&self.cfg.socket_path).await.unwrap()
    }

    /// Stops the broker and waits for the worker to drain.
    pub async fn stop(self) -> Events {
        self.shutdown.cancel();

        let worker = self.task.await.unwrap().unwrap();
        tokio::task::spawn_blocking(move || worker.join().unwrap())
            .await
            .unwrap();

        self.events
    }

    /// Waits for a broker that is expected to fail during startup.
    ///
    /// # Returns
    /// The startup error and the events recorded once the worker drained.
    pub async fn failed(self) -> (io::Error, Events) {
        let err = match self.task.await.unwrap() {
            Ok(_) => panic!("broker started on {}", self.cfg.socket_path.display()),
            Err(e) => e,
        };

        (err, self.events)
    }
}

/// Lets one recording handler serve several model types.
struct Shared(Arc<RecordingHandler>);

impl ModelHandler for Shared {
    fn load(
        &self,
        device: &Device,
        path: &str,
        params: &Map<String, Value>,
    ) -> Result<ModelHandle, HandlerError> {
        self.0.load(device, path, params)
    }

    fn infer(
        &self,
        handle: &mut ModelHandle,
        input: &Map<String, Value>,
    ) -> Result<Value, HandlerError> {
        self.0.infer(handle, input)
    }

    fn unload(&self, handle: ModelHandle) -> Result<(), HandlerError> {
        self.0.unload(handle)
    }
}

/// Builds an `input_data`/`model_params` map from a JSON object literal.
pub fn map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}
