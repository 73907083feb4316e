//! The single consumer of the request queue.
//!
//! Every call into a handler and every touch of the device happens on the one
//! dedicated thread running `RequestWorker::run`, in the order requests were
//! queued. Connections hand in a `Job` carrying its own completion channel and
//! wait on it, so waiting is per connection and never blocks the I/O tasks.

use std::{
    any::Any,
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use comms::msg::{Action, Request};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::sync::{mpsc, oneshot, watch};

use crate::{
    cache::{CacheKey, ModelCache, ModelEntry, ModelSummary},
    config::BrokerConfig,
    device::{AcquirePolicy, DeviceOwner, DeviceProvider, DeviceStatus},
    error::{BrokerError, Result},
    handler::{HandlerError, HandlerRegistry},
};

/// The device-touching operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelOp {
    Load,
    Infer,
    Unload,
}

/// A request bound for the worker queue.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub op: ModelOp,
    pub key: CacheKey,
    pub params: Map<String, Value>,
    pub input: Map<String, Value>,
}

impl ModelRequest {
    pub fn new(op: ModelOp, key: CacheKey) -> Self {
        Self {
            op,
            key,
            params: Map::new(),
            input: Map::new(),
        }
    }
}

impl TryFrom<Request> for ModelRequest {
    type Error = BrokerError;

    fn try_from(req: Request) -> Result<Self> {
        let op = match req.action {
            Action::LoadModel => ModelOp::Load,
            Action::Infer => ModelOp::Infer,
            Action::UnloadModel => ModelOp::Unload,
            other => {
                return Err(BrokerError::Protocol(format!(
                    "{} is not a model action",
                    other.as_str()
                )));
            }
        };

        let action = req.action.as_str();
        let missing = |field: &str| BrokerError::Protocol(format!("{action} requires {field}"));

        let model_path = req.model_path.ok_or_else(|| missing("model_path"))?;
        let model_type = req.model_type.ok_or_else(|| missing("model_type"))?;

        Ok(Self {
            op,
            key: CacheKey::new(model_path, model_type),
            params: req.model_params,
            input: req.input_data,
        })
    }
}

/// Worker tuning taken from the daemon configuration.
#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    pub acquire: AcquirePolicy,
    pub max_queue_wait: Option<Duration>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            acquire: AcquirePolicy::Eager,
            max_queue_wait: None,
        }
    }
}

impl From<&BrokerConfig> for WorkerOptions {
    fn from(cfg: &BrokerConfig) -> Self {
        Self {
            acquire: cfg.acquire,
            max_queue_wait: cfg.max_queue_wait,
        }
    }
}

/// Device and cache state as last published by the worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub device: DeviceStatus,
    pub models: Vec<ModelSummary>,
}

struct Job {
    request: ModelRequest,
    enqueued_at: Instant,
    reply: oneshot::Sender<Result<Value>>,
}

/// Cloneable submit side of the worker queue.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::UnboundedSender<Job>,
    depth: Arc<AtomicUsize>,
    snapshot: watch::Receiver<WorkerSnapshot>,
}

impl WorkerHandle {
    /// Queues `request` and waits for the worker's result.
    ///
    /// # Errors
    /// The per-request error, or `ShuttingDown` if the worker is gone.
    pub async fn submit(&self, request: ModelRequest) -> Result<Value> {
        let (reply, result) = oneshot::channel();
        let job = Job {
            request,
            enqueued_at: Instant::now(),
            reply,
        };

        self.depth.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(job).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(BrokerError::ShuttingDown);
        }

        result.await.unwrap_or(Err(BrokerError::ShuttingDown))
    }

    /// Amount of jobs queued and not yet picked up by the worker.
    pub fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        self.snapshot.borrow().clone()
    }
}

/// Owner of the device and the model cache.
pub struct RequestWorker {
    registry: HandlerRegistry,
    cache: ModelCache,
    device: DeviceOwner,
    options: WorkerOptions,
    depth: Arc<AtomicUsize>,
    snapshot: watch::Sender<WorkerSnapshot>,
}

/// Starts the worker on its own thread.
///
/// The worker runs until every `WorkerHandle` is dropped, then unloads all
/// cached models and releases the device.
///
/// # Returns
/// The submit handle and the worker thread's join handle.
pub fn spawn(
    registry: HandlerRegistry,
    provider: impl DeviceProvider + 'static,
    options: WorkerOptions,
) -> io::Result<(WorkerHandle, JoinHandle<()>)> {
    let device = DeviceOwner::new(provider);
    let (snapshot_tx, snapshot_rx) = watch::channel(WorkerSnapshot {
        device: device.status(),
        models: Vec::new(),
    });

    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));

    let worker = RequestWorker {
        registry,
        cache: ModelCache::new(),
        device,
        options,
        depth: depth.clone(),
        snapshot: snapshot_tx,
    };

    let thread = thread::Builder::new()
        .name("broker-worker".into())
        .spawn(move || worker.run(rx))?;

    let handle = WorkerHandle {
        tx,
        depth,
        snapshot: snapshot_rx,
    };

    Ok((handle, thread))
}

impl RequestWorker {
    fn run(mut self, mut rx: mpsc::UnboundedReceiver<Job>) {
        info!(
            handlers = self.registry.model_types().join(",").as_str();
            "worker started"
        );

        if self.options.acquire == AcquirePolicy::Eager {
            // A failure is kept by the owner and reported per request.
            let _ = self.device.acquire();
            self.publish();
        }

        while let Some(job) = rx.blocking_recv() {
            self.depth.fetch_sub(1, Ordering::SeqCst);

            let Job {
                request,
                enqueued_at,
                reply,
            } = job;

            let res = self.process(request, enqueued_at.elapsed());
            if reply.send(res).is_err() {
                debug!("requester went away before its result was ready");
            }
        }

        self.shutdown();
    }

    /// Executes one queued request.
    ///
    /// # Arguments
    /// * `request` - The request to run.
    /// * `waited` - How long the request sat in the queue.
    fn process(&mut self, request: ModelRequest, waited: Duration) -> Result<Value> {
        if let Some(limit) = self.options.max_queue_wait
            && waited > limit
        {
            warn!(
                "{} on {} dropped after {} ms in the queue",
                op_name(request.op),
                request.key,
                waited.as_millis()
            );
            return Err(BrokerError::QueueTimeout { waited, limit });
        }

        let ModelRequest {
            op,
            key,
            params,
            input,
        } = request;

        let res = match op {
            ModelOp::Load => self.load(&key, &params).map(|_| json!({ "loaded": true })),
            ModelOp::Infer => self.infer(&key, &params, &input),
            ModelOp::Unload => Ok(self.unload(&key)),
        };

        if let Err(e) = &res {
            warn!("{} on {key} failed: {e}", op_name(op));
        }

        self.publish();
        res
    }

    /// Returns the cached entry for `key`, loading it on a miss.
    fn load(&mut self, key: &CacheKey, params: &Map<String, Value>) -> Result<&mut ModelEntry> {
        let handler = self.registry.resolve(&key.model_type)?;
        let device = self.device.acquire()?;

        let start = Instant::now();
        let (entry, fresh) = self.cache.get_or_try_insert_with(key, || {
            contain(|| handler.load(device, &key.model_path, params))
                .map(|handle| ModelEntry::new(handler.clone(), handle))
                .map_err(|e| match e {
                    HandlerError::Tensor(e) => BrokerError::from(e),
                    other => BrokerError::LoadFailure(other.to_string()),
                })
        })?;

        if fresh {
            info!(
                model_path = key.model_path.as_str(),
                model_type = key.model_type.as_str(),
                elapsed_ms = start.elapsed().as_millis() as u64;
                "model loaded"
            );
        }

        Ok(entry)
    }

    fn infer(
        &mut self,
        key: &CacheKey,
        params: &Map<String, Value>,
        input: &Map<String, Value>,
    ) -> Result<Value> {
        let entry = self.load(key, params)?;
        entry.touch();

        let handler = entry.handler.clone();
        match contain(|| handler.infer(&mut entry.handle, input)) {
            Ok(output) => Ok(output),
            Err(HandlerError::Failed(msg)) => Err(BrokerError::InferenceFailure(msg)),
            Err(HandlerError::Tensor(e)) => Err(BrokerError::from(e)),
            Err(e @ (HandlerError::HandleLost(_) | HandlerError::Panicked(_))) => {
                warn!("evicting {key}, its handle is no longer usable");
                if let Some(entry) = self.cache.remove(key) {
                    let _ = release_entry(key, entry);
                }

                Err(BrokerError::InferenceFailure(e.to_string()))
            }
        }
    }

    fn unload(&mut self, key: &CacheKey) -> Value {
        let Some(entry) = self.cache.remove(key) else {
            debug!("{key} is not loaded, nothing to unload");
            return json!({ "unloaded": true });
        };

        match release_entry(key, entry) {
            Ok(()) => {
                info!("unloaded {key}");
                json!({ "unloaded": true })
            }
            Err(e) => json!({ "unloaded": true, "warning": format!("UnloadFailure: {e}") }),
        }
    }

    /// Unloads every cached model, then releases the device.
    fn shutdown(mut self) {
        if !self.cache.is_empty() {
            info!("worker draining {} cached model(s)", self.cache.len());
        }

        for (key, entry) in self.cache.drain() {
            let _ = release_entry(&key, entry);
        }

        self.device.release();
        self.publish();
    }

    fn publish(&self) {
        self.snapshot.send_replace(WorkerSnapshot {
            device: self.device.status(),
            models: self.cache.summaries(),
        });
    }
}

/// Best-effort unload, failures are logged and handed back.
fn release_entry(key: &CacheKey, entry: ModelEntry) -> std::result::Result<(), HandlerError> {
    let ModelEntry { handler, handle, .. } = entry;

    contain(|| handler.unload(handle)).inspect_err(|e| {
        error!("unloading {key} failed: {e}");
    })
}

/// Runs a handler call, turning a panic into `HandlerError::Panicked`.
///
/// Handlers are foreign code; a panic in one of them must not take the
/// worker thread down with it.
fn contain<T>(
    call: impl FnOnce() -> std::result::Result<T, HandlerError>,
) -> std::result::Result<T, HandlerError> {
    panic::catch_unwind(AssertUnwindSafe(call))
        .unwrap_or_else(|payload| Err(HandlerError::Panicked(panic_message(payload.as_ref()))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn op_name(op: ModelOp) -> &'static str {
    match op {
        ModelOp::Load => "load_model",
        ModelOp::Infer => "infer",
        ModelOp::Unload => "unload_model",
    }
}
