//! The Unix socket front of the broker.

use std::{
    fs::{self, Permissions},
    io,
    os::unix::fs::{FileTypeExt, PermissionsExt},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use comms::{
    RecvError, SendError,
    msg::{Action, Request, Response},
};
use log::{debug, info, warn};
use nix::unistd::{Gid, Group, chown};
use serde_json::{Value, json};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::UnixListener,
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::BrokerConfig,
    error::{BrokerError, Result},
    worker::{ModelRequest, WorkerHandle},
};

/// Answers requests, directly for `ping`/`status` and through the worker otherwise.
#[derive(Clone)]
pub struct Dispatcher {
    worker: WorkerHandle,
    started: Instant,
}

impl Dispatcher {
    pub fn new(worker: WorkerHandle) -> Self {
        Self {
            worker,
            started: Instant::now(),
        }
    }

    /// Produces the response to one decoded request document.
    pub async fn dispatch(&self, doc: Value) -> Response {
        let req = match Request::from_value(doc) {
            Ok(req) => req,
            Err((request_id, e)) => {
                let msg = format!("invalid request: {e}");
                return BrokerError::Protocol(msg).into_response(request_id);
            }
        };

        let request_id = req.request_id.clone();
        let action = req.action;

        match self.answer(req).await {
            Ok(result) => Response::ok(request_id, result),
            Err(e) => {
                debug!("{} answered with {}: {e}", action.as_str(), e.kind());
                e.into_response(request_id)
            }
        }
    }

    async fn answer(&self, req: Request) -> Result<Value> {
        match req.action {
            Action::Ping => Ok(json!({
                "pong": true,
                "uptime_s": self.uptime_s(),
            })),
            Action::Status => Ok(self.status()),
            Action::LoadModel | Action::Infer | Action::UnloadModel => {
                let job = ModelRequest::try_from(req)?;
                self.worker.submit(job).await
            }
        }
    }

    fn status(&self) -> Value {
        let snapshot = self.worker.snapshot();

        json!({
            "uptime_s": self.uptime_s(),
            "device_available": snapshot.device.available,
            "device": snapshot.device,
            "models": snapshot.models,
            "queue_depth": self.worker.queue_depth(),
        })
    }

    fn uptime_s(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

/// Serves one client connection until it closes or `shutdown` fires.
///
/// Requests on a connection are answered one at a time, in order.
///
/// # Arguments
/// * `rx` - The reading half of the connection.
/// * `tx` - The writing half of the connection.
/// * `max_len` - The frame size limit for both directions.
/// * `dispatcher` - Where decoded requests are answered.
/// * `shutdown` - Stops the connection between requests.
pub async fn serve_connection<R, W>(
    rx: R,
    tx: W,
    max_len: usize,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (mut rx, mut tx) = comms::channel(rx, tx, max_len);

    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = rx.recv::<Value>() => received,
        };

        let (res, close) = match received {
            Ok(doc) => (dispatcher.dispatch(doc).await, false),
            Err(RecvError::Closed) => break,
            Err(e) => {
                warn!("bad frame: {e}");
                let close = e.is_fatal();
                (BrokerError::Protocol(e.to_string()).into_response(Value::Null), close)
            }
        };

        match tx.send(&res).await {
            Err(SendError::TooLarge { len, max }) => {
                warn!("dropping a {len} byte response, limit is {max}");
                let msg = format!("response of {len} bytes exceeds the {max} byte limit");
                tx.send(&BrokerError::Protocol(msg).into_response(res.request_id)).await?;
            }
            other => other?,
        }

        if close {
            break;
        }
    }

    // The peer may already be gone.
    let _ = tx.shutdown().await;
    Ok(())
}

/// Listener bound to the broker socket path.
pub struct SocketServer {
    listener: UnixListener,
    path: PathBuf,
    max_len: usize,
    dispatcher: Dispatcher,
}

impl SocketServer {
    /// Prepares the socket file and starts listening on it.
    ///
    /// # Errors
    /// Fails if the path holds something other than a stale socket, if another
    /// broker is answering on it, or if the mode or group cannot be applied.
    pub fn bind(cfg: &BrokerConfig, worker: WorkerHandle) -> io::Result<Self> {
        let path = cfg.socket_path.clone();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        remove_stale(&path)?;

        let listener = UnixListener::bind(&path)?;
        fs::set_permissions(&path, Permissions::from_mode(cfg.socket_mode))?;

        if let Some(group) = &cfg.socket_group {
            let gid = resolve_group(group)?;
            chown(&path, None, Some(gid)).map_err(io::Error::from)?;
        }

        info!(
            socket = path.display().to_string().as_str(),
            mode = format!("{:o}", cfg.socket_mode).as_str();
            "listening"
        );

        Ok(Self {
            listener,
            path,
            max_len: cfg.max_message_bytes,
            dispatcher: Dispatcher::new(worker),
        })
    }

    pub fn local_path(&self) -> &Path {
        &self.path
    }

    /// Accepts connections until `shutdown` fires.
    ///
    /// On the way out the socket file is removed and every connection task is
    /// awaited, after which the worker handle held by the server is dropped.
    pub async fn run(self, shutdown: CancellationToken) -> io::Result<()> {
        let Self {
            listener,
            path,
            max_len,
            dispatcher,
        } = self;

        let mut conns = JoinSet::new();
        let mut next_id = 0usize;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                (stream, _) = next_conn(|| listener.accept()) => {
                    let conn_id = next_id;
                    next_id += 1;
                    debug!(conn_id = conn_id; "client connected");

                    let (rx, tx) = stream.into_split();
                    let dispatcher = dispatcher.clone();
                    let token = shutdown.child_token();

                    conns.spawn(async move {
                        if let Err(e) = serve_connection(rx, tx, max_len, dispatcher, token).await {
                            debug!(conn_id = conn_id; "connection ended with {e}");
                        }

                        debug!(conn_id = conn_id; "client disconnected");
                    });
                }
                Some(joined) = conns.join_next(), if !conns.is_empty() => {
                    if let Err(e) = joined {
                        warn!("connection task failed: {e}");
                    }
                }
            }
        }

        info!("no longer accepting connections");
        drop(listener);

        if let Err(e) = fs::remove_file(&path) {
            warn!("could not remove {}: {e}", path.display());
        }

        while let Some(joined) = conns.join_next().await {
            if let Err(e) = joined {
                warn!("connection task failed: {e}");
            }
        }

        Ok(())
    }
}

/// Pause after a failed accept.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Waits for the next connection, pausing after each failed accept.
///
/// Errors such as running out of file descriptors come back on every call,
/// retrying them at once would spin the accept loop.
async fn next_conn<T, F, Fut>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(conn) => return conn,
            Err(e) => {
                warn!("accept failed: {e}");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Clears a socket left behind by a previous broker.
fn remove_stale(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    if !meta.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path.display()),
        ));
    }

    if std::os::unix::net::UnixStream::connect(path).is_ok() {
        return Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("another broker is listening on {}", path.display()),
        ));
    }

    info!("removing stale socket {}", path.display());
    fs::remove_file(path)
}

fn resolve_group(group: &str) -> io::Result<Gid> {
    if let Ok(gid) = group.parse::<u32>() {
        return Ok(Gid::from_raw(gid));
    }

    match Group::from_name(group).map_err(io::Error::from)? {
        Some(group) => Ok(group.gid),
        None => Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("unknown group {group}"),
        )),
    }
}
