//! A daemon owning one exclusive accelerator and serving inference to local clients.
//!
//! Clients talk to the broker over a Unix socket. Every device-touching request
//! is funneled through a single worker thread that owns the device and the
//! cache of loaded models.

pub mod cache;
pub mod client;
pub mod config;
pub mod device;
mod error;
pub mod handler;
pub mod server;
pub mod worker;

use std::{io, thread::JoinHandle};

use log::error;
use tokio_util::sync::CancellationToken;

pub use client::{BrokerClient, ClientError};
pub use config::{BrokerConfig, ConfigError};
pub use device::{AcquirePolicy, Device, DeviceProvider, ExclusiveNode};
pub use error::{BrokerError, Result};
pub use handler::{HandlerRegistry, ModelHandler};
pub use server::SocketServer;
pub use worker::WorkerOptions;

/// Runs the broker until `shutdown` fires.
///
/// Starts the worker, binds the socket and serves connections. Once the server
/// stops, its worker handles are gone and the worker drains its cache and
/// releases the device. If the socket cannot be bound, the worker is joined
/// before the error is returned.
///
/// # Arguments
/// * `cfg` - The daemon configuration.
/// * `registry` - The handlers available to clients.
/// * `provider` - How the device gets opened.
/// * `shutdown` - Cancelled to stop the broker.
///
/// # Returns
/// The worker thread, to be joined once the caller wants the drain finished.
pub async fn serve(
    cfg: &BrokerConfig,
    registry: HandlerRegistry,
    provider: impl DeviceProvider + 'static,
    shutdown: CancellationToken,
) -> io::Result<JoinHandle<()>> {
    let (worker, thread) = worker::spawn(registry, provider, WorkerOptions::from(cfg))?;
    let server = match SocketServer::bind(cfg, worker) {
        Ok(server) => server,
        Err(e) => {
            // The handle went down with the failed bind, so the worker is
            // already draining. Let it release the device before reporting.
            let joined = tokio::task::spawn_blocking(move || thread.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                error!("worker thread could not be joined after a failed bind");
            }
            return Err(e);
        }
    };

    server.run(shutdown).await?;
    Ok(thread)
}
