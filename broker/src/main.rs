use anyhow::Context;
use log::info;
use tokio::signal::{
    self,
    unix::{SignalKind, signal as unix_signal},
};
use tokio_util::sync::CancellationToken;

use broker::{BrokerConfig, ExclusiveNode, HandlerRegistry, handler::EchoHandler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = BrokerConfig::from_env()?;
    info!(
        device = cfg.device_path.display().to_string().as_str(),
        acquire = format!("{:?}", cfg.acquire).as_str();
        "starting broker"
    );

    let registry = HandlerRegistry::builder().register("echo", EchoHandler).build();
    let provider = ExclusiveNode::new(&cfg.device_path);

    let shutdown = CancellationToken::new();
    let mut sigterm = unix_signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = signal::ctrl_c() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }

        trigger.cancel();
    });

    let worker = broker::serve(&cfg, registry, provider, shutdown)
        .await
        .with_context(|| format!("serving on {}", cfg.socket_path.display()))?;

    info!("waiting for the worker to drain");
    tokio::task::spawn_blocking(move || worker.join())
        .await?
        .map_err(|_| anyhow::anyhow!("worker thread panicked"))?;

    info!("broker stopped");
    Ok(())
}
