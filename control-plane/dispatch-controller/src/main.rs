use dispatch_controller::{config::DispatchConfig, init_tracing, runtime};
use envconfig::Envconfig;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing("info");

    let cfg = DispatchConfig::init_from_env()?.validate()?;
    info!(?cfg, "Starting dispatch controller");

    let client = Client::try_default().await?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            runtime::shutdown_signal().await;
            shutdown.cancel();
        }
    });

    runtime::run_all(client, cfg, shutdown).await
}
