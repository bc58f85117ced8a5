use idigna::config::Config;
use idigna::server::Gateway;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = Config::load()?;

    let mut gateway = Gateway::bind(&cfg)?;
    let shutdown = gateway.shutdown_handle();
    let mut task = tokio::task::spawn_blocking(move || gateway.run());

    tokio::select! {
        res = &mut task => {
            if let Err(e) = res? {
                tracing::error!("Gateway stopped: {:#}", e);
                return Err(e);
            }
        }

        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
            shutdown.trigger()?;
            task.await??;
        }
    }

    Ok(())
}
