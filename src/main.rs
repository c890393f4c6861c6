use tracing_subscriber::EnvFilter;
use video_cache_proxy::{ProxyConfig, ProxyServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let server = ProxyServer::new(ProxyConfig::default());
    let addr = server.start().await?;
    tracing::info!(%addr, "ready; route player URLs through proxy_url()");

    tokio::signal::ctrl_c().await?;
    server.shutdown();
    Ok(())
}
