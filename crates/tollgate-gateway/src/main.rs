use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

mod app;
mod envelope;
mod error;
mod http;
mod metrics;
mod ratelimit;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // load config: explicit path via TOLLGATE_CONFIG, else ./tollgate.toml
    let config_path = std::env::var("TOLLGATE_CONFIG").ok();
    let config = tollgate_core::config::TollgateConfig::load(config_path.as_deref())
        .unwrap_or_else(|e| {
            eprintln!("config load failed ({e}), using defaults");
            tollgate_core::config::TollgateConfig::default()
        });

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "tollgate={},tower_http=info",
                    config.gateway.log_level
                )
                .into()
            }),
        )
        .init();

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;

    let state = Arc::new(app::AppState::build(config).await?);
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!("tollgate gateway listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
