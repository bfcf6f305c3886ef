use std::{net::SocketAddr, sync::Arc};

use tokio::net::TcpListener;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use llm_stream_gateway::{AppConfig, Gateway, build_engine, build_router, config::LogFormat};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(AppConfig::from_env()?);
    init_tracing(&config);

    if !config.auth_enabled() {
        warn!("API_TOKEN is the default sentinel; bearer authentication is disabled");
    }
    tracing::info!(
        model_id = %config.model_id,
        mock = config.use_mock,
        rate_limit = %config.rate_limit,
        max_new_tokens_limit = config.max_new_tokens_limit,
        "starting generation gateway"
    );

    let engine = build_engine(config.as_ref())?;
    let gateway = Arc::new(Gateway::new(config.clone(), engine)?);
    let router = build_router(gateway);

    let listener = TcpListener::bind(config.listen_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "REST server ready");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

fn init_tracing(config: &AppConfig) {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let default_filter = format!("{},hyper=warn,axum::rejection=trace", config.log_level);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().flatten_event(true))
            .init(),
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().with_target(false).compact())
            .init(),
    }
}
