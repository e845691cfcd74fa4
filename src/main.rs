use std::path::PathBuf;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use llm_proxy::{api, archive, config, observe, router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    config::init_config(config_path)?;

    let app_config = config::get_config().unwrap_or_default();

    // RUST_LOG wins; the config level is the fallback.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(app_config.logging.level.clone()));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();

    tracing::info!(
        "Starting llm-proxy with {} backends, default '{}'",
        app_config.backends.len(),
        config::configured_default()
    );

    router::init();

    if app_config.archive.enabled {
        let path = config::resolve_path(&app_config.archive.path);
        if let Err(e) = archive::init_archive(path) {
            tracing::error!("Archive disabled: {}", e);
        }
    }

    let metrics_host = if app_config.host.is_empty() {
        "0.0.0.0".to_string()
    } else {
        app_config.host.clone()
    };
    let metrics_port = app_config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = observe::metrics::serve(&metrics_host, metrics_port).await {
            tracing::error!("Metrics listener failed: {}", e);
        }
    });

    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            let _ = api::stop_server().await;
        }
    });

    api::start_server().await
}
