#![forbid(unsafe_code)]

use std::{env, net::SocketAddr, sync::Arc};

use mnemo_adapter::router;
use mnemo_os::config::GovernanceConfig;
use mnemo_os::governance::GovernanceRuntime;
use tracing_subscriber::EnvFilter;

const LOG_FILTER_ENV: &str = "MNEMO_LOG";
const LOG_FORMAT_ENV: &str = "MNEMO_LOG_FORMAT";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = GovernanceConfig::from_env()?;
    let addr: SocketAddr = config.http_bind.parse()?;
    let runtime = Arc::new(GovernanceRuntime::from_config(config)?);
    let app = router(runtime.clone());

    tracing::info!(target: "mnemo.http", %addr, "mnemo_adapter_http listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let verification = runtime.shutdown();
    if !verification.valid {
        tracing::error!(target: "mnemo.http", "audit chain failed verification at shutdown");
    }
    Ok(())
}

fn init_tracing() {
    let filter = env::var(LOG_FILTER_ENV).unwrap_or_else(|_| "info".to_string());
    let json = env::var(LOG_FORMAT_ENV)
        .map(|v| v.trim().eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let builder = tracing_subscriber::fmt().with_env_filter(EnvFilter::new(filter));
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::warn!(target: "mnemo.http", "ctrl_c handler unavailable; serving until killed");
        std::future::pending::<()>().await;
    }
    tracing::info!(target: "mnemo.http", "shutdown requested");
}
