use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use reco_preview::config::ServiceConfig;
use reco_preview::fetch::HttpFetcher;
use reco_preview::server::{AppState, router};

#[tokio::main]
async fn main() -> ExitCode {
    let service = ServiceConfig::parse();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&service.log))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(service).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "reco-preview stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run(service: ServiceConfig) -> Result<(), Box<dyn std::error::Error>> {
    let config = service.proxy_config()?;
    let fetcher = HttpFetcher::new(&service.user_agent, Duration::from_secs(service.timeout_secs))?;
    let app = router(AppState::new(Arc::new(fetcher), config.clone(), service.cache_max_age));

    let listener = TcpListener::bind(service.bind).await?;
    info!(
        addr = %service.bind,
        endpoint = %config.endpoint,
        navigation = %config.navigation,
        scripts = %config.scripts,
        "reco-preview listening"
    );
    axum::serve(listener, app).await?;
    Ok(())
}
