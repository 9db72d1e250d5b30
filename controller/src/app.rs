use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};

use greenhouse_common::SafetyConfig;

use crate::api::{self, AppState};
use crate::climate::ClimateController;
use crate::gateway::BoardGateway;
use crate::history::History;
use crate::light::LightScheduler;
use crate::predictor::Predictor;
use crate::store::Store;

const SAMPLE_TICK: Duration = Duration::from_secs(30);

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("GREENHOUSE_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.greenhouse"));
    let store = Store::new(data_dir.clone());
    let history = History::new(data_dir);

    let board_addr = std::env::var("BOARD_ADDR").unwrap_or_else(|_| "127.0.0.1:7777".to_string());
    let gateway = Arc::new(BoardGateway::new(board_addr.clone()));
    match gateway.ping().await {
        Ok(board) => info!(board, addr = board_addr.as_str(), "board connected"),
        // Degraded start: the loops retry on every tick.
        Err(err) => warn!(addr = board_addr.as_str(), "board not reachable yet: {err}"),
    }

    let config = SafetyConfig::default();
    let predictor = Arc::new(Predictor::new(history.clone()));
    let controller = Arc::new(ClimateController::new(
        Arc::clone(&gateway),
        store.clone(),
        history.clone(),
        Arc::clone(&predictor),
        config.clone(),
    ));
    if let Err(err) = controller.initialize().await {
        warn!("controller initialization incomplete: {err:#}");
    }

    let light = Arc::new(LightScheduler::new(
        Arc::clone(&gateway),
        store.clone(),
        history.clone(),
    ));
    if let Err(err) = light.initialize().await {
        warn!("light scheduler initialization incomplete: {err:#}");
    }

    let climate_task = controller.spawn();
    let sampler_task = controller.spawn_sampler(SAMPLE_TICK);
    let light_task = light.spawn(Duration::from_millis(config.light_tick_ms));

    let web_root = format!("{}/web", env!("CARGO_MANIFEST_DIR"));
    let app = api::router(
        AppState {
            controller: Arc::clone(&controller),
            light: Arc::clone(&light),
            gateway,
            store,
            history,
            predictor,
        },
        web_root,
    );

    let port = std::env::var("GREENHOUSE_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("shutting down");
    controller.shutdown().await;
    light.shutdown();
    for (name, task) in [
        ("climate", climate_task),
        ("sampler", sampler_task),
        ("light", light_task),
    ] {
        if tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .is_err()
        {
            warn!("{name} loop did not stop in time");
        }
    }
    Ok(())
}
