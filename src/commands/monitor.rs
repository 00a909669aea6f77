use crate::error::AppError;
use crate::monitor::aggregator::Aggregator;
use crate::monitor::keyset::build_frame;
use crate::monitor::loader::{HistoricalLoader, LoadOutcome};
use crate::monitor::pipeline::{run_monitor, MonitorRuntime};
use crate::monitor::types::{
    DashboardFrame, MonitorSession, MonitorStopResult, StartMonitorArgs, StreamStatusSnapshot,
    TimeRange,
};
use crate::state::{AppState, MonitorHandle};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

const HISTORY_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Starts a fresh session. A running session is stopped first and its state
/// discarded.
pub async fn start_monitor(
    state: &AppState,
    args: Option<StartMonitorArgs>,
) -> Result<MonitorSession, AppError> {
    let config = args.unwrap_or_default().normalize()?;
    let http_client = Client::builder()
        .timeout(Duration::from_secs(HISTORY_REQUEST_TIMEOUT_SECS))
        .build()?;

    // Held across the swap so concurrent starts and stops run one at a time.
    let mut monitor_slot = state.monitor.lock().await;
    if let Some(handle) = monitor_slot.take() {
        shutdown(handle).await;
    }

    let aggregator = Aggregator::shared(config.live_capacity);
    let loader = Arc::new(HistoricalLoader::new(
        &config,
        http_client,
        Arc::clone(&aggregator),
    ));
    state.frames.send_replace(DashboardFrame::default());

    let cancellation_token = CancellationToken::new();
    let runtime = MonitorRuntime {
        config: config.clone(),
        aggregator: Arc::clone(&aggregator),
        loader: Arc::clone(&loader),
        status_store: Arc::clone(&state.stream_status),
        frames: Arc::clone(&state.frames),
    };
    let join_handle = tokio::spawn(run_monitor(runtime, cancellation_token.clone()));

    *monitor_slot = Some(MonitorHandle {
        cancellation_token,
        join_handle,
        aggregator,
        loader,
    });
    drop(monitor_slot);

    log::info!(
        "monitor started (stream {}, api {}, mock {})",
        config.stream_url,
        config.api_base_url,
        config.mock_mode
    );
    Ok(MonitorSession::from_config(&config))
}

pub async fn stop_monitor(state: &AppState) -> Result<MonitorStopResult, AppError> {
    let mut monitor_slot = state.monitor.lock().await;
    let stopped = if let Some(handle) = monitor_slot.take() {
        shutdown(handle).await;
        true
    } else {
        false
    };

    state.frames.send_replace(DashboardFrame::default());
    Ok(MonitorStopResult { stopped })
}

async fn shutdown(handle: MonitorHandle) {
    handle.cancellation_token.cancel();
    if let Err(error) = handle.join_handle.await {
        log::error!("monitor task ended abnormally: {error}");
    }
    log::info!("monitor stopped");
}

pub async fn monitor_status(state: &AppState) -> Result<StreamStatusSnapshot, AppError> {
    let snapshot = state.stream_status.read().await.clone();
    Ok(snapshot)
}

pub async fn load_history_range(
    state: &AppState,
    range: TimeRange,
) -> Result<LoadOutcome, AppError> {
    let loader = {
        let monitor_slot = state.monitor.lock().await;
        let handle = monitor_slot.as_ref().ok_or(AppError::NotRunning)?;
        Arc::clone(&handle.loader)
    };
    loader.load_range(range).await
}

/// Loads a range given as picker input: RFC 3339 or local `YYYY-MM-DDTHH:MM`.
pub async fn load_history_between(
    state: &AppState,
    start: &str,
    end: &str,
) -> Result<LoadOutcome, AppError> {
    let range = TimeRange::parse(start, end)?;
    load_history_range(state, range).await
}

/// Builds a frame from the live aggregator, bypassing the emit interval.
pub async fn current_frame(state: &AppState) -> Result<DashboardFrame, AppError> {
    let monitor_slot = state.monitor.lock().await;
    let handle = monitor_slot.as_ref().ok_or(AppError::NotRunning)?;
    let snapshot = handle.aggregator.lock().snapshot();
    Ok(build_frame(snapshot))
}

pub fn subscribe_frames(state: &AppState) -> watch::Receiver<DashboardFrame> {
    state.frames.subscribe()
}
