use crate::monitor::aggregator::SharedAggregator;
use crate::monitor::ingest::{run_mock_producer, run_stream, StreamRuntimeContext};
use crate::monitor::keyset::build_frame;
use crate::monitor::loader::HistoricalLoader;
use crate::monitor::status::{
    publish_status, refresh_status_counters, StatusPublishThrottle, StatusStore, StreamTelemetry,
};
use crate::monitor::types::{
    ConnectionState, DashboardFrame, MonitorConfig, MonitorStartupMode, TimeRange,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const STATUS_HEARTBEAT_MS: u64 = 1_000;

pub type FrameSender = Arc<watch::Sender<DashboardFrame>>;

/// Everything one monitor session shares between its tasks.
#[derive(Clone)]
pub struct MonitorRuntime {
    pub config: MonitorConfig,
    pub aggregator: SharedAggregator,
    pub loader: Arc<HistoricalLoader>,
    pub status_store: StatusStore,
    pub frames: FrameSender,
}

pub async fn run_monitor(runtime: MonitorRuntime, cancel_token: CancellationToken) {
    let MonitorRuntime {
        config,
        aggregator,
        loader,
        status_store,
        frames,
    } = runtime;
    let telemetry = Arc::new(StreamTelemetry::default());
    let status_throttle = Mutex::new(StatusPublishThrottle::default());

    let history_window = Duration::from_secs(config.history_window_secs);
    let history_handle = match config.startup_mode {
        MonitorStartupMode::HistoryFirst => {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    publish_stopped(&status_store, &telemetry, &config.stream_url).await;
                    return;
                }
                _ = load_default_window(&loader, history_window) => {}
            }
            None
        }
        MonitorStartupMode::LiveFirst => {
            let history_loader = Arc::clone(&loader);
            let history_cancel = cancel_token.clone();
            Some(tokio::spawn(async move {
                tokio::select! {
                    _ = history_cancel.cancelled() => {}
                    _ = load_default_window(&history_loader, history_window) => {}
                }
            }))
        }
    };

    let publisher_handle = tokio::spawn(run_frame_publisher(
        Arc::clone(&aggregator),
        Arc::clone(&frames),
        config.emit_interval_ms,
        cancel_token.clone(),
    ));

    let heartbeat_cancel = cancel_token.clone();
    let heartbeat_status_store = Arc::clone(&status_store);
    let heartbeat_telemetry = Arc::clone(&telemetry);
    let heartbeat_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(STATUS_HEARTBEAT_MS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = heartbeat_cancel.cancelled() => break,
                _ = ticker.tick() => {
                    refresh_status_counters(&heartbeat_status_store, &heartbeat_telemetry).await;
                }
            }
        }
    });

    let stream_context = StreamRuntimeContext {
        config: &config,
        aggregator: &aggregator,
        telemetry: &telemetry,
        status_store: &status_store,
        status_throttle: &status_throttle,
        cancel_token: &cancel_token,
    };

    if config.mock_mode {
        run_mock_producer(&stream_context).await;
    } else {
        run_stream(&stream_context).await;
    }

    // With reconnect disabled the stream can end on its own; history and
    // frames stay available until the session is stopped.
    cancel_token.cancelled().await;
    let _ = publisher_handle.await;
    let _ = heartbeat_handle.await;
    if let Some(handle) = history_handle {
        let _ = handle.await;
    }

    publish_stopped(&status_store, &telemetry, &config.stream_url).await;
}

async fn publish_stopped(
    status_store: &StatusStore,
    telemetry: &StreamTelemetry,
    stream_url: &str,
) {
    publish_status(
        status_store,
        telemetry,
        ConnectionState::Stopped,
        stream_url,
        0,
        Some("monitor stopped".to_string()),
    )
    .await;
}

async fn load_default_window(loader: &HistoricalLoader, window: Duration) {
    let range = match TimeRange::last(window) {
        Ok(range) => range,
        Err(error) => {
            log::warn!("default history window rejected: {error}");
            return;
        }
    };

    if let Err(error) = loader.load_range(range).await {
        log::warn!("initial history unavailable: {error}");
    }
}

/// Publishes a frame per emit tick, only when the aggregator changed since the
/// last published frame.
pub async fn run_frame_publisher(
    aggregator: SharedAggregator,
    frames: FrameSender,
    emit_interval_ms: u64,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(emit_interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut published_revision: Option<u64> = None;

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => {
                let maybe_snapshot = {
                    let readable = aggregator.lock();
                    if published_revision == Some(readable.revision()) {
                        None
                    } else {
                        Some(readable.snapshot())
                    }
                };

                let Some(snapshot) = maybe_snapshot else {
                    continue;
                };

                published_revision = Some(snapshot.revision);
                let frame = build_frame(snapshot);
                log::debug!(
                    "publishing frame r{} with {} sources",
                    frame.revision,
                    frame.keys.len()
                );
                frames.send_replace(frame);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::aggregator::Aggregator;
    use crate::monitor::keyset::resolve_snapshot;
    use crate::monitor::loader::LoadOutcome;
    use crate::monitor::types::{
        group_latency_records, parse_live_frame, HistoryWindow, LatencyRecordWire,
        StartMonitorArgs,
    };
    use reqwest::Client;

    #[test]
    fn reconciles_history_and_live_end_to_end() {
        let config = StartMonitorArgs::default()
            .normalize()
            .expect("default config is valid");
        let aggregator = Aggregator::shared(config.live_capacity);
        let loader = HistoricalLoader::new(&config, Client::new(), Arc::clone(&aggregator));

        let records = vec![
            LatencyRecordWire {
                endpoint_id: "endpoint_1".to_string(),
                url: "/foo".to_string(),
                timestamp: "2024-10-01T10:00:00Z".parse().expect("t0"),
                latency_ms: 10.0,
            },
            LatencyRecordWire {
                endpoint_id: "endpoint_1".to_string(),
                url: "/foo".to_string(),
                timestamp: "2024-10-01T10:00:05Z".parse().expect("t1"),
                latency_ms: 12.0,
            },
        ];
        let window = HistoryWindow {
            series: group_latency_records(records).expect("records group"),
            distribution: Default::default(),
        };
        let ticket = loader.begin();
        assert!(matches!(
            loader.finish(ticket, Ok(window)),
            Ok(LoadOutcome::Applied { .. })
        ));

        for (second, latency) in [(10, 20), (15, 21), (20, 22)] {
            let mut payload = format!(
                r#"[{{"url":"/foo","timestamp":"2024-10-01T10:00:{second}Z","latency_ms":{latency}}}]"#
            )
            .into_bytes();
            let events = parse_live_frame(&mut payload).expect("frame parses");
            aggregator.lock().apply_live(&events);
        }

        let snapshot = aggregator.lock().snapshot();
        let historical: Vec<f64> = snapshot.historical["/foo"]
            .observations
            .iter()
            .map(|o| o.latency_ms)
            .collect();
        let live: Vec<f64> = snapshot.live["/foo"]
            .observations
            .iter()
            .map(|o| o.latency_ms)
            .collect();
        assert_eq!(historical, vec![10.0, 12.0]);
        assert_eq!(live, vec![20.0, 21.0, 22.0]);
        assert_eq!(resolve_snapshot(&snapshot), vec!["/foo".to_string()]);
    }

    #[tokio::test]
    async fn publisher_conflates_until_revision_changes() {
        let aggregator = Aggregator::shared(50);
        let (sender, mut receiver) = watch::channel(DashboardFrame::default());
        let frames = Arc::new(sender);
        let cancel_token = CancellationToken::new();

        aggregator
            .lock()
            .replace_historical("/foo", "endpoint_1", Vec::new());

        let handle = tokio::spawn(run_frame_publisher(
            Arc::clone(&aggregator),
            Arc::clone(&frames),
            10,
            cancel_token.clone(),
        ));

        receiver.changed().await.expect("first frame is published");
        let first = receiver.borrow_and_update().clone();
        assert_eq!(first.revision, 1);
        assert_eq!(first.keys, vec!["/foo".to_string()]);

        // No mutation: several ticks pass without a new frame.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!receiver.has_changed().expect("sender alive"));

        aggregator.lock().replace_distribution("/bar", Vec::new());
        receiver.changed().await.expect("second frame is published");
        let second = receiver.borrow_and_update().clone();
        assert_eq!(second.revision, 2);
        assert_eq!(second.keys, vec!["/bar".to_string(), "/foo".to_string()]);

        cancel_token.cancel();
        handle.await.expect("publisher exits cleanly");
    }
}
