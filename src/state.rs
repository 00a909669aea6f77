use crate::monitor::aggregator::SharedAggregator;
use crate::monitor::loader::HistoricalLoader;
use crate::monitor::pipeline::FrameSender;
use crate::monitor::status::StatusStore;
use crate::monitor::types::{DashboardFrame, StreamStatusSnapshot, DEFAULT_STREAM_URL};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct MonitorHandle {
    pub cancellation_token: CancellationToken,
    pub join_handle: JoinHandle<()>,
    pub aggregator: SharedAggregator,
    pub loader: Arc<HistoricalLoader>,
}

pub struct AppState {
    pub started_at: Instant,
    pub monitor: Mutex<Option<MonitorHandle>>,
    pub stream_status: StatusStore,
    pub frames: FrameSender,
}

impl AppState {
    pub fn new() -> Self {
        let stream_status = StreamStatusSnapshot::stopped(
            DEFAULT_STREAM_URL.to_string(),
            Some("monitor idle".to_string()),
        );
        let (frames, _) = watch::channel(DashboardFrame::default());

        Self {
            started_at: Instant::now(),
            monitor: Mutex::new(None),
            stream_status: Arc::new(RwLock::new(stream_status)),
            frames: Arc::new(frames),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}
