use crate::monitor::types::{ConnectionState, StreamStatusSnapshot};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

const STATUS_REPEAT_THROTTLE_MS: u64 = 500;

pub type StatusStore = Arc<RwLock<StreamStatusSnapshot>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub frames_applied: u64,
    pub frames_rejected: u64,
    pub last_frame_at: Option<DateTime<Utc>>,
}

/// Frame counters written by the ingest loop without taking the status lock.
#[derive(Debug, Default)]
pub struct StreamTelemetry {
    frames_applied: AtomicU64,
    frames_rejected: AtomicU64,
    has_last_frame_at: AtomicBool,
    last_frame_at_ms: AtomicI64,
}

impl StreamTelemetry {
    pub fn record_applied(&self, received_at: DateTime<Utc>) {
        self.frames_applied.fetch_add(1, Ordering::Relaxed);
        self.last_frame_at_ms
            .store(received_at.timestamp_millis(), Ordering::Relaxed);
        self.has_last_frame_at.store(true, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.frames_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            frames_applied: self.frames_applied.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            last_frame_at: if self.has_last_frame_at.load(Ordering::Relaxed) {
                DateTime::from_timestamp_millis(self.last_frame_at_ms.load(Ordering::Relaxed))
            } else {
                None
            },
        }
    }
}

#[derive(Debug, Default)]
pub struct StatusPublishThrottle {
    last_state: Option<ConnectionState>,
    last_reason: Option<String>,
    last_emit: Option<Instant>,
}

pub async fn publish_status(
    status_store: &StatusStore,
    telemetry: &StreamTelemetry,
    state: ConnectionState,
    stream_url: &str,
    reconnect_attempt: u32,
    reason: Option<String>,
) {
    let counters = telemetry.snapshot();
    match state {
        ConnectionState::Reconnecting | ConnectionState::Disconnected | ConnectionState::Error => {
            log::warn!(
                "stream {stream_url} {state:?}: {}",
                reason.as_deref().unwrap_or("-")
            );
        }
        _ => log::info!(
            "stream {stream_url} {state:?}: {}",
            reason.as_deref().unwrap_or("-")
        ),
    }

    let snapshot = StreamStatusSnapshot {
        state,
        stream_url: stream_url.to_string(),
        frames_applied: counters.frames_applied,
        frames_rejected: counters.frames_rejected,
        last_frame_at: counters.last_frame_at,
        reconnect_attempt,
        reason,
    };

    let mut writable = status_store.write().await;
    *writable = snapshot;
}

/// Copies the current frame counters into the stored snapshot, keeping its
/// state and reason.
pub async fn refresh_status_counters(status_store: &StatusStore, telemetry: &StreamTelemetry) {
    let counters = telemetry.snapshot();
    let mut writable = status_store.write().await;
    writable.frames_applied = counters.frames_applied;
    writable.frames_rejected = counters.frames_rejected;
    writable.last_frame_at = counters.last_frame_at;
}

/// Suppresses an identical state/reason pair repeated within the throttle window.
pub fn allow_status_publish(
    throttle: &Mutex<StatusPublishThrottle>,
    state: ConnectionState,
    reason: &Option<String>,
) -> bool {
    let mut writable = throttle.lock();
    let now = Instant::now();

    if writable.last_state == Some(state)
        && writable.last_reason == *reason
        && writable
            .last_emit
            .map(|instant| {
                now.duration_since(instant) < Duration::from_millis(STATUS_REPEAT_THROTTLE_MS)
            })
            .unwrap_or(false)
    {
        return false;
    }

    writable.last_state = Some(state);
    writable.last_reason = reason.clone();
    writable.last_emit = Some(now);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttles_repeated_identical_status() {
        let throttle = Mutex::new(StatusPublishThrottle::default());
        let reason = Some("websocket connect error".to_string());

        assert!(allow_status_publish(
            &throttle,
            ConnectionState::Reconnecting,
            &reason
        ));
        assert!(!allow_status_publish(
            &throttle,
            ConnectionState::Reconnecting,
            &reason
        ));
        assert!(allow_status_publish(
            &throttle,
            ConnectionState::Reconnecting,
            &Some("other".to_string())
        ));
        assert!(allow_status_publish(&throttle, ConnectionState::Live, &None));
    }

    #[test]
    fn telemetry_tracks_frames() {
        let telemetry = StreamTelemetry::default();
        assert_eq!(telemetry.snapshot(), TelemetrySnapshot::default());

        let received_at: DateTime<Utc> = "2024-10-01T10:00:00.250Z".parse().expect("timestamp");
        telemetry.record_applied(received_at);
        telemetry.record_rejected();
        telemetry.record_rejected();

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.frames_applied, 1);
        assert_eq!(snapshot.frames_rejected, 2);
        assert_eq!(snapshot.last_frame_at, Some(received_at));
    }

    #[tokio::test]
    async fn publish_status_copies_counters() {
        let store: StatusStore = Arc::new(RwLock::new(StreamStatusSnapshot::stopped(
            "ws://localhost:8080/ws".to_string(),
            None,
        )));
        let telemetry = StreamTelemetry::default();
        telemetry.record_rejected();

        publish_status(
            &store,
            &telemetry,
            ConnectionState::Live,
            "ws://localhost:8080/ws",
            0,
            Some("websocket connected".to_string()),
        )
        .await;

        let snapshot = store.read().await.clone();
        assert_eq!(snapshot.state, ConnectionState::Live);
        assert_eq!(snapshot.frames_rejected, 1);
        assert_eq!(snapshot.reason.as_deref(), Some("websocket connected"));
    }

    #[tokio::test]
    async fn refresh_keeps_state_and_updates_counters() {
        let store: StatusStore = Arc::new(RwLock::new(StreamStatusSnapshot::stopped(
            "ws://localhost:8080/ws".to_string(),
            None,
        )));
        let telemetry = StreamTelemetry::default();
        publish_status(
            &store,
            &telemetry,
            ConnectionState::Live,
            "ws://localhost:8080/ws",
            0,
            Some("websocket connected".to_string()),
        )
        .await;

        let received_at: DateTime<Utc> = "2024-10-01T10:00:01Z".parse().expect("timestamp");
        telemetry.record_applied(received_at);
        telemetry.record_applied(received_at);
        refresh_status_counters(&store, &telemetry).await;

        let snapshot = store.read().await.clone();
        assert_eq!(snapshot.state, ConnectionState::Live);
        assert_eq!(snapshot.reason.as_deref(), Some("websocket connected"));
        assert_eq!(snapshot.frames_applied, 2);
        assert_eq!(snapshot.last_frame_at, Some(received_at));
    }
}
