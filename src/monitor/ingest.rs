use crate::monitor::aggregator::SharedAggregator;
use crate::monitor::client::connect_metrics_stream;
use crate::monitor::status::{
    allow_status_publish, publish_status, StatusPublishThrottle, StatusStore, StreamTelemetry,
};
use crate::monitor::types::{parse_live_frame, ConnectionState, MetricEvent, MonitorConfig};
use crate::monitor::MOCK_SOURCES;
use chrono::Utc;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

const RECONNECT_BASE_DELAY_MS: u64 = 200;
const RECONNECT_MAX_EXPONENT: u32 = 6;
const MOCK_FRAME_INTERVAL_MS: u64 = 1_000;

pub struct StreamRuntimeContext<'a> {
    pub config: &'a MonitorConfig,
    pub aggregator: &'a SharedAggregator,
    pub telemetry: &'a StreamTelemetry,
    pub status_store: &'a StatusStore,
    pub status_throttle: &'a Mutex<StatusPublishThrottle>,
    pub cancel_token: &'a CancellationToken,
}

impl StreamRuntimeContext<'_> {
    async fn publish(&self, state: ConnectionState, reconnect_attempt: u32, reason: String) {
        publish_status(
            self.status_store,
            self.telemetry,
            state,
            &self.config.stream_url,
            reconnect_attempt,
            Some(reason),
        )
        .await;
    }

    async fn publish_throttled(
        &self,
        state: ConnectionState,
        reconnect_attempt: u32,
        reason: String,
    ) {
        let reason = Some(reason);
        if !allow_status_publish(self.status_throttle, state, &reason) {
            return;
        }
        publish_status(
            self.status_store,
            self.telemetry,
            state,
            &self.config.stream_url,
            reconnect_attempt,
            reason,
        )
        .await;
    }
}

enum StreamDirective {
    Continue,
    Closed,
}

/// Runs the websocket ingest loop until cancelled, or until the first
/// disconnect when reconnecting is disabled. Aggregator state is never
/// cleared on failure.
pub async fn run_stream(context: &StreamRuntimeContext<'_>) {
    let mut reconnect_attempt = 0_u32;
    let mut last_error: Option<String> = None;

    while !context.cancel_token.is_cancelled() {
        let (state, reason) = if reconnect_attempt == 0 {
            (
                ConnectionState::Connecting,
                "opening websocket stream".to_string(),
            )
        } else {
            (
                ConnectionState::Reconnecting,
                format!("reconnect attempt {reconnect_attempt}"),
            )
        };
        context.publish(state, reconnect_attempt, reason).await;

        let connect_result = tokio::select! {
            _ = context.cancel_token.cancelled() => break,
            result = connect_metrics_stream(&context.config.stream_url) => result,
        };

        match connect_result {
            Ok(mut websocket_stream) => {
                reconnect_attempt = 0;
                context
                    .publish(
                        ConnectionState::Live,
                        reconnect_attempt,
                        "websocket connected".to_string(),
                    )
                    .await;

                loop {
                    let frame = tokio::select! {
                        _ = context.cancel_token.cancelled() => break,
                        next_message = websocket_stream.next() => next_message,
                    };

                    let Some(frame_result) = frame else {
                        last_error = Some("websocket stream ended".to_string());
                        break;
                    };

                    match frame_result {
                        Ok(message) => match handle_message(message, context).await {
                            StreamDirective::Continue => {}
                            StreamDirective::Closed => {
                                last_error = Some("websocket closed by server".to_string());
                                break;
                            }
                        },
                        Err(error) => {
                            let reason = format!("websocket frame error: {error}");
                            context
                                .publish_throttled(
                                    ConnectionState::Reconnecting,
                                    reconnect_attempt,
                                    reason.clone(),
                                )
                                .await;
                            last_error = Some(reason);
                            break;
                        }
                    }
                }

                if context.cancel_token.is_cancelled() {
                    break;
                }
            }
            Err(error) => {
                let reason = format!("websocket connect error: {error}");
                context
                    .publish_throttled(
                        ConnectionState::Reconnecting,
                        reconnect_attempt,
                        reason.clone(),
                    )
                    .await;
                last_error = Some(reason);
            }
        }

        if !context.config.reconnect {
            let reason = last_error
                .take()
                .unwrap_or_else(|| "websocket disconnected".to_string());
            context
                .publish(
                    ConnectionState::Disconnected,
                    reconnect_attempt,
                    format!("{reason}; reconnect disabled"),
                )
                .await;
            return;
        }

        reconnect_attempt = reconnect_attempt.saturating_add(1);
        let delay = reconnect_delay(reconnect_attempt, context.config.reconnect_max_delay_ms);
        log::debug!("reconnecting in {} ms", delay.as_millis());
        tokio::select! {
            _ = context.cancel_token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn handle_message(message: Message, context: &StreamRuntimeContext<'_>) -> StreamDirective {
    let parsed = match message {
        Message::Text(text_payload) => {
            let mut owned_payload = text_payload.into_bytes();
            parse_live_frame(owned_payload.as_mut_slice())
        }
        Message::Binary(mut binary_payload) => parse_live_frame(binary_payload.as_mut_slice()),
        Message::Close(close_frame) => {
            log::debug!("close frame received: {close_frame:?}");
            return StreamDirective::Closed;
        }
        _ => return StreamDirective::Continue,
    };

    match parsed {
        Ok(events) => {
            apply_events(context.aggregator, &events);
            context.telemetry.record_applied(Utc::now());
            log::debug!("applied frame with {} metrics", events.len());
        }
        Err(error) => {
            context.telemetry.record_rejected();
            context
                .publish_throttled(
                    ConnectionState::Live,
                    0,
                    format!("dropped malformed metrics frame: {error}"),
                )
                .await;
        }
    }

    StreamDirective::Continue
}

fn apply_events(aggregator: &SharedAggregator, events: &[MetricEvent]) {
    let mut writable = aggregator.lock();
    writable.apply_live(events);
}

/// Deterministic in-process feed that stands in for the websocket.
pub async fn run_mock_producer(context: &StreamRuntimeContext<'_>) {
    context
        .publish(ConnectionState::Live, 0, "mock mode active".to_string())
        .await;

    let mut sequence = 0_u64;
    let mut ticker = tokio::time::interval(Duration::from_millis(MOCK_FRAME_INTERVAL_MS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = context.cancel_token.cancelled() => break,
            _ = ticker.tick() => {
                sequence = sequence.saturating_add(1);
                let events = build_mock_frame(sequence);
                apply_events(context.aggregator, &events);
                context.telemetry.record_applied(Utc::now());
            }
        }
    }
}

fn build_mock_frame(sequence: u64) -> Vec<MetricEvent> {
    let timestamp = Utc::now();
    MOCK_SOURCES
        .iter()
        .enumerate()
        .map(|(index, url)| {
            let failing = url.ends_with("503");
            MetricEvent {
                source_key: url.to_string(),
                timestamp,
                latency_ms: ((sequence * 97 + index as u64 * 131) % 500) as f64,
                status_code: Some(if failing { 503 } else { 200 }),
            }
        })
        .collect()
}

fn reconnect_delay(attempt: u32, max_delay_ms: u64) -> Duration {
    let exponent = attempt.min(RECONNECT_MAX_EXPONENT);
    let base_ms = RECONNECT_BASE_DELAY_MS.saturating_mul(1_u64 << exponent);
    let jitter_ms = u64::from(Utc::now().timestamp_subsec_millis()) % 250;
    Duration::from_millis((base_ms + jitter_ms).min(max_delay_ms))
}
