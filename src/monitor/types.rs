use crate::error::AppError;
use chrono::{
    DateTime, Duration as ChronoDuration, Local, NaiveDateTime, SecondsFormat, TimeZone, Utc,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8080";
pub const DEFAULT_STREAM_URL: &str = "ws://localhost:8080/ws";
pub const DEFAULT_LIVE_CAPACITY: usize = 50;
pub const DEFAULT_EMIT_INTERVAL_MS: u64 = 250;
pub const DEFAULT_RECONNECT: bool = true;
pub const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 5_000;
pub const DEFAULT_HISTORY_WINDOW_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_STARTUP_MODE: MonitorStartupMode = MonitorStartupMode::LiveFirst;
pub const DEFAULT_MOCK_MODE: bool = false;
pub const MIN_LIVE_CAPACITY: usize = 1;
pub const MAX_LIVE_CAPACITY: usize = 10_000;
pub const MIN_EMIT_INTERVAL_MS: u64 = 8;
pub const MAX_EMIT_INTERVAL_MS: u64 = 1_000;
pub const MIN_RECONNECT_MAX_DELAY_MS: u64 = 500;
pub const MAX_RECONNECT_MAX_DELAY_MS: u64 = 60_000;
pub const MIN_HISTORY_WINDOW_SECS: u64 = 60;
pub const MAX_HISTORY_WINDOW_SECS: u64 = 30 * 24 * 60 * 60;

const LOCAL_INPUT_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Live,
    Reconnecting,
    Disconnected,
    Stopped,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MonitorStartupMode {
    LiveFirst,
    HistoryFirst,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatusSnapshot {
    pub state: ConnectionState,
    pub stream_url: String,
    pub frames_applied: u64,
    pub frames_rejected: u64,
    pub last_frame_at: Option<DateTime<Utc>>,
    pub reconnect_attempt: u32,
    pub reason: Option<String>,
}

impl StreamStatusSnapshot {
    pub fn stopped(stream_url: String, reason: Option<String>) -> Self {
        Self {
            state: ConnectionState::Stopped,
            stream_url,
            frames_applied: 0,
            frames_rejected: 0,
            last_frame_at: None,
            reconnect_attempt: 0,
            reason,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartMonitorArgs {
    pub api_base_url: Option<String>,
    pub stream_url: Option<String>,
    pub live_capacity: Option<usize>,
    pub emit_interval_ms: Option<u64>,
    pub reconnect: Option<bool>,
    pub reconnect_max_delay_ms: Option<u64>,
    pub history_window_secs: Option<u64>,
    pub startup_mode: Option<MonitorStartupMode>,
    pub mock_mode: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub api_base_url: String,
    pub stream_url: String,
    pub live_capacity: usize,
    pub emit_interval_ms: u64,
    pub reconnect: bool,
    pub reconnect_max_delay_ms: u64,
    pub history_window_secs: u64,
    pub startup_mode: MonitorStartupMode,
    pub mock_mode: bool,
}

impl StartMonitorArgs {
    pub fn normalize(self) -> Result<MonitorConfig, AppError> {
        let api_base_url = normalize_base_url(
            self.api_base_url,
            DEFAULT_API_BASE_URL,
            &["http://", "https://"],
            "apiBaseUrl",
        )?;
        let stream_url = normalize_base_url(
            self.stream_url,
            DEFAULT_STREAM_URL,
            &["ws://", "wss://"],
            "streamUrl",
        )?;

        let live_capacity = self.live_capacity.unwrap_or(DEFAULT_LIVE_CAPACITY);
        if !(MIN_LIVE_CAPACITY..=MAX_LIVE_CAPACITY).contains(&live_capacity) {
            return Err(AppError::InvalidArgument(format!(
                "liveCapacity must be between {MIN_LIVE_CAPACITY} and {MAX_LIVE_CAPACITY}"
            )));
        }

        let emit_interval_ms = self.emit_interval_ms.unwrap_or(DEFAULT_EMIT_INTERVAL_MS);
        if !(MIN_EMIT_INTERVAL_MS..=MAX_EMIT_INTERVAL_MS).contains(&emit_interval_ms) {
            return Err(AppError::InvalidArgument(format!(
                "emitIntervalMs must be between {MIN_EMIT_INTERVAL_MS} and {MAX_EMIT_INTERVAL_MS}"
            )));
        }

        let reconnect = self.reconnect.unwrap_or(DEFAULT_RECONNECT);
        let reconnect_max_delay_ms = self
            .reconnect_max_delay_ms
            .unwrap_or(DEFAULT_RECONNECT_MAX_DELAY_MS);
        if !(MIN_RECONNECT_MAX_DELAY_MS..=MAX_RECONNECT_MAX_DELAY_MS)
            .contains(&reconnect_max_delay_ms)
        {
            return Err(AppError::InvalidArgument(format!(
                "reconnectMaxDelayMs must be between {MIN_RECONNECT_MAX_DELAY_MS} and {MAX_RECONNECT_MAX_DELAY_MS}"
            )));
        }

        let history_window_secs = self
            .history_window_secs
            .unwrap_or(DEFAULT_HISTORY_WINDOW_SECS);
        if !(MIN_HISTORY_WINDOW_SECS..=MAX_HISTORY_WINDOW_SECS).contains(&history_window_secs) {
            return Err(AppError::InvalidArgument(format!(
                "historyWindowSecs must be between {MIN_HISTORY_WINDOW_SECS} and {MAX_HISTORY_WINDOW_SECS}"
            )));
        }

        Ok(MonitorConfig {
            api_base_url,
            stream_url,
            live_capacity,
            emit_interval_ms,
            reconnect,
            reconnect_max_delay_ms,
            history_window_secs,
            startup_mode: self.startup_mode.unwrap_or(DEFAULT_STARTUP_MODE),
            mock_mode: self.mock_mode.unwrap_or(DEFAULT_MOCK_MODE),
        })
    }
}

fn normalize_base_url(
    value: Option<String>,
    default: &str,
    schemes: &[&str],
    field: &str,
) -> Result<String, AppError> {
    let url = value
        .unwrap_or_else(|| default.to_string())
        .trim()
        .trim_end_matches('/')
        .to_string();

    let has_host = schemes
        .iter()
        .find_map(|scheme| url.strip_prefix(scheme))
        .map(|rest| !rest.is_empty())
        .unwrap_or(false);
    if !has_host {
        return Err(AppError::InvalidArgument(format!(
            "{field} must start with one of {} and name a host",
            schemes.join(", ")
        )));
    }
    Ok(url)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSession {
    pub running: bool,
    pub api_base_url: String,
    pub stream_url: String,
    pub live_capacity: usize,
    pub emit_interval_ms: u64,
    pub reconnect: bool,
    pub history_window_secs: u64,
    pub startup_mode: MonitorStartupMode,
    pub mock_mode: bool,
}

impl MonitorSession {
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            running: true,
            api_base_url: config.api_base_url.clone(),
            stream_url: config.stream_url.clone(),
            live_capacity: config.live_capacity,
            emit_interval_ms: config.emit_interval_ms,
            reconnect: config.reconnect,
            history_window_secs: config.history_window_secs,
            startup_mode: config.startup_mode,
            mock_mode: config.mock_mode,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStopResult {
    pub stopped: bool,
}

/// Historical query window `[start, end)`, always in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, AppError> {
        if start >= end {
            return Err(AppError::InvalidRange {
                start: format_instant(start),
                end: format_instant(end),
            });
        }
        Ok(Self { start, end })
    }

    /// Converts wall-clock input in the local time zone, as produced by a
    /// `datetime-local` picker.
    pub fn from_local(start: NaiveDateTime, end: NaiveDateTime) -> Result<Self, AppError> {
        Self::new(local_to_utc(start)?, local_to_utc(end)?)
    }

    /// Accepts RFC 3339 instants or `YYYY-MM-DDTHH:MM[:SS]` local time.
    pub fn parse(start: &str, end: &str) -> Result<Self, AppError> {
        Self::new(parse_instant(start)?, parse_instant(end)?)
    }

    pub fn last(window: std::time::Duration) -> Result<Self, AppError> {
        let end = Utc::now();
        let span = ChronoDuration::from_std(window)
            .map_err(|error| AppError::InvalidArgument(format!("window too large: {error}")))?;
        Self::new(end - span, end)
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn start_param(&self) -> String {
        format_instant(self.start)
    }

    pub fn end_param(&self) -> String {
        format_instant(self.end)
    }
}

pub fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn local_to_utc(naive: NaiveDateTime) -> Result<DateTime<Utc>, AppError> {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| {
            AppError::InvalidArgument(format!("{naive} does not exist in the local time zone"))
        })
}

fn parse_instant(raw: &str) -> Result<DateTime<Utc>, AppError> {
    let trimmed = raw.trim();
    let rfc3339_error = match DateTime::parse_from_rfc3339(trimmed) {
        Ok(parsed) => return Ok(parsed.with_timezone(&Utc)),
        Err(error) => error,
    };

    for format in LOCAL_INPUT_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return local_to_utc(naive);
        }
    }
    Err(rfc3339_error.into())
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricEvent {
    pub source_key: String,
    pub timestamp: DateTime<Utc>,
    pub latency_ms: f64,
    pub status_code: Option<u16>,
}

impl MetricEvent {
    pub fn observation(&self) -> Observation {
        Observation {
            timestamp: self.timestamp,
            latency_ms: self.latency_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub timestamp: DateTime<Utc>,
    pub latency_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceSeries {
    pub source_key: String,
    pub origin_label: String,
    pub observations: Vec<Observation>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusCount {
    pub status_code: u16,
    pub count: u64,
}

/// One historical query result, grouped by source key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryWindow {
    pub series: HashMap<String, SourceSeries>,
    pub distribution: HashMap<String, Vec<StatusCount>>,
}

/// What the presenter renders: one snapshot plus the key order every view uses.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DashboardFrame {
    pub revision: u64,
    pub keys: Vec<String>,
    pub historical: HashMap<String, SourceSeries>,
    pub live: HashMap<String, SourceSeries>,
    pub distribution: HashMap<String, Vec<StatusCount>>,
}

#[derive(Debug, Deserialize)]
pub struct LiveMetricWire {
    pub url: String,
    pub timestamp: DateTime<Utc>,
    pub latency_ms: f64,
    #[serde(default)]
    pub status_code: Option<u16>,
}

impl TryFrom<LiveMetricWire> for MetricEvent {
    type Error = AppError;

    fn try_from(value: LiveMetricWire) -> Result<Self, Self::Error> {
        if value.url.trim().is_empty() {
            return Err(AppError::Decode("metric url must not be empty".to_string()));
        }
        validate_latency(value.latency_ms)?;

        Ok(Self {
            source_key: value.url,
            timestamp: value.timestamp,
            latency_ms: value.latency_ms,
            status_code: value.status_code,
        })
    }
}

/// Parses one stream frame. Any bad entry rejects the whole frame.
pub fn parse_live_frame(payload: &mut [u8]) -> Result<Vec<MetricEvent>, AppError> {
    let wire: Vec<LiveMetricWire> = simd_json::serde::from_slice(payload)?;
    wire.into_iter().map(MetricEvent::try_from).collect()
}

#[derive(Debug, Deserialize)]
pub struct LatencyRecordWire {
    pub endpoint_id: String,
    pub url: String,
    pub timestamp: DateTime<Utc>,
    pub latency_ms: f64,
}

/// Groups latency rows by url, keeping response order inside each series.
pub fn group_latency_records(
    records: Vec<LatencyRecordWire>,
) -> Result<HashMap<String, SourceSeries>, AppError> {
    let mut series: HashMap<String, SourceSeries> = HashMap::new();
    for record in records {
        validate_latency(record.latency_ms)?;
        let entry = series
            .entry(record.url.clone())
            .or_insert_with(|| SourceSeries {
                source_key: record.url,
                origin_label: record.endpoint_id,
                observations: Vec::new(),
            });
        entry.observations.push(Observation {
            timestamp: record.timestamp,
            latency_ms: record.latency_ms,
        });
    }
    Ok(series)
}

/// The collector answers an empty range with `[]` instead of `{}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum StatusDistributionWire {
    ByUrl(HashMap<String, Vec<StatusCount>>),
    Empty(Vec<serde::de::IgnoredAny>),
}

impl TryFrom<StatusDistributionWire> for HashMap<String, Vec<StatusCount>> {
    type Error = AppError;

    fn try_from(value: StatusDistributionWire) -> Result<Self, Self::Error> {
        match value {
            StatusDistributionWire::ByUrl(by_url) => Ok(by_url),
            StatusDistributionWire::Empty(entries) if entries.is_empty() => Ok(HashMap::new()),
            StatusDistributionWire::Empty(entries) => Err(AppError::Decode(format!(
                "expected status distribution object, got array of {}",
                entries.len()
            ))),
        }
    }
}

fn validate_latency(latency_ms: f64) -> Result<(), AppError> {
    if !latency_ms.is_finite() || latency_ms < 0.0 {
        return Err(AppError::Decode("latency_ms must be finite and non-negative".to_string()));
    }
    Ok(())
}
