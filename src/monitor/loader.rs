use crate::error::{AppError, ErrorKind};
use crate::monitor::aggregator::SharedAggregator;
use crate::monitor::client::fetch_history_window;
use crate::monitor::types::{
    HistoryWindow, MonitorConfig, Observation, SourceSeries, StatusCount, TimeRange,
};
use crate::monitor::MOCK_SOURCES;
use chrono::{DateTime, Utc};
use reqwest::Client;

const MOCK_HISTORY_POINTS: i32 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Applied { ticket: u64, sources: usize },
    /// A newer request was issued while this one was in flight.
    Superseded { ticket: u64 },
}

pub struct HistoricalLoader {
    http_client: Client,
    api_base_url: String,
    mock_mode: bool,
    aggregator: SharedAggregator,
}

impl HistoricalLoader {
    pub fn new(config: &MonitorConfig, http_client: Client, aggregator: SharedAggregator) -> Self {
        Self {
            http_client,
            api_base_url: config.api_base_url.clone(),
            mock_mode: config.mock_mode,
            aggregator,
        }
    }

    pub async fn load(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<LoadOutcome, AppError> {
        let range = TimeRange::new(start, end)?;
        self.load_range(range).await
    }

    pub async fn load_range(&self, range: TimeRange) -> Result<LoadOutcome, AppError> {
        let ticket = self.begin();
        log::debug!(
            "history request #{ticket} for {} .. {}",
            range.start_param(),
            range.end_param()
        );

        let result = if self.mock_mode {
            Ok(build_mock_window(&range))
        } else {
            fetch_history_window(&self.http_client, &self.api_base_url, &range).await
        };
        self.finish(ticket, result)
    }

    /// Issues the ticket for a new request. Earlier tickets become stale.
    pub fn begin(&self) -> u64 {
        self.aggregator.lock().issue_history_ticket()
    }

    /// Applies a finished request. Failures leave the aggregator untouched.
    pub fn finish(
        &self,
        ticket: u64,
        result: Result<HistoryWindow, AppError>,
    ) -> Result<LoadOutcome, AppError> {
        let window = result.map_err(|error| {
            match error.kind() {
                ErrorKind::Parse => {
                    log::warn!("history request #{ticket} returned a malformed body: {error}")
                }
                _ => log::warn!(
                    "history request #{ticket} failed, keeping previous window: {error}"
                ),
            }
            error
        })?;

        let sources = window.series.len().max(window.distribution.len());
        let applied = self
            .aggregator
            .lock()
            .apply_history_window_if_current(ticket, window);

        if applied {
            log::info!("history request #{ticket} applied ({sources} sources)");
            Ok(LoadOutcome::Applied { ticket, sources })
        } else {
            log::debug!("history request #{ticket} superseded, response discarded");
            Ok(LoadOutcome::Superseded { ticket })
        }
    }
}

pub fn build_mock_window(range: &TimeRange) -> HistoryWindow {
    let span = range.end() - range.start();
    let step = span / MOCK_HISTORY_POINTS;
    let mut window = HistoryWindow::default();

    for (index, url) in MOCK_SOURCES.iter().enumerate() {
        let observations = (0..MOCK_HISTORY_POINTS)
            .map(|point| Observation {
                timestamp: range.start() + step * point,
                latency_ms: 40.0 + (index as f64 * 55.0) + f64::from((point * 37) % 90),
            })
            .collect();
        window.series.insert(
            url.to_string(),
            SourceSeries {
                source_key: url.to_string(),
                origin_label: format!("mock-endpoint-{}", index + 1),
                observations,
            },
        );

        let failing = url.ends_with("503");
        window.distribution.insert(
            url.to_string(),
            vec![StatusCount {
                status_code: if failing { 503 } else { 200 },
                count: MOCK_HISTORY_POINTS as u64,
            }],
        );
    }

    window
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::aggregator::Aggregator;
    use crate::monitor::types::StartMonitorArgs;

    fn mock_loader() -> (HistoricalLoader, SharedAggregator) {
        let config = StartMonitorArgs {
            mock_mode: Some(true),
            ..Default::default()
        }
        .normalize()
        .expect("mock config should be valid");
        let aggregator = Aggregator::shared(config.live_capacity);
        let loader = HistoricalLoader::new(&config, Client::new(), aggregator.clone());
        (loader, aggregator)
    }

    fn window_with(url: &str, label: &str) -> HistoryWindow {
        let mut window = HistoryWindow::default();
        window.series.insert(
            url.to_string(),
            SourceSeries {
                source_key: url.to_string(),
                origin_label: label.to_string(),
                observations: Vec::new(),
            },
        );
        window
    }

    fn sample_range() -> TimeRange {
        TimeRange::parse("2024-10-01T00:00:00Z", "2024-10-02T00:00:00Z")
            .expect("range should parse")
    }

    #[test]
    fn later_request_wins_when_it_resolves_first() {
        let (loader, aggregator) = mock_loader();
        let request_a = loader.begin();
        let request_b = loader.begin();

        let outcome_b = loader
            .finish(request_b, Ok(window_with("/b", "endpoint_b")))
            .expect("b should apply");
        let outcome_a = loader
            .finish(request_a, Ok(window_with("/a", "endpoint_a")))
            .expect("a resolves without error");

        assert_eq!(
            outcome_b,
            LoadOutcome::Applied {
                ticket: request_b,
                sources: 1
            }
        );
        assert_eq!(outcome_a, LoadOutcome::Superseded { ticket: request_a });
        let snapshot = aggregator.lock().snapshot();
        assert!(snapshot.historical.contains_key("/b"));
        assert!(!snapshot.historical.contains_key("/a"));
    }

    #[test]
    fn failed_request_keeps_previous_window() {
        let (loader, aggregator) = mock_loader();
        let first = loader.begin();
        loader
            .finish(first, Ok(window_with("/kept", "endpoint_1")))
            .expect("first window applies");
        let revision = aggregator.lock().revision();

        let second = loader.begin();
        let result = loader.finish(
            second,
            Err(AppError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "refused",
            ))),
        );

        assert!(result.is_err());
        let guard = aggregator.lock();
        assert_eq!(guard.revision(), revision);
        assert!(guard.snapshot().historical.contains_key("/kept"));
    }

    #[tokio::test]
    async fn invalid_range_fails_before_issuing_a_request() {
        let (loader, _aggregator) = mock_loader();
        let pending = loader.begin();
        let start: DateTime<Utc> = "2024-10-02T00:00:00Z".parse().expect("timestamp");
        let end: DateTime<Utc> = "2024-10-01T00:00:00Z".parse().expect("timestamp");

        let error = loader
            .load(start, end)
            .await
            .expect_err("reversed range must be rejected");
        assert!(matches!(error, AppError::InvalidRange { .. }));

        // No ticket was taken, so the pending request is still current.
        let outcome = loader
            .finish(pending, Ok(window_with("/foo", "endpoint_1")))
            .expect("pending request applies");
        assert!(matches!(outcome, LoadOutcome::Applied { .. }));
    }

    #[tokio::test]
    async fn mock_load_replaces_window_with_exact_sources() {
        let (loader, aggregator) = mock_loader();
        aggregator
            .lock()
            .replace_historical("/stale", "endpoint_0", Vec::new());

        let outcome = loader
            .load_range(sample_range())
            .await
            .expect("mock history should load");
        assert!(matches!(
            outcome,
            LoadOutcome::Applied { sources, .. } if sources == MOCK_SOURCES.len()
        ));

        let snapshot = aggregator.lock().snapshot();
        let mut keys: Vec<&String> = snapshot.historical.keys().collect();
        keys.sort();
        let mut expected: Vec<&str> = MOCK_SOURCES.to_vec();
        expected.sort();
        assert_eq!(keys, expected);

        for series in snapshot.historical.values() {
            assert_eq!(series.observations.len(), MOCK_HISTORY_POINTS as usize);
            assert!(series
                .observations
                .windows(2)
                .all(|pair| pair[0].timestamp < pair[1].timestamp));
        }
    }
}
