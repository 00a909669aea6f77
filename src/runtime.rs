use crate::commands::monitor::{start_monitor, stop_monitor, subscribe_frames};
use crate::error::AppError;
use crate::monitor::types::{DashboardFrame, StartMonitorArgs};
use crate::state::AppState;

const ENV_API_URL: &str = "PULSEBOARD_API_URL";
const ENV_STREAM_URL: &str = "PULSEBOARD_STREAM_URL";
const ENV_MOCK: &str = "PULSEBOARD_MOCK";
const ENV_EMIT_INTERVAL_MS: &str = "PULSEBOARD_EMIT_INTERVAL_MS";
const ENV_HISTORY_WINDOW_SECS: &str = "PULSEBOARD_HISTORY_WINDOW_SECS";

pub fn run() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            log::error!("failed to start async runtime: {error}");
            std::process::exit(1);
        }
    };

    if let Err(error) = runtime.block_on(run_headless()) {
        log::error!("monitor exited: {error}");
        std::process::exit(1);
    }
}

/// Logs every published frame until Ctrl-C.
async fn run_headless() -> Result<(), AppError> {
    let state = AppState::new();
    let args = args_from_lookup(|key| std::env::var(key).ok())?;
    let mut frames = subscribe_frames(&state);
    let session = start_monitor(&state, Some(args)).await?;
    log::info!(
        "monitor running: keeping {} live samples per source, history window {}s",
        session.live_capacity,
        session.history_window_secs
    );

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(error) = signal {
                    log::warn!("ctrl-c handler unavailable: {error}");
                }
                break;
            }
            changed = frames.changed() => {
                if changed.is_err() {
                    break;
                }
                let frame = frames.borrow_and_update().clone();
                log::info!("frame r{} ({} sources)", frame.revision, frame.keys.len());
                for line in summarize_frame(&frame) {
                    log::info!("  {line}");
                }
            }
        }
    }

    stop_monitor(&state).await?;
    log::info!(
        "monitor shut down after {}s",
        state.started_at.elapsed().as_secs()
    );
    Ok(())
}

fn args_from_lookup<F>(lookup: F) -> Result<StartMonitorArgs, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    let read = |key: &str| {
        lookup(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };

    let mock_mode = match read(ENV_MOCK) {
        Some(value) => Some(parse_flag(ENV_MOCK, &value)?),
        None => None,
    };

    Ok(StartMonitorArgs {
        api_base_url: read(ENV_API_URL),
        stream_url: read(ENV_STREAM_URL),
        emit_interval_ms: parse_number(ENV_EMIT_INTERVAL_MS, read(ENV_EMIT_INTERVAL_MS))?,
        history_window_secs: parse_number(ENV_HISTORY_WINDOW_SECS, read(ENV_HISTORY_WINDOW_SECS))?,
        mock_mode,
        ..Default::default()
    })
}

fn parse_flag(key: &str, value: &str) -> Result<bool, AppError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(AppError::InvalidArgument(format!(
            "{key} must be a boolean flag, got '{value}'"
        ))),
    }
}

fn parse_number(key: &str, value: Option<String>) -> Result<Option<u64>, AppError> {
    value
        .map(|raw| {
            raw.parse::<u64>().map_err(|error| {
                AppError::InvalidArgument(format!("{key} must be an integer: {error}"))
            })
        })
        .transpose()
}

/// One line per source, in canonical key order.
fn summarize_frame(frame: &DashboardFrame) -> Vec<String> {
    frame
        .keys
        .iter()
        .map(|key| {
            let historical = frame
                .historical
                .get(key)
                .map(|series| series.observations.len())
                .unwrap_or(0);
            let live = frame.live.get(key);
            let live_count = live.map(|series| series.observations.len()).unwrap_or(0);
            let last_latency = live
                .and_then(|series| series.observations.last())
                .map(|observation| format!("{:.0}ms", observation.latency_ms))
                .unwrap_or_else(|| "-".to_string());
            let statuses = frame
                .distribution
                .get(key)
                .map(|counts| {
                    counts
                        .iter()
                        .map(|entry| format!("{}x{}", entry.status_code, entry.count))
                        .collect::<Vec<_>>()
                        .join(",")
                })
                .filter(|joined| !joined.is_empty())
                .unwrap_or_else(|| "-".to_string());

            format!(
                "{key} historical={historical} live={live_count} last={last_latency} status={statuses}"
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::types::{Observation, SourceSeries, StatusCount};
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let values: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| values.get(key).cloned()
    }

    #[test]
    fn reads_args_from_environment_values() {
        let args = args_from_lookup(lookup_from(&[
            (ENV_API_URL, "http://collector:8080"),
            (ENV_STREAM_URL, " ws://collector:8080/ws "),
            (ENV_MOCK, "true"),
            (ENV_EMIT_INTERVAL_MS, "100"),
        ]))
        .expect("env values are valid");

        assert_eq!(args.api_base_url.as_deref(), Some("http://collector:8080"));
        assert_eq!(args.stream_url.as_deref(), Some("ws://collector:8080/ws"));
        assert_eq!(args.mock_mode, Some(true));
        assert_eq!(args.emit_interval_ms, Some(100));
        assert_eq!(args.history_window_secs, None);
    }

    #[test]
    fn blank_environment_falls_back_to_defaults() {
        let args = args_from_lookup(lookup_from(&[(ENV_API_URL, "  ")])).expect("blank is unset");
        assert!(args.api_base_url.is_none());
        assert!(args.normalize().is_ok());
    }

    #[test]
    fn rejects_malformed_environment_values() {
        assert!(args_from_lookup(lookup_from(&[(ENV_MOCK, "maybe")])).is_err());
        assert!(args_from_lookup(lookup_from(&[(ENV_EMIT_INTERVAL_MS, "fast")])).is_err());
    }

    #[test]
    fn summarizes_sources_in_key_order() {
        let timestamp = "2024-10-01T10:00:00Z".parse().expect("timestamp");
        let mut frame = DashboardFrame {
            revision: 3,
            keys: vec!["/a".to_string(), "/b".to_string()],
            ..Default::default()
        };
        frame.live.insert(
            "/a".to_string(),
            SourceSeries {
                source_key: "/a".to_string(),
                origin_label: "/a".to_string(),
                observations: vec![Observation {
                    timestamp,
                    latency_ms: 41.6,
                }],
            },
        );
        frame.distribution.insert(
            "/b".to_string(),
            vec![
                StatusCount {
                    status_code: 200,
                    count: 9,
                },
                StatusCount {
                    status_code: 503,
                    count: 1,
                },
            ],
        );

        assert_eq!(
            summarize_frame(&frame),
            vec![
                "/a historical=0 live=1 last=42ms status=-".to_string(),
                "/b historical=0 live=0 last=- status=200x9,503x1".to_string(),
            ]
        );
    }
}
