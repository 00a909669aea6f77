use crate::error::AppError;
use crate::monitor::types::{
    group_latency_records, HistoryWindow, LatencyRecordWire, SourceSeries, StatusCount,
    StatusDistributionWire, TimeRange,
};
use reqwest::Client;
use std::collections::HashMap;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

pub type MetricsWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn range_endpoint(api_base_url: &str, path: &str, range: &TimeRange) -> String {
    format!(
        "{api_base_url}/{path}?startDate={}&endDate={}",
        range.start_param(),
        range.end_param()
    )
}

fn latency_endpoint(api_base_url: &str, range: &TimeRange) -> String {
    range_endpoint(api_base_url, "getlatency", range)
}

fn distribution_endpoint(api_base_url: &str, range: &TimeRange) -> String {
    range_endpoint(api_base_url, "statuscodedistribution", range)
}

pub async fn connect_metrics_stream(stream_url: &str) -> Result<MetricsWsStream, AppError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(16 << 20),
        max_frame_size: Some(4 << 20),
        ..Default::default()
    };

    let (stream, _) = connect_async_with_config(stream_url, Some(ws_config), true).await?;
    Ok(stream)
}

pub async fn fetch_latency_history(
    client: &Client,
    api_base_url: &str,
    range: &TimeRange,
) -> Result<HashMap<String, SourceSeries>, AppError> {
    let endpoint = latency_endpoint(api_base_url, range);
    let response = client.get(endpoint).send().await?.error_for_status()?;
    let payload = response.json::<Vec<LatencyRecordWire>>().await?;
    group_latency_records(payload)
}

pub async fn fetch_status_distribution(
    client: &Client,
    api_base_url: &str,
    range: &TimeRange,
) -> Result<HashMap<String, Vec<StatusCount>>, AppError> {
    let endpoint = distribution_endpoint(api_base_url, range);
    let response = client.get(endpoint).send().await?.error_for_status()?;
    let payload = response.json::<StatusDistributionWire>().await?;
    payload.try_into()
}

/// Both range queries run concurrently; either failing fails the window.
pub async fn fetch_history_window(
    client: &Client,
    api_base_url: &str,
    range: &TimeRange,
) -> Result<HistoryWindow, AppError> {
    let (series, distribution) = tokio::join!(
        fetch_latency_history(client, api_base_url, range),
        fetch_status_distribution(client, api_base_url, range)
    );
    Ok(HistoryWindow {
        series: series?,
        distribution: distribution?,
    })
}
