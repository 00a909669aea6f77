use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid time range: start {start} must be before end {end}")]
    InvalidRange { start: String, end: String },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("json decode error: {0}")]
    SimdJson(#[from] simd_json::Error),
    #[error("timestamp parse error: {0}")]
    Timestamp(#[from] chrono::ParseError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("monitor is not running")]
    NotRunning,
}

/// Coarse classification used to decide how a failure is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before any I/O; surfaced to the caller.
    Validation,
    /// A malformed frame or body; the offending unit is dropped.
    Parse,
    /// Request or connection failure; last-good state is kept.
    Transport,
    Lifecycle,
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) | Self::InvalidRange { .. } => ErrorKind::Validation,
            Self::Decode(_) | Self::SimdJson(_) | Self::Timestamp(_) => ErrorKind::Parse,
            Self::Request(error) if error.is_decode() => ErrorKind::Parse,
            Self::Io(_) | Self::Request(_) | Self::WebSocket(_) => ErrorKind::Transport,
            Self::NotRunning => ErrorKind::Lifecycle,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_validation_and_parse_errors() {
        let range = AppError::InvalidRange {
            start: "b".to_string(),
            end: "a".to_string(),
        };
        assert_eq!(range.kind(), ErrorKind::Validation);
        assert_eq!(AppError::Decode("bad".to_string()).kind(), ErrorKind::Parse);
        assert_eq!(AppError::NotRunning.kind(), ErrorKind::Lifecycle);
    }

    #[test]
    fn classifies_io_as_transport() {
        let error = AppError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert_eq!(error.kind(), ErrorKind::Transport);
    }
}
