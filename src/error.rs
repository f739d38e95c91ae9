//! Error types for the exception reporter
//!
//! Every variant is non-fatal for the host application: failures are caught
//! inside the reporter, written to the local `tracing` side channel and
//! dropped. The only exception is [`ReportError::Raised`], which test mode
//! hands back to the caller on purpose.

use thiserror::Error;

/// Boxed cause attached to the taxonomy variants.
pub type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for reporting operations
#[derive(Error, Debug)]
pub enum ReportError {
    /// Building or submitting a record for a real application error failed
    #[error("Capture failed: {message}")]
    Capture {
        message: String,
        #[source]
        source: Option<Cause>,
    },

    /// One environment field or trace section could not be rendered
    #[error("Formatting failed: {message}")]
    Formatting {
        message: String,
        #[source]
        source: Option<Cause>,
    },

    /// The notifier rejected or failed to send a record
    #[error("Delivery failed: {message}")]
    Delivery {
        message: String,
        #[source]
        source: Option<Cause>,
    },

    /// A `debug`/`info`/`warning`/`error` call could not be completed
    #[error("Reporting API failed: {message}")]
    ReportingApi {
        message: String,
        #[source]
        source: Option<Cause>,
    },

    /// Test mode: the would-be report, raised synchronously instead of delivered
    #[error("[{category}] {message}{}", .cause.as_ref().map(|c| format!(" ({c})")).unwrap_or_default())]
    Raised {
        category: String,
        message: String,
        cause: Option<String>,
    },

    /// A configuration value was rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Socket or other I/O failure
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    /// JSON serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Backend answered with a non-success status code
    #[error("Failed to send record: HTTP {0}")]
    SendFailed(reqwest::StatusCode),

    /// The delivery queue is at capacity; the record was dropped
    #[error("Delivery queue is full")]
    QueueFull,

    /// The delivery worker has shut down
    #[error("Delivery channel is closed")]
    ChannelClosed,
}

impl ReportError {
    pub fn capture(message: impl Into<String>, source: Option<Cause>) -> Self {
        ReportError::Capture {
            message: message.into(),
            source,
        }
    }

    pub fn formatting(message: impl Into<String>) -> Self {
        ReportError::Formatting {
            message: message.into(),
            source: None,
        }
    }

    pub fn delivery(message: impl Into<String>, source: Option<Cause>) -> Self {
        ReportError::Delivery {
            message: message.into(),
            source,
        }
    }

    pub fn reporting_api(message: impl Into<String>, source: Option<Cause>) -> Self {
        ReportError::ReportingApi {
            message: message.into(),
            source,
        }
    }

    /// Create a reporting error from a plain message
    pub fn from_string(msg: impl Into<String>) -> Self {
        ReportError::reporting_api(msg, None)
    }

    /// Short label used as a structured field in side-channel logs
    pub fn kind(&self) -> &'static str {
        match self {
            ReportError::Capture { .. } => "capture",
            ReportError::Formatting { .. } => "formatting",
            ReportError::Delivery { .. }
            | ReportError::Network(_)
            | ReportError::Serialization(_)
            | ReportError::Http(_)
            | ReportError::SendFailed(_) => "delivery",
            ReportError::ReportingApi { .. } => "reporting_api",
            ReportError::Raised { .. } => "raised",
            ReportError::InvalidConfig(_) => "config",
            ReportError::QueueFull | ReportError::ChannelClosed => "queue",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_display() {
        let err = ReportError::QueueFull;
        assert!(err.to_string().contains("full"));

        let err = ReportError::from_string("test error");
        assert_eq!(err.to_string(), "Reporting API failed: test error");
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<()>("invalid").unwrap_err();
        let err: ReportError = json_err.into();
        assert!(matches!(err, ReportError::Serialization(_)));
        assert_eq!(err.kind(), "delivery");
    }

    #[test]
    fn test_capture_keeps_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "socket gone");
        let err = ReportError::capture("could not enqueue", Some(Box::new(io) as Cause));
        assert_eq!(err.kind(), "capture");
        assert_eq!(err.source().unwrap().to_string(), "socket gone");
    }

    #[test]
    fn test_raised_display() {
        let err = ReportError::Raised {
            category: "Payments".to_string(),
            message: "charge failed".to_string(),
            cause: Some("card declined".to_string()),
        };
        assert_eq!(err.to_string(), "[Payments] charge failed (card declined)");

        let err = ReportError::Raised {
            category: "Payments".to_string(),
            message: "charge failed".to_string(),
            cause: None,
        };
        assert_eq!(err.to_string(), "[Payments] charge failed");
    }
}
