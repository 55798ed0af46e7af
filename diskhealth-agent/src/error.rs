//! Error taxonomy for the disk health pipeline
//!
//! Every per-device and per-point failure is recoverable: the scheduler logs it
//! and moves on. Only [`StartupError`] aborts the process.

/// Raw diagnostic payload could not be decoded into a health record
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Malformed diagnostic data for {device}: {reason}")]
    MalformedDiagnosticData { device: String, reason: String },
}

/// Failures while enumerating or querying devices
#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error("Device enumeration failed: {0}")]
    EnumerationFailed(String),
    #[error("Diagnostic tool unavailable: {tool}")]
    ToolUnavailable { tool: String },
    #[error("Query failed for {device} (exit status {}): {detail}", fmt_status(.exit_status))]
    QueryFailed {
        device: String,
        exit_status: Option<i32>,
        detail: String,
    },
    #[error("Permission denied while querying {device}")]
    PermissionDenied { device: String },
}

/// A metric point could not be delivered to the backend
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Publish failed for {device}: {cause}")]
    PublishFailed { device: String, cause: String },
}

/// Startup-fatal conditions
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Invalid configuration: {0}")]
    ConfigurationInvalid(String),
    #[error("Insufficient privilege: the agent must run as root/administrator")]
    InsufficientPrivilege,
}

fn fmt_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => code.to_string(),
        None => "none".to_string(),
    }
}

impl CollectError {
    /// Short stage label used in structured logs
    pub fn stage(&self) -> &'static str {
        match self {
            CollectError::EnumerationFailed(_) => "enumerate",
            _ => "query",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_failed_display() {
        let err = CollectError::QueryFailed {
            device: "/dev/sda".to_string(),
            exit_status: Some(2),
            detail: "open failed".to_string(),
        };
        assert_eq!(err.to_string(), "Query failed for /dev/sda (exit status 2): open failed");

        let err = CollectError::QueryFailed {
            device: "/dev/sdb".to_string(),
            exit_status: None,
            detail: "timed out after 30s".to_string(),
        };
        assert!(err.to_string().contains("exit status none"));
    }

    #[test]
    fn test_stage_labels() {
        assert_eq!(CollectError::EnumerationFailed("x".into()).stage(), "enumerate");
        assert_eq!(CollectError::PermissionDenied { device: "d".into() }.stage(), "query");
    }
}
