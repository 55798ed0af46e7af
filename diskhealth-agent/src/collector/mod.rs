//! Platform collectors for disk diagnostic data
//!
//! A collector enumerates the physical storage devices of the host, queries
//! each one through the platform's health tool and turns the raw payload into
//! a [`HealthRecord`]:
//! - Unix-like hosts: `smartctl` JSON output per block device
//! - Windows hosts: PowerShell Storage module (`Get-PhysicalDisk`)
//!
//! The variant is picked once at startup by [`for_host`].

pub mod powershell;
pub mod smartctl;

use crate::error::{CollectError, ParseError};
use crate::record::HealthRecord;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

pub use powershell::PowerShellCollector;
pub use smartctl::SmartctlCollector;

/// Capability implemented by every platform variant
#[async_trait]
pub trait DiskCollector: Send + Sync {
    /// Short label for logs
    fn name(&self) -> &'static str;

    /// Identifiers of the physical devices to query, pseudo-devices already removed
    async fn list_devices(&self) -> Result<Vec<String>, CollectError>;

    /// Raw diagnostic payload for one device
    async fn query(&self, device: &str) -> Result<Vec<u8>, CollectError>;

    /// Decode a payload returned by [`DiskCollector::query`]
    fn parse(&self, device: &str, payload: &[u8]) -> Result<HealthRecord, ParseError>;
}

/// Collector matching the compile target, `None` on unsupported platforms
pub fn for_host(query_timeout: Duration) -> Option<Box<dyn DiskCollector>> {
    if cfg!(target_os = "windows") {
        Some(Box::new(PowerShellCollector::new(query_timeout)))
    } else if cfg!(unix) {
        Some(Box::new(SmartctlCollector::new(query_timeout)))
    } else {
        None
    }
}

/// Captured result of one tool invocation
#[derive(Debug)]
pub struct ToolOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
}

impl ToolOutput {
    /// stdout and stderr as one lossy string, for error sniffing
    pub fn combined_text(&self) -> String {
        let stdout = String::from_utf8_lossy(&self.stdout);
        let stderr = String::from_utf8_lossy(&self.stderr);
        if stderr.is_empty() {
            stdout.into_owned()
        } else {
            format!("{}\n{}", stdout, stderr)
        }
    }
}

/// Run an external diagnostic tool with a timeout
///
/// Spawn failures are mapped to `ToolUnavailable` / `PermissionDenied`; a
/// timeout kills the child and yields `QueryFailed` without exit status.
/// Non-zero exit codes are returned as-is for the caller to interpret.
pub async fn run_tool(
    program: &str,
    args: &[&str],
    device: &str,
    timeout: Duration,
) -> Result<ToolOutput, CollectError> {
    debug!(device = %device, "Running: {} {}", program, args.join(" "));

    let child = AsyncCommand::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(timeout, child).await {
        Err(_) => {
            return Err(CollectError::QueryFailed {
                device: device.to_string(),
                exit_status: None,
                detail: format!("{} timed out after {}s", program, timeout.as_secs()),
            })
        }
        Ok(Err(e)) => return Err(spawn_error(program, device, e)),
        Ok(Ok(output)) => output,
    };

    Ok(ToolOutput {
        exit_code: output.status.code(),
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

fn spawn_error(program: &str, device: &str, err: std::io::Error) -> CollectError {
    match err.kind() {
        ErrorKind::NotFound => CollectError::ToolUnavailable {
            tool: program.to_string(),
        },
        ErrorKind::PermissionDenied => CollectError::PermissionDenied {
            device: device.to_string(),
        },
        _ => CollectError::QueryFailed {
            device: device.to_string(),
            exit_status: None,
            detail: format!("failed to execute {}: {}", program, err),
        },
    }
}

/// Trimmed, length-capped text for error details
pub(crate) fn summarize(text: &str) -> String {
    const MAX: usize = 200;
    let trimmed = text.trim();
    if trimmed.chars().count() <= MAX {
        return trimmed.to_string();
    }
    let mut short: String = trimmed.chars().take(MAX).collect();
    short.push('…');
    short
}
