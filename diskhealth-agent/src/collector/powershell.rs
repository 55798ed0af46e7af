//! Windows collector backed by the PowerShell Storage module
//!
//! Physical disks are listed with `Get-PhysicalDisk`; each one is queried
//! together with its `Get-StorageReliabilityCounter` and emitted as JSON via
//! `ConvertTo-Json`. Windows PowerShell 5.1 serializes enums as integers while
//! PowerShell 7 emits their names, so both forms are accepted.

use super::{run_tool, summarize, DiskCollector, ToolOutput};
use crate::error::{CollectError, ParseError};
use crate::record::HealthRecord;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

const POWERSHELL: &str = "powershell";

/// Exit code used by the query script when the disk id is not present
const EXIT_DISK_NOT_FOUND: i32 = 3;

const LIST_SCRIPT: &str = "@(Get-PhysicalDisk | ForEach-Object { [string]$_.DeviceId }) | ConvertTo-Json -Compress";

pub struct PowerShellCollector {
    program: String,
    timeout: Duration,
}

impl PowerShellCollector {
    pub fn new(timeout: Duration) -> Self {
        Self {
            program: POWERSHELL.to_string(),
            timeout,
        }
    }

    async fn run_script(&self, script: &str, device: &str) -> Result<ToolOutput, CollectError> {
        run_tool(
            &self.program,
            &["-NoProfile", "-NonInteractive", "-Command", script],
            device,
            self.timeout,
        )
        .await
    }
}

#[async_trait]
impl DiskCollector for PowerShellCollector {
    fn name(&self) -> &'static str {
        "powershell"
    }

    async fn list_devices(&self) -> Result<Vec<String>, CollectError> {
        let output = self
            .run_script(LIST_SCRIPT, "*")
            .await
            .map_err(|e| CollectError::EnumerationFailed(e.to_string()))?;

        if output.exit_code != Some(0) {
            return Err(CollectError::EnumerationFailed(format!(
                "Get-PhysicalDisk exited with {:?}: {}",
                output.exit_code,
                summarize(&output.combined_text())
            )));
        }
        parse_device_list(&output.stdout)
    }

    async fn query(&self, device: &str) -> Result<Vec<u8>, CollectError> {
        // Disk ids are interpolated into the script, so only plain numbers are accepted
        if device.is_empty() || !device.chars().all(|c| c.is_ascii_digit()) {
            return Err(CollectError::QueryFailed {
                device: device.to_string(),
                exit_status: None,
                detail: "invalid physical disk id".to_string(),
            });
        }
        let output = self.run_script(&query_script(device), device).await?;
        interpret_exit(device, output)
    }

    fn parse(&self, device: &str, payload: &[u8]) -> Result<HealthRecord, ParseError> {
        parse_disk_report(device, payload)
    }
}

fn query_script(device_id: &str) -> String {
    format!(
        r#"$disk = Get-PhysicalDisk | Where-Object {{ [string]$_.DeviceId -eq '{id}' }} | Select-Object -First 1
if (-not $disk) {{ exit {missing} }}
$rel = $disk | Get-StorageReliabilityCounter
[PSCustomObject]@{{
    DeviceId = [string]$disk.DeviceId
    FriendlyName = $disk.FriendlyName
    MediaType = $disk.MediaType
    BusType = $disk.BusType
    HealthStatus = $disk.HealthStatus
    OperationalStatus = $disk.OperationalStatus
    Temperature = $rel.Temperature
    Wear = $rel.Wear
    ReadErrorsUncorrected = $rel.ReadErrorsUncorrected
}} | ConvertTo-Json -Depth 2"#,
        id = device_id,
        missing = EXIT_DISK_NOT_FOUND
    )
}

/// Map the PowerShell exit code to a payload or a per-device failure
pub fn interpret_exit(device: &str, output: ToolOutput) -> Result<Vec<u8>, CollectError> {
    match output.exit_code {
        Some(0) => Ok(output.stdout),
        Some(code) => {
            let text = output.combined_text();
            if text.contains("Access denied") || text.contains("Access is denied") || text.contains("PermissionDenied") {
                return Err(CollectError::PermissionDenied {
                    device: device.to_string(),
                });
            }
            let detail = if code == EXIT_DISK_NOT_FOUND {
                "physical disk not found".to_string()
            } else {
                summarize(&text)
            };
            Err(CollectError::QueryFailed {
                device: device.to_string(),
                exit_status: Some(code),
                detail,
            })
        }
        None => Err(CollectError::QueryFailed {
            device: device.to_string(),
            exit_status: None,
            detail: "powershell terminated abnormally".to_string(),
        }),
    }
}

/// Parse the `ConvertTo-Json` output of the listing script
pub fn parse_device_list(payload: &[u8]) -> Result<Vec<String>, CollectError> {
    let text = String::from_utf8_lossy(payload);
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(text.trim())
        .map_err(|e| CollectError::EnumerationFailed(format!("invalid disk list JSON: {}", e)))?;

    // a single disk is emitted as a bare value instead of an array
    let items = match value {
        Value::Array(items) => items,
        other => vec![other],
    };
    Ok(items.iter().filter_map(device_id).collect())
}

fn device_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DiskReport {
    device_id: Option<Value>,
    health_status: Option<HealthStatusField>,
    temperature: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HealthStatusField {
    Name(String),
    Code(i64),
}

impl HealthStatusField {
    // MSFT_PhysicalDisk.HealthStatus: 0 Healthy, 1 Warning, 2 Unhealthy, 5 Unknown
    fn is_healthy(&self) -> bool {
        match self {
            HealthStatusField::Name(name) => name.eq_ignore_ascii_case("healthy"),
            HealthStatusField::Code(code) => *code == 0,
        }
    }
}

/// Decode the JSON emitted by the query script
pub fn parse_disk_report(device: &str, payload: &[u8]) -> Result<HealthRecord, ParseError> {
    let malformed = |reason: String| ParseError::MalformedDiagnosticData {
        device: device.to_string(),
        reason,
    };

    let report: DiskReport = serde_json::from_slice(payload)
        .map_err(|e| malformed(format!("invalid PowerShell JSON: {}", e)))?;

    let health = report
        .health_status
        .ok_or_else(|| malformed("missing HealthStatus".to_string()))?;

    let id = report
        .device_id
        .as_ref()
        .and_then(device_id)
        .unwrap_or_else(|| device.to_string());

    let record = HealthRecord::new(format!(r"\\.\PHYSICALDRIVE{}", id), health.is_healthy());
    // the reliability counter reports 0 when the drive exposes no sensor
    Ok(match report.temperature.filter(|t| *t != 0) {
        Some(celsius) => record.with_temperature(celsius),
        None => record,
    })
}
