//! Unix-like collector backed by `smartctl` (smartmontools)
//!
//! Devices are enumerated from the mounted filesystems reported by `sysinfo`,
//! mapped back to their parent disk, then queried with
//! `smartctl -a -x -j <device>`. The JSON report is decoded into a
//! [`HealthRecord`].

use super::{run_tool, summarize, DiskCollector, ToolOutput};
use crate::error::{CollectError, ParseError};
use crate::record::{HealthRecord, NvmeHealthLog};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::time::Duration;
use sysinfo::Disks;
use tracing::debug;

const SMARTCTL: &str = "smartctl";

/// smartctl exit status bits that mean "no usable report"
/// (bit 0: command line did not parse, bit 1: device open failed)
const FATAL_EXIT_BITS: i32 = 0b0000_0011;

/// Name prefixes of virtual block devices that never carry SMART data
const PSEUDO_DEVICE_PREFIXES: &[&str] = &[
    "loop", "ram", "zram", "dm-", "mapper/", "sr", "fd", "nbd", "md", "bcache",
];

/// Aliases mount tables report instead of the real node
const PSEUDO_DEVICE_NAMES: &[&str] = &["root"];

pub struct SmartctlCollector {
    program: String,
    timeout: Duration,
}

impl SmartctlCollector {
    pub fn new(timeout: Duration) -> Self {
        Self {
            program: SMARTCTL.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl DiskCollector for SmartctlCollector {
    fn name(&self) -> &'static str {
        "smartctl"
    }

    async fn list_devices(&self) -> Result<Vec<String>, CollectError> {
        let names = tokio::task::spawn_blocking(|| {
            let disks = Disks::new_with_refreshed_list();
            disks
                .list()
                .iter()
                .map(|disk| disk.name().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| CollectError::EnumerationFailed(format!("disk listing task failed: {}", e)))?;

        let devices = physical_devices(names.iter().map(String::as_str));
        debug!("Found {} block devices from {} mounts", devices.len(), names.len());
        Ok(devices)
    }

    async fn query(&self, device: &str) -> Result<Vec<u8>, CollectError> {
        let output = run_tool(&self.program, &["-a", "-x", "-j", device], device, self.timeout).await?;
        interpret_exit(device, output)
    }

    fn parse(&self, device: &str, payload: &[u8]) -> Result<HealthRecord, ParseError> {
        parse_report(device, payload)
    }
}

/// Distinct parent disks of the given mount sources, pseudo devices removed
pub fn physical_devices<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    names
        .into_iter()
        .filter_map(parent_block_device)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Map a partition node to the disk it lives on (`/dev/sda3` → `/dev/sda`)
///
/// Returns `None` for anything that is not a physical block device node.
pub fn parent_block_device(name: &str) -> Option<String> {
    let base = name.strip_prefix("/dev/")?;
    if base.is_empty()
        || base.contains("snap")
        || PSEUDO_DEVICE_NAMES.contains(&base)
        || PSEUDO_DEVICE_PREFIXES.iter().any(|p| base.starts_with(p))
    {
        return None;
    }

    let disk = if base.starts_with("nvme") || base.starts_with("mmcblk") {
        strip_p_partition(base)
    } else {
        base.trim_end_matches(|c: char| c.is_ascii_digit())
    };

    if disk.is_empty() {
        return None;
    }
    Some(format!("/dev/{}", disk))
}

// nvme0n1p2 -> nvme0n1, mmcblk0p1 -> mmcblk0; nvme0n1 stays as-is
fn strip_p_partition(base: &str) -> &str {
    if let Some(idx) = base.rfind('p') {
        let (head, tail) = base.split_at(idx);
        let digits = &tail[1..];
        if !digits.is_empty()
            && digits.chars().all(|c| c.is_ascii_digit())
            && head.ends_with(|c: char| c.is_ascii_digit())
        {
            return head;
        }
    }
    base
}

/// Apply smartctl's exit status bitmask
///
/// Bits 2-7 only flag conditions (failing disk, logged errors...) that are
/// already part of the JSON report, so the payload is still returned.
pub fn interpret_exit(device: &str, output: ToolOutput) -> Result<Vec<u8>, CollectError> {
    match output.exit_code {
        Some(code) if code & FATAL_EXIT_BITS != 0 => {
            let text = output.combined_text();
            if text.contains("Permission denied") || text.contains("Operation not permitted") {
                return Err(CollectError::PermissionDenied {
                    device: device.to_string(),
                });
            }
            let detail = smartctl_message(&output.stdout)
                .unwrap_or_else(|| summarize(&String::from_utf8_lossy(&output.stderr)));
            Err(CollectError::QueryFailed {
                device: device.to_string(),
                exit_status: Some(code),
                detail: if detail.is_empty() { "no diagnostic output".to_string() } else { detail },
            })
        }
        Some(_) => Ok(output.stdout),
        None => Err(CollectError::QueryFailed {
            device: device.to_string(),
            exit_status: None,
            detail: "smartctl terminated by signal".to_string(),
        }),
    }
}

/// First error message smartctl embedded in its JSON output
fn smartctl_message(stdout: &[u8]) -> Option<String> {
    let report: SmartctlEnvelope = serde_json::from_slice(stdout).ok()?;
    report
        .smartctl?
        .messages
        .into_iter()
        .next()
        .map(|m| summarize(&m.string))
}

#[derive(Debug, Deserialize)]
struct SmartctlEnvelope {
    smartctl: Option<SmartctlInfo>,
}

#[derive(Debug, Deserialize)]
struct SmartctlInfo {
    #[serde(default)]
    messages: Vec<SmartctlMessage>,
}

#[derive(Debug, Deserialize)]
struct SmartctlMessage {
    string: String,
}

/// Subset of the `smartctl -j` report the classifier needs; everything else is ignored
#[derive(Debug, Deserialize)]
struct SmartctlReport {
    device: Option<DeviceSection>,
    smart_status: Option<SmartStatusSection>,
    temperature: Option<TemperatureSection>,
    ata_smart_attributes: Option<AttributeTable>,
    nvme_smart_health_information_log: Option<NvmeLogSection>,
}

#[derive(Debug, Deserialize)]
struct DeviceSection {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SmartStatusSection {
    passed: bool,
}

#[derive(Debug, Deserialize)]
struct TemperatureSection {
    current: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct AttributeTable {
    #[serde(default)]
    table: Vec<AttributeRow>,
}

#[derive(Debug, Deserialize)]
struct AttributeRow {
    id: u32,
    raw: RawValue,
}

#[derive(Debug, Deserialize)]
struct RawValue {
    value: u64,
}

#[derive(Debug, Deserialize)]
struct NvmeLogSection {
    critical_warning: u32,
    available_spare: u32,
    available_spare_threshold: u32,
    percentage_used: u32,
    media_errors: u64,
    num_err_log_entries: u64,
}

/// Decode a smartctl JSON report
pub fn parse_report(device: &str, payload: &[u8]) -> Result<HealthRecord, ParseError> {
    let malformed = |reason: String| ParseError::MalformedDiagnosticData {
        device: device.to_string(),
        reason,
    };

    let report: SmartctlReport =
        serde_json::from_slice(payload).map_err(|e| malformed(format!("invalid smartctl JSON: {}", e)))?;

    let smart_status = report
        .smart_status
        .ok_or_else(|| malformed("missing smart_status".to_string()))?;

    let device_name = report
        .device
        .and_then(|d| d.name)
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| device.to_string());

    let mut record = HealthRecord::new(device_name, smart_status.passed);
    if let Some(celsius) = report.temperature.and_then(|t| t.current) {
        record = record.with_temperature(celsius);
    }
    for row in report.ata_smart_attributes.map(|t| t.table).unwrap_or_default() {
        record = record.with_attribute(row.id, row.raw.value);
    }
    if let Some(log) = report.nvme_smart_health_information_log {
        record = record.with_nvme_log(NvmeHealthLog {
            critical_warning: log.critical_warning,
            media_errors: log.media_errors,
            available_spare: log.available_spare,
            available_spare_threshold: log.available_spare_threshold,
            percentage_used: log.percentage_used,
            error_log_entries: log.num_err_log_entries,
        });
    }
    Ok(record)
}
