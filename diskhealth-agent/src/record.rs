//! Canonical health record
//!
//! Platform-independent snapshot of one device's diagnostic data, produced
//! fresh by a collector on every poll and discarded once classified:
//! - Aggregate self-assessment (passed / failed)
//! - Optional temperature
//! - SMART-style attribute table (ATA/SATA devices)
//! - NVMe health log (NVMe devices)
//!
//! Absent values stay `None`; a reported zero is `Some(0)`.

use serde::{Deserialize, Serialize};

/// Normalized health snapshot for one physical device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub device_name: String,
    pub overall_passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_celsius: Option<i64>,
    #[serde(default)]
    pub attributes: Vec<AttributeReading>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nvme_log: Option<NvmeHealthLog>,
}

/// One vendor-specific SMART counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeReading {
    pub id: u32,
    pub raw_value: u64,
}

/// NVMe SMART / Health Information log page (subset used for classification)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvmeHealthLog {
    pub critical_warning: u32,
    pub media_errors: u64,
    pub available_spare: u32,
    pub available_spare_threshold: u32,
    pub percentage_used: u32,
    pub error_log_entries: u64,
}

impl HealthRecord {
    /// Record with only the aggregate verdict set
    pub fn new(device_name: impl Into<String>, overall_passed: bool) -> Self {
        Self {
            device_name: device_name.into(),
            overall_passed,
            temperature_celsius: None,
            attributes: Vec::new(),
            nvme_log: None,
        }
    }

    pub fn with_temperature(mut self, celsius: i64) -> Self {
        self.temperature_celsius = Some(celsius);
        self
    }

    pub fn with_attribute(mut self, id: u32, raw_value: u64) -> Self {
        self.attributes.push(AttributeReading { id, raw_value });
        self
    }

    pub fn with_nvme_log(mut self, log: NvmeHealthLog) -> Self {
        self.nvme_log = Some(log);
        self
    }

    /// True for NVMe-class devices, whose log takes precedence over the attribute table
    pub fn is_nvme(&self) -> bool {
        self.nvme_log.is_some()
    }
}
