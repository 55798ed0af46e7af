//! Rule-based health classification
//!
//! A health record is mapped to a verdict by walking an ordered decision list;
//! the first rule that fires decides the verdict and its reason. Thresholds
//! live in [`Policy`] so they can be tuned from the config file, but the
//! evaluation order is fixed by [`RULES`].

use crate::record::{HealthRecord, NvmeHealthLog};
use serde::Deserialize;
use std::cmp::Ordering;
use std::fmt;
use tracing::debug;

/// Health verdict for one device
///
/// `Safe < Warning < Error`. `Unknown` marks a device whose record could not be
/// obtained; it has no encoding and does not compare against the other states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Safe,
    Warning,
    Error,
    Unknown,
}

impl Verdict {
    /// Integer sent to the metrics backend (`status` field)
    pub fn encoding(self) -> Option<i64> {
        match self {
            Verdict::Safe => Some(0),
            Verdict::Warning => Some(1),
            Verdict::Error => Some(2),
            Verdict::Unknown => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Safe => "safe",
            Verdict::Warning => "warning",
            Verdict::Error => "error",
            Verdict::Unknown => "unknown",
        }
    }
}

impl PartialOrd for Verdict {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self.encoding(), other.encoding()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            (None, None) => Some(Ordering::Equal),
            _ => None,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict plus the reason of the rule that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub device_name: String,
    pub verdict: Verdict,
    pub reason: String,
}

/// Threshold data consulted by the rules
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Policy {
    /// NVMe endurance estimate at or above this percentage is a warning
    pub endurance_warn_percent: u32,
    /// More NVMe error log entries than this is a warning
    pub error_log_entries_limit: u64,
    /// Temperatures strictly above this are a warning
    pub temperature_limit_celsius: i64,
    /// SMART attribute ids whose non-zero raw value is a warning, in priority order
    pub watched_attributes: Vec<u32>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            endurance_warn_percent: 80,
            error_log_entries_limit: 100,
            temperature_limit_celsius: 70,
            watched_attributes: vec![
                ATTR_REALLOCATED_SECTORS,
                ATTR_REALLOCATED_EVENTS,
                ATTR_PENDING_SECTORS,
            ],
        }
    }
}

pub const ATTR_REALLOCATED_SECTORS: u32 = 5;
pub const ATTR_REALLOCATED_EVENTS: u32 = 196;
pub const ATTR_PENDING_SECTORS: u32 = 197;

pub const REASON_ALL_PASSED: &str = "all checks passed.";

/// Outcome of a rule that fired
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub verdict: Verdict,
    pub reason: String,
}

impl Finding {
    fn error(reason: impl Into<String>) -> Option<Self> {
        Some(Self { verdict: Verdict::Error, reason: reason.into() })
    }

    fn warning(reason: impl Into<String>) -> Option<Self> {
        Some(Self { verdict: Verdict::Warning, reason: reason.into() })
    }
}

/// One entry of the decision list
pub struct Rule {
    pub name: &'static str,
    eval: fn(&HealthRecord, &Policy) -> Option<Finding>,
}

impl Rule {
    pub fn evaluate(&self, record: &HealthRecord, policy: &Policy) -> Option<Finding> {
        (self.eval)(record, policy)
    }
}

/// Decision list, highest priority first
pub const RULES: &[Rule] = &[
    Rule { name: "overall_health", eval: overall_health },
    Rule { name: "nvme_critical_warning", eval: nvme_critical_warning },
    Rule { name: "nvme_media_errors", eval: nvme_media_errors },
    Rule { name: "nvme_available_spare", eval: nvme_available_spare },
    Rule { name: "nvme_endurance", eval: nvme_endurance },
    Rule { name: "nvme_error_log", eval: nvme_error_log },
    Rule { name: "attribute_table", eval: attribute_table },
    Rule { name: "temperature", eval: temperature },
];

/// Classify a record with the given policy. Never fails on a well-formed record.
pub fn classify(record: &HealthRecord, policy: &Policy) -> Classification {
    let finding = RULES
        .iter()
        .find_map(|rule| {
            let finding = rule.evaluate(record, policy)?;
            debug!(device = %record.device_name, rule = rule.name, "Rule fired");
            Some(finding)
        })
        .unwrap_or(Finding {
            verdict: Verdict::Safe,
            reason: REASON_ALL_PASSED.to_string(),
        });

    Classification {
        device_name: record.device_name.clone(),
        verdict: finding.verdict,
        reason: finding.reason,
    }
}

fn overall_health(record: &HealthRecord, _policy: &Policy) -> Option<Finding> {
    if !record.overall_passed {
        return Finding::error("overall health check failed.");
    }
    None
}

fn nvme(record: &HealthRecord) -> Option<&NvmeHealthLog> {
    record.nvme_log.as_ref()
}

fn nvme_critical_warning(record: &HealthRecord, _policy: &Policy) -> Option<Finding> {
    nvme(record)
        .filter(|log| log.critical_warning != 0)
        .and_then(|_| Finding::error("critical warning flag set."))
}

fn nvme_media_errors(record: &HealthRecord, _policy: &Policy) -> Option<Finding> {
    nvme(record)
        .filter(|log| log.media_errors > 0)
        .and_then(|_| Finding::error("media errors present."))
}

fn nvme_available_spare(record: &HealthRecord, _policy: &Policy) -> Option<Finding> {
    nvme(record)
        .filter(|log| log.available_spare < log.available_spare_threshold)
        .and_then(|_| Finding::warning("spare capacity below threshold."))
}

fn nvme_endurance(record: &HealthRecord, policy: &Policy) -> Option<Finding> {
    nvme(record)
        .filter(|log| log.percentage_used >= policy.endurance_warn_percent)
        .and_then(|_| Finding::warning(format!("endurance usage ≥ {}%.", policy.endurance_warn_percent)))
}

fn nvme_error_log(record: &HealthRecord, policy: &Policy) -> Option<Finding> {
    nvme(record)
        .filter(|log| log.error_log_entries > policy.error_log_entries_limit)
        .and_then(|_| Finding::warning("excessive error log entries."))
}

// Only consulted for devices without an NVMe log. Attributes are scanned in
// table order; the first watched attribute with a non-zero raw value wins.
fn attribute_table(record: &HealthRecord, policy: &Policy) -> Option<Finding> {
    if record.is_nvme() {
        return None;
    }
    record
        .attributes
        .iter()
        .find(|attr| attr.raw_value > 0 && policy.watched_attributes.contains(&attr.id))
        .and_then(|attr| Finding::warning(attribute_reason(attr.id)))
}

fn attribute_reason(id: u32) -> String {
    match id {
        ATTR_REALLOCATED_SECTORS => "reallocated sectors present.".to_string(),
        ATTR_REALLOCATED_EVENTS => "reallocated events present.".to_string(),
        ATTR_PENDING_SECTORS => "pending sectors present.".to_string(),
        other => format!("attribute {} raw value above zero.", other),
    }
}

fn temperature(record: &HealthRecord, policy: &Policy) -> Option<Finding> {
    match record.temperature_celsius {
        Some(celsius) if celsius > policy.temperature_limit_celsius => Finding::warning(format!(
            "temperature exceeds {}°C.",
            policy.temperature_limit_celsius
        )),
        _ => None,
    }
}
