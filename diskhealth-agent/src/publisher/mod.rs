//! Metric publication
//!
//! A [`Publisher`] forwards one [`MetricPoint`] per classified device to a
//! downstream sink. Delivery is at-least-once and every call is independent:
//! a failed point never prevents the next one from being sent.

pub mod influx;
pub mod mqtt;

use crate::classify::Classification;
use crate::error::PublishError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

pub use influx::InfluxPublisher;
pub use mqtt::MqttPublisher;

/// Point handed to the metrics backend (`measurement = "disk"`)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricPoint {
    pub device_name: String,
    pub status: i64,
    pub temperature_celsius: Option<i64>,
    /// Construction time of the point, not the device query time
    pub timestamp: DateTime<Utc>,
}

impl MetricPoint {
    /// Build a point for a classified device; `None` for `Unknown` verdicts
    pub fn from_classification(result: &Classification, temperature_celsius: Option<i64>) -> Option<Self> {
        let status = result.verdict.encoding()?;
        Some(Self {
            device_name: result.device_name.clone(),
            status,
            temperature_celsius,
            timestamp: Utc::now(),
        })
    }
}

/// Host-level tags attached to every point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointTags {
    pub host: String,
    pub client: String,
}

/// Downstream sink for metric points
#[async_trait]
pub trait Publisher: Send + Sync {
    fn name(&self) -> &'static str;

    async fn publish(&self, point: &MetricPoint) -> Result<(), PublishError>;

    /// Release the backend session; called once at service shutdown
    async fn close(&self) {}
}

/// Fans every point out to all configured sinks
pub struct PublisherSet {
    sinks: Vec<Box<dyn Publisher>>,
}

impl PublisherSet {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn with(mut self, sink: Box<dyn Publisher>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn sink_names(&self) -> Vec<&'static str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }
}

impl Default for PublisherSet {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Publisher for PublisherSet {
    fn name(&self) -> &'static str {
        "set"
    }

    /// Every sink gets the point; the first failure is reported after all attempts
    async fn publish(&self, point: &MetricPoint) -> Result<(), PublishError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.publish(point).await {
                warn!(device = %point.device_name, sink = sink.name(), "Sink rejected point: {}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn close(&self) {
        for sink in &self.sinks {
            sink.close().await;
        }
    }
}
