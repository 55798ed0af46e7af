//! InfluxDB v2 sink
//!
//! Points are written one by one through `POST /api/v2/write` in line
//! protocol, second precision:
//! `disk,host=<h>,client=<c>,device=<d> status=<n>i,temperature=<t>i <ts>`

use super::{MetricPoint, PointTags, Publisher};
use crate::error::PublishError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use std::time::Duration;
use tracing::debug;

pub const MEASUREMENT: &str = "disk";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection settings for the write API
#[derive(Debug, Clone)]
pub struct InfluxTarget {
    pub url: String,
    pub org: String,
    pub bucket: String,
    pub token: String,
}

/// Shared HTTP session to the backend, created once at service start
pub struct InfluxPublisher {
    client: reqwest::Client,
    write_url: String,
    target: InfluxTarget,
    tags: PointTags,
}

impl InfluxPublisher {
    pub fn new(target: InfluxTarget, tags: PointTags) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("diskhealth-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        let write_url = format!("{}/api/v2/write", target.url.trim_end_matches('/'));

        Ok(Self {
            client,
            write_url,
            target,
            tags,
        })
    }
}

#[async_trait]
impl Publisher for InfluxPublisher {
    fn name(&self) -> &'static str {
        "influxdb"
    }

    async fn publish(&self, point: &MetricPoint) -> Result<(), PublishError> {
        let failed = |cause: String| PublishError::PublishFailed {
            device: point.device_name.clone(),
            cause,
        };

        let body = line_protocol(point, &self.tags);
        debug!("Writing point: {}", body);

        let response = self
            .client
            .post(&self.write_url)
            .query(&[
                ("org", self.target.org.as_str()),
                ("bucket", self.target.bucket.as_str()),
                ("precision", "s"),
            ])
            .header(AUTHORIZATION, format!("Token {}", self.target.token))
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await
            .map_err(|e| failed(format!("request error: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(failed(format!(
            "backend answered {}: {}",
            status,
            crate::collector::summarize(&text)
        )))
    }
}

/// Render one point in InfluxDB line protocol
pub fn line_protocol(point: &MetricPoint, tags: &PointTags) -> String {
    let mut line = format!(
        "{},host={},client={},device={} status={}i",
        MEASUREMENT,
        escape_tag(&tags.host),
        escape_tag(&tags.client),
        escape_tag(&point.device_name),
        point.status
    );
    if let Some(celsius) = point.temperature_celsius {
        line.push_str(&format!(",temperature={}i", celsius));
    }
    line.push_str(&format!(" {}", point.timestamp.timestamp()));
    line
}

// Tag keys and values escape commas, equals signs, spaces and backslashes
fn escape_tag(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, ',' | '=' | ' ' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
