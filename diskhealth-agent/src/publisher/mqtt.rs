//! MQTT mirror sink
//!
//! Publishes each point as JSON on a single topic so that bus subscribers
//! (dashboards, alerting bridges) see the same verdicts as the metrics backend.

use super::{MetricPoint, PointTags, Publisher};
use crate::error::PublishError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

const REQUEST_QUEUE_CAPACITY: usize = 10;

/// Broker settings for the mirror
#[derive(Debug, Clone)]
pub struct MqttTarget {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub topic: String,
    pub keep_alive: Duration,
}

/// JSON payload published for every point
#[derive(Debug, Serialize)]
pub struct DiskStatusMessage<'a> {
    pub host: &'a str,
    pub client: &'a str,
    pub device: &'a str,
    pub status: i64,
    pub temperature: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

impl<'a> DiskStatusMessage<'a> {
    pub fn new(point: &'a MetricPoint, tags: &'a PointTags) -> Self {
        Self {
            host: &tags.host,
            client: &tags.client,
            device: &point.device_name,
            status: point.status,
            temperature: point.temperature_celsius,
            timestamp: point.timestamp,
        }
    }
}

pub struct MqttPublisher {
    client: AsyncClient,
    topic: String,
    tags: PointTags,
    event_loop: JoinHandle<()>,
}

impl MqttPublisher {
    /// Create the client and drive its event loop in the background
    pub fn connect(target: MqttTarget, tags: PointTags) -> Self {
        let mut options = MqttOptions::new(&target.client_id, &target.broker_host, target.broker_port);
        options.set_keep_alive(target.keep_alive);
        options.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_QUEUE_CAPACITY);

        let event_loop = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!("MQTT mirror connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT connection error: {}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        info!(
            "MQTT mirror → {}:{} on topic {}",
            target.broker_host, target.broker_port, target.topic
        );

        Self {
            client,
            topic: target.topic,
            tags,
            event_loop,
        }
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    async fn publish(&self, point: &MetricPoint) -> Result<(), PublishError> {
        let failed = |cause: String| PublishError::PublishFailed {
            device: point.device_name.clone(),
            cause,
        };

        let payload = serde_json::to_string(&DiskStatusMessage::new(point, &self.tags))
            .map_err(|e| failed(format!("serialization error: {}", e)))?;

        // the request queue is only drained while the broker is reachable;
        // a full queue fails the point instead of stalling the tick
        self.client
            .try_publish(self.topic.as_str(), QoS::AtLeastOnce, false, payload)
            .map_err(|e| failed(format!("MQTT request queue unavailable: {}", e)))?;

        debug!(device = %point.device_name, "Point mirrored on {}", self.topic);
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!("MQTT disconnect failed: {}", e);
        }
    }
}

impl Drop for MqttPublisher {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}
