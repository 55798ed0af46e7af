//! Agent configuration
//!
//! Handles:
//! - Metrics backend connection (InfluxDB v2)
//! - Polling cadence and tool timeouts
//! - Classification thresholds
//! - Optional MQTT mirror
//!
//! Stored as TOML in the OS config directory unless a path is given on the
//! command line or through `CONFIG_PATH`.

use crate::classify::Policy;
use crate::error::StartupError;
use crate::publisher::influx::InfluxTarget;
use crate::publisher::mqtt::MqttTarget;
use crate::scheduler::SchedulerSettings;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Overrides `backend.token` so the secret can stay out of the file
pub const TOKEN_ENV: &str = "DISKHEALTH_BACKEND_TOKEN";

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub backend: BackendConfig,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub policy: Policy,
    pub mqtt: Option<MqttConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub url: String,
    pub org: String,
    pub bucket: String,
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Value of the `client` tag on every point
    pub client: String,
    /// Value of the `host` tag; the OS hostname when unset
    pub hostname: Option<String>,
    pub poll_interval_secs: u64,
    pub query_timeout_secs: u64,
    pub degraded_cooldown_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub broker_host: String,
    #[serde(default = "default_mqtt_port")]
    pub broker_port: u16,
    pub client_id: Option<String>,
    #[serde(default = "default_mqtt_topic")]
    pub topic: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            client: "default".to_string(),
            hostname: None,
            poll_interval_secs: 5,
            query_timeout_secs: 30,
            degraded_cooldown_secs: 30,
        }
    }
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_topic() -> String {
    "diskhealth/disk@v1".to_string()
}

fn default_keep_alive() -> u64 {
    30
}

fn invalid(msg: impl Into<String>) -> StartupError {
    StartupError::ConfigurationInvalid(msg.into())
}

impl AgentConfig {
    /// Get OS-specific config file path
    pub fn default_path() -> Result<PathBuf, StartupError> {
        let mut path = dirs::config_dir().ok_or_else(|| invalid("could not find config directory"))?;
        path.push("diskhealth-agent");
        path.push("config.toml");
        Ok(path)
    }

    /// Explicit path (flag or `CONFIG_PATH`) or the OS default
    pub fn resolve_path(explicit: Option<PathBuf>) -> Result<PathBuf, StartupError> {
        match explicit {
            Some(path) => Ok(path),
            None => Self::default_path(),
        }
    }

    /// Read, apply environment overrides, validate
    pub async fn load(path: &Path) -> Result<Self, StartupError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| invalid(format!("cannot read {}: {}", path.display(), e)))?;

        let mut config = Self::parse(&content)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, StartupError> {
        toml::from_str(content).map_err(|e| invalid(format!("TOML error: {}", e)))
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup(TOKEN_ENV).filter(|t| !t.trim().is_empty()) {
            self.backend.token = token;
        }
    }

    pub fn validate(&self) -> Result<(), StartupError> {
        let backend = [
            ("url", &self.backend.url),
            ("org", &self.backend.org),
            ("bucket", &self.backend.bucket),
            ("token", &self.backend.token),
        ];
        for (key, value) in backend {
            if value.trim().is_empty() {
                return Err(invalid(format!("backend.{} must not be empty", key)));
            }
        }

        let url = reqwest::Url::parse(self.backend.url.trim())
            .map_err(|e| invalid(format!("backend.url is not a valid URL: {}", e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(format!("backend.url must use http or https, got {}", url.scheme())));
        }

        if self.agent.poll_interval_secs == 0 {
            return Err(invalid("agent.poll_interval_secs must be greater than 0"));
        }
        if self.agent.query_timeout_secs == 0 {
            return Err(invalid("agent.query_timeout_secs must be greater than 0"));
        }
        if self.agent.client.trim().is_empty() {
            return Err(invalid("agent.client must not be empty"));
        }

        if let Some(mqtt) = &self.mqtt {
            if mqtt.broker_host.trim().is_empty() {
                return Err(invalid("mqtt.broker_host must not be empty"));
            }
            if mqtt.topic.is_empty() || mqtt.topic.contains(['+', '#']) {
                return Err(invalid("mqtt.topic must be a non-empty topic without wildcards"));
            }
        }
        Ok(())
    }

    /// Configured host tag, else the OS hostname
    pub fn hostname(&self) -> String {
        match self.agent.hostname.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => gethostname::gethostname().to_string_lossy().into_owned(),
        }
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.query_timeout_secs)
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            poll_interval: Duration::from_secs(self.agent.poll_interval_secs),
            degraded_cooldown: Duration::from_secs(self.agent.degraded_cooldown_secs),
        }
    }

    pub fn influx_target(&self) -> InfluxTarget {
        InfluxTarget {
            url: self.backend.url.trim().to_string(),
            org: self.backend.org.trim().to_string(),
            bucket: self.backend.bucket.trim().to_string(),
            token: self.backend.token.trim().to_string(),
        }
    }

    pub fn mqtt_target(&self, hostname: &str) -> Option<MqttTarget> {
        self.mqtt.as_ref().map(|mqtt| MqttTarget {
            broker_host: mqtt.broker_host.clone(),
            broker_port: mqtt.broker_port,
            client_id: mqtt
                .client_id
                .clone()
                .unwrap_or_else(|| format!("diskhealth-agent-{}", hostname)),
            topic: mqtt.topic.clone(),
            keep_alive: Duration::from_secs(mqtt.keep_alive_secs),
        })
    }
}
