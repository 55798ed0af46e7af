//! Test doubles for the collector and publisher seams
//!
//! `ScriptedCollector` answers from a fixed script instead of running tools,
//! `RecordingPublisher` stores every point it receives and can be told to
//! reject some devices.

use crate::collector::DiskCollector;
use crate::error::{CollectError, ParseError, PublishError};
use crate::publisher::{MetricPoint, Publisher};
use crate::record::HealthRecord;
use crate::scheduler::Shutdown;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Scripted answer for one device
#[derive(Debug, Clone)]
pub enum Scripted {
    Record(HealthRecord),
    Garbage(&'static str),
    ExitStatus(i32),
    PermissionDenied,
    ToolMissing,
}

pub struct ScriptedCollector {
    devices: Result<Vec<String>, String>,
    responses: HashMap<String, Scripted>,
    enumerations: AtomicUsize,
    queried: Mutex<Vec<String>>,
    stop_on_query: Option<(String, Shutdown)>,
}

impl ScriptedCollector {
    pub fn new() -> Self {
        Self {
            devices: Ok(Vec::new()),
            responses: HashMap::new(),
            enumerations: AtomicUsize::new(0),
            queried: Mutex::new(Vec::new()),
            stop_on_query: None,
        }
    }

    /// Request shutdown while `device` is being queried; its answer is still returned
    pub fn stopping_during(mut self, device: &str, shutdown: &Shutdown) -> Self {
        self.stop_on_query = Some((device.to_string(), shutdown.clone()));
        self
    }

    /// Enumeration fails on every tick
    pub fn unreachable(reason: &str) -> Self {
        Self {
            devices: Err(reason.to_string()),
            ..Self::new()
        }
    }

    pub fn device(mut self, name: &str, answer: Scripted) -> Self {
        if let Ok(devices) = self.devices.as_mut() {
            devices.push(name.to_string());
        }
        self.responses.insert(name.to_string(), answer);
        self
    }

    pub fn enumerations(&self) -> usize {
        self.enumerations.load(Ordering::SeqCst)
    }

    pub fn queried(&self) -> Vec<String> {
        self.queried.lock().unwrap().clone()
    }
}

#[async_trait]
impl DiskCollector for ScriptedCollector {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn list_devices(&self) -> Result<Vec<String>, CollectError> {
        self.enumerations.fetch_add(1, Ordering::SeqCst);
        self.devices.clone().map_err(CollectError::EnumerationFailed)
    }

    async fn query(&self, device: &str) -> Result<Vec<u8>, CollectError> {
        self.queried.lock().unwrap().push(device.to_string());
        if let Some((target, shutdown)) = &self.stop_on_query {
            if target == device {
                shutdown.stop();
            }
        }
        match self.responses.get(device) {
            Some(Scripted::Record(record)) => Ok(serde_json::to_vec(record).unwrap()),
            Some(Scripted::Garbage(text)) => Ok(text.as_bytes().to_vec()),
            Some(Scripted::ExitStatus(code)) => Err(CollectError::QueryFailed {
                device: device.to_string(),
                exit_status: Some(*code),
                detail: "scripted failure".to_string(),
            }),
            Some(Scripted::PermissionDenied) => Err(CollectError::PermissionDenied {
                device: device.to_string(),
            }),
            Some(Scripted::ToolMissing) | None => Err(CollectError::ToolUnavailable {
                tool: "scripted".to_string(),
            }),
        }
    }

    fn parse(&self, device: &str, payload: &[u8]) -> Result<HealthRecord, ParseError> {
        serde_json::from_slice(payload).map_err(|e| ParseError::MalformedDiagnosticData {
            device: device.to_string(),
            reason: e.to_string(),
        })
    }
}

pub struct RecordingPublisher {
    points: Mutex<Vec<MetricPoint>>,
    failing_devices: Vec<String>,
    closed: AtomicBool,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::failing_for(&[])
    }

    pub fn failing_for(devices: &[&str]) -> Self {
        Self {
            points: Mutex::new(Vec::new()),
            failing_devices: devices.iter().map(|d| d.to_string()).collect(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn points(&self) -> Vec<MetricPoint> {
        self.points.lock().unwrap().clone()
    }

    pub fn devices(&self) -> Vec<String> {
        self.points().into_iter().map(|p| p.device_name).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn publish(&self, point: &MetricPoint) -> Result<(), PublishError> {
        if self.failing_devices.contains(&point.device_name) {
            return Err(PublishError::PublishFailed {
                device: point.device_name.clone(),
                cause: "backend unavailable".to_string(),
            });
        }
        self.points.lock().unwrap().push(point.clone());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// Lets tests keep a handle on a double after boxing it
#[async_trait]
impl<P: Publisher + ?Sized> Publisher for Arc<P> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn publish(&self, point: &MetricPoint) -> Result<(), PublishError> {
        (**self).publish(point).await
    }

    async fn close(&self) {
        (**self).close().await
    }
}

#[async_trait]
impl<C: DiskCollector + ?Sized> DiskCollector for Arc<C> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn list_devices(&self) -> Result<Vec<String>, CollectError> {
        (**self).list_devices().await
    }

    async fn query(&self, device: &str) -> Result<Vec<u8>, CollectError> {
        (**self).query(device).await
    }

    fn parse(&self, device: &str, payload: &[u8]) -> Result<HealthRecord, ParseError> {
        (**self).parse(device, payload)
    }
}
