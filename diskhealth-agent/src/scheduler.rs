//! Collection scheduler
//!
//! Drives the pipeline on a fixed cadence: enumerate devices, then for every
//! device query → parse → classify → publish. Devices of one tick are
//! processed concurrently and the tick ends only once all of them are done.
//!
//! Cancellation is cooperative. The signal task and the timer loop share a
//! [`Shutdown`] handle backed by a watch channel; the loop checks it at tick
//! boundaries and before each device query. A tick that yields no classified
//! device at all escalates through the same handle after a cooldown.

use crate::classify::{classify, Classification, Policy};
use crate::collector::DiskCollector;
use crate::error::CollectError;
use crate::publisher::{MetricPoint, Publisher};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Owner side of the cancellation flag
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request the service to stop. Idempotent.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of the cancellation flag
#[derive(Clone)]
pub struct ShutdownToken {
    rx: watch::Receiver<bool>,
}

impl ShutdownToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `stop()` has been called
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|stopped| *stopped).await.is_err() {
            // sender gone: nobody can cancel any more
            std::future::pending::<()>().await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Polling,
    Stopped,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    pub poll_interval: Duration,
    pub degraded_cooldown: Duration,
}

/// Why [`Scheduler::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// External stop request
    Cancelled,
    /// A tick produced no classified device
    Degraded,
}

/// Result of one device within a tick
#[derive(Debug)]
pub enum DeviceOutcome {
    Classified {
        classification: Classification,
        temperature_celsius: Option<i64>,
        published: bool,
    },
    Failed {
        device: String,
        stage: &'static str,
        error: String,
    },
    /// Not queried because cancellation was observed first
    Skipped { device: String },
}

/// Everything one tick did, consumed by the loop and by `--once`
#[derive(Debug, Default)]
pub struct TickReport {
    /// `None` when enumeration failed or the tick never started
    pub enumerated: Option<usize>,
    pub enumeration_error: Option<String>,
    pub outcomes: Vec<DeviceOutcome>,
    pub cancelled: bool,
}

impl TickReport {
    pub fn classified(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, DeviceOutcome::Classified { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, DeviceOutcome::Failed { .. }))
            .count()
    }

    pub fn published(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, DeviceOutcome::Classified { published: true, .. }))
            .count()
    }

    pub fn publish_failures(&self) -> usize {
        self.classified() - self.published()
    }

    /// Devices were listed (possibly none) yet nothing could be classified.
    /// Enumeration failures and cancelled ticks never count.
    pub fn is_degraded(&self) -> bool {
        !self.cancelled && self.enumerated.is_some() && self.classified() == 0
    }

    pub fn log_summary(&self) {
        let skipped = self.outcomes.len() - self.classified() - self.failed();
        info!(
            devices = self.enumerated.unwrap_or(0),
            classified = self.classified(),
            failed = self.failed(),
            skipped,
            published = self.published(),
            publish_failures = self.publish_failures(),
            "Tick complete"
        );
    }
}

pub struct Scheduler {
    collector: Box<dyn DiskCollector>,
    publisher: Arc<dyn Publisher>,
    policy: Policy,
    settings: SchedulerSettings,
    state: SchedulerState,
}

impl Scheduler {
    pub fn new(
        collector: Box<dyn DiskCollector>,
        publisher: Arc<dyn Publisher>,
        policy: Policy,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            collector,
            publisher,
            policy,
            settings,
            state: SchedulerState::Idle,
        }
    }

    fn set_state(&mut self, state: SchedulerState) {
        if self.state != state {
            debug!("Scheduler {:?} → {:?}", self.state, state);
            self.state = state;
        }
    }

    /// Poll until cancelled or degraded. Returns exactly once.
    pub async fn run(&mut self, shutdown: &Shutdown) -> ExitReason {
        let mut token = shutdown.token();
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Polling {} every {}s",
            self.collector.name(),
            self.settings.poll_interval.as_secs_f64()
        );

        let reason = loop {
            self.set_state(SchedulerState::Idle);

            tokio::select! {
                biased;
                _ = token.cancelled() => break ExitReason::Cancelled,
                _ = ticker.tick() => {}
            }

            self.set_state(SchedulerState::Polling);
            let report = self.run_tick(&token).await;
            report.log_summary();

            if report.cancelled {
                break ExitReason::Cancelled;
            }

            if report.is_degraded() {
                self.set_state(SchedulerState::Idle);
                error!(
                    "No device could be classified this tick; shutting down in {}s",
                    self.settings.degraded_cooldown.as_secs()
                );
                let interrupted = tokio::select! {
                    biased;
                    _ = token.cancelled() => true,
                    _ = tokio::time::sleep(self.settings.degraded_cooldown) => false,
                };
                if interrupted {
                    break ExitReason::Cancelled;
                }
                shutdown.stop();
                break ExitReason::Degraded;
            }
        };

        self.set_state(SchedulerState::Stopped);
        info!(reason = ?reason, "Scheduler stopped");
        reason
    }

    /// One enumerate → per-device pipeline pass
    pub async fn run_tick(&self, token: &ShutdownToken) -> TickReport {
        if token.is_cancelled() {
            return TickReport {
                cancelled: true,
                ..TickReport::default()
            };
        }

        let devices = match self.collector.list_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                warn!(stage = e.stage(), "Tick skipped: {}", e);
                return TickReport {
                    enumeration_error: Some(e.to_string()),
                    cancelled: token.is_cancelled(),
                    ..TickReport::default()
                };
            }
        };
        debug!("Enumerated {} device(s): {:?}", devices.len(), devices);

        let outcomes = join_all(devices.iter().map(|device| self.process_device(device, token))).await;

        TickReport {
            enumerated: Some(devices.len()),
            enumeration_error: None,
            outcomes,
            cancelled: token.is_cancelled(),
        }
    }

    async fn process_device(&self, device: &str, token: &ShutdownToken) -> DeviceOutcome {
        if token.is_cancelled() {
            return DeviceOutcome::Skipped {
                device: device.to_string(),
            };
        }

        let payload = match self.collector.query(device).await {
            Ok(payload) => payload,
            Err(e) => {
                log_collect_error(device, &e);
                return DeviceOutcome::Failed {
                    device: device.to_string(),
                    stage: e.stage(),
                    error: e.to_string(),
                };
            }
        };

        let record = match self.collector.parse(device, &payload) {
            Ok(record) => record,
            Err(e) => {
                warn!(device = %device, stage = "parse", "{}", e);
                return DeviceOutcome::Failed {
                    device: device.to_string(),
                    stage: "parse",
                    error: e.to_string(),
                };
            }
        };

        let classification = classify(&record, &self.policy);
        info!(
            device = %classification.device_name,
            verdict = %classification.verdict,
            "{}",
            classification.reason
        );

        let published = match MetricPoint::from_classification(&classification, record.temperature_celsius) {
            Some(point) => match self.publisher.publish(&point).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(device = %point.device_name, stage = "publish", "{}", e);
                    false
                }
            },
            None => false,
        };

        DeviceOutcome::Classified {
            classification,
            temperature_celsius: record.temperature_celsius,
            published,
        }
    }
}

fn log_collect_error(device: &str, err: &CollectError) {
    match err {
        CollectError::PermissionDenied { .. } => {
            error!(
                device = %device,
                stage = err.stage(),
                "{} (the agent needs root/Administrator rights to read disk health)",
                err
            );
        }
        _ => warn!(device = %device, stage = err.stage(), "{}", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Verdict;
    use crate::record::HealthRecord;
    use crate::testing::{RecordingPublisher, Scripted, ScriptedCollector};

    fn settings() -> SchedulerSettings {
        SchedulerSettings {
            poll_interval: Duration::from_millis(20),
            degraded_cooldown: Duration::from_millis(20),
        }
    }

    fn scheduler(collector: &Arc<ScriptedCollector>, publisher: &Arc<RecordingPublisher>) -> Scheduler {
        Scheduler::new(
            Box::new(collector.clone()),
            publisher.clone(),
            Policy::default(),
            settings(),
        )
    }

    fn healthy(name: &str) -> Scripted {
        Scripted::Record(HealthRecord::new(name, true).with_temperature(35))
    }

    #[tokio::test]
    async fn test_parse_failure_does_not_block_sibling() {
        let collector = Arc::new(
            ScriptedCollector::new()
                .device("/dev/sda", healthy("/dev/sda"))
                .device("/dev/sdb", Scripted::Garbage("not json")),
        );
        let publisher = Arc::new(RecordingPublisher::new());
        let scheduler = scheduler(&collector, &publisher);

        let report = scheduler.run_tick(&Shutdown::new().token()).await;
        assert_eq!(report.enumerated, Some(2));
        assert_eq!(report.classified(), 1);
        assert_eq!(report.failed(), 1);
        assert!(!report.is_degraded());
        assert_eq!(publisher.devices(), vec!["/dev/sda"]);

        let point = &publisher.points()[0];
        assert_eq!(point.status, 0);
        assert_eq!(point.temperature_celsius, Some(35));

        let failure = report
            .outcomes
            .iter()
            .find_map(|o| match o {
                DeviceOutcome::Failed { device, stage, .. } => Some((device.clone(), *stage)),
                _ => None,
            })
            .unwrap();
        assert_eq!(failure, ("/dev/sdb".to_string(), "parse"));
    }

    #[tokio::test]
    async fn test_query_failures_are_per_device() {
        let collector = Arc::new(
            ScriptedCollector::new()
                .device("/dev/sda", Scripted::PermissionDenied)
                .device("/dev/sdb", Scripted::ExitStatus(2))
                .device("/dev/sdc", Scripted::ToolMissing)
                .device("/dev/sdd", Scripted::Record(HealthRecord::new("/dev/sdd", false))),
        );
        let publisher = Arc::new(RecordingPublisher::new());
        let report = scheduler(&collector, &publisher).run_tick(&Shutdown::new().token()).await;

        assert_eq!(report.failed(), 3);
        assert_eq!(report.classified(), 1);
        assert_eq!(collector.queried().len(), 4);
        let points = publisher.points();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].status, 2);
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_block_remaining_points() {
        let collector = Arc::new(
            ScriptedCollector::new()
                .device("/dev/sda", healthy("/dev/sda"))
                .device("/dev/sdb", healthy("/dev/sdb")),
        );
        let publisher = Arc::new(RecordingPublisher::failing_for(&["/dev/sda"]));
        let report = scheduler(&collector, &publisher).run_tick(&Shutdown::new().token()).await;

        assert_eq!(report.classified(), 2);
        assert_eq!(report.published(), 1);
        assert_eq!(report.publish_failures(), 1);
        assert!(!report.is_degraded());
        assert_eq!(publisher.devices(), vec!["/dev/sdb"]);
    }

    #[tokio::test]
    async fn test_classification_carries_verdict() {
        let record = HealthRecord::new("/dev/sda", true).with_temperature(75);
        let collector = Arc::new(ScriptedCollector::new().device("/dev/sda", Scripted::Record(record)));
        let publisher = Arc::new(RecordingPublisher::new());
        let report = scheduler(&collector, &publisher).run_tick(&Shutdown::new().token()).await;

        match &report.outcomes[0] {
            DeviceOutcome::Classified { classification, published, .. } => {
                assert_eq!(classification.verdict, Verdict::Warning);
                assert_eq!(classification.reason, "temperature exceeds 70°C.");
                assert!(*published);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_all_devices_failing_degrades_once() {
        let collector = Arc::new(
            ScriptedCollector::new()
                .device("/dev/sda", Scripted::ExitStatus(2))
                .device("/dev/sdb", Scripted::Garbage("{")),
        );
        let publisher = Arc::new(RecordingPublisher::new());
        let mut scheduler = scheduler(&collector, &publisher);
        let shutdown = Shutdown::new();
        let token = shutdown.token();

        let reason = scheduler.run(&shutdown).await;
        assert_eq!(reason, ExitReason::Degraded);
        assert_eq!(collector.enumerations(), 1);
        assert!(token.is_cancelled());
        assert_eq!(scheduler.state, SchedulerState::Stopped);
        assert!(publisher.points().is_empty());
    }

    #[tokio::test]
    async fn test_zero_devices_is_degraded() {
        let collector = Arc::new(ScriptedCollector::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let report = scheduler(&collector, &publisher).run_tick(&Shutdown::new().token()).await;
        assert_eq!(report.enumerated, Some(0));
        assert!(report.is_degraded());

        let reason = scheduler(&collector, &publisher).run(&Shutdown::new()).await;
        assert_eq!(reason, ExitReason::Degraded);
    }

    #[tokio::test]
    async fn test_enumeration_failure_skips_tick_and_keeps_polling() {
        let collector = Arc::new(ScriptedCollector::unreachable("lsblk exploded"));
        let publisher = Arc::new(RecordingPublisher::new());
        let mut scheduler = scheduler(&collector, &publisher);

        let report = scheduler.run_tick(&Shutdown::new().token()).await;
        assert!(report.enumerated.is_none());
        assert!(report.enumeration_error.as_deref().unwrap().contains("lsblk exploded"));
        assert!(!report.is_degraded());

        let shutdown = Shutdown::new();
        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(90)).await;
            stopper.stop();
        });

        let before = collector.enumerations();
        let reason = scheduler.run(&shutdown).await;
        assert_eq!(reason, ExitReason::Cancelled);
        assert!(collector.enumerations() - before >= 2);
        assert!(publisher.points().is_empty());
    }

    #[tokio::test]
    async fn test_stop_before_run_never_enumerates() {
        let collector = Arc::new(ScriptedCollector::new().device("/dev/sda", healthy("/dev/sda")));
        let publisher = Arc::new(RecordingPublisher::new());
        let mut scheduler = scheduler(&collector, &publisher);
        let shutdown = Shutdown::new();
        shutdown.stop();

        assert_eq!(scheduler.run(&shutdown).await, ExitReason::Cancelled);
        assert_eq!(collector.enumerations(), 0);
        assert_eq!(scheduler.state, SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn test_cancelled_tick_is_not_degraded() {
        let collector = Arc::new(ScriptedCollector::new().device("/dev/sda", healthy("/dev/sda")));
        let publisher = Arc::new(RecordingPublisher::new());
        let shutdown = Shutdown::new();
        shutdown.stop();

        let report = scheduler(&collector, &publisher).run_tick(&shutdown.token()).await;
        assert!(report.cancelled);
        assert!(!report.is_degraded());
        assert!(collector.queried().is_empty());
    }

    #[tokio::test]
    async fn test_stop_mid_tick_finishes_started_device() {
        let shutdown = Shutdown::new();
        let collector = Arc::new(
            ScriptedCollector::new()
                .device("/dev/sda", healthy("/dev/sda"))
                .device("/dev/sdb", healthy("/dev/sdb"))
                .device("/dev/sdc", healthy("/dev/sdc"))
                .stopping_during("/dev/sda", &shutdown),
        );
        let publisher = Arc::new(RecordingPublisher::new());

        let report = scheduler(&collector, &publisher).run_tick(&shutdown.token()).await;
        assert!(report.cancelled);
        assert!(!report.is_degraded());
        assert_eq!(report.classified(), 1);
        assert_eq!(publisher.devices(), vec!["/dev/sda"]);
        let skipped: Vec<&str> = report
            .outcomes
            .iter()
            .filter_map(|o| match o {
                DeviceOutcome::Skipped { device } => Some(device.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(skipped, vec!["/dev/sdb", "/dev/sdc"]);
        assert_eq!(collector.queried(), vec!["/dev/sda"]);

        // same scenario through the loop: no second tick once the stop is seen
        let shutdown = Shutdown::new();
        let collector = Arc::new(
            ScriptedCollector::new()
                .device("/dev/sda", healthy("/dev/sda"))
                .device("/dev/sdb", healthy("/dev/sdb"))
                .stopping_during("/dev/sda", &shutdown),
        );
        let publisher = Arc::new(RecordingPublisher::new());
        let mut looping = scheduler(&collector, &publisher);

        assert_eq!(looping.run(&shutdown).await, ExitReason::Cancelled);
        assert_eq!(collector.enumerations(), 1);
        assert_eq!(publisher.devices(), vec!["/dev/sda"]);
        assert_eq!(looping.state, SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn test_healthy_service_runs_until_stopped() {
        let collector = Arc::new(ScriptedCollector::new().device("/dev/sda", healthy("/dev/sda")));
        let publisher = Arc::new(RecordingPublisher::new());
        let mut scheduler = scheduler(&collector, &publisher);
        let shutdown = Shutdown::new();
        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(70)).await;
            stopper.stop();
        });

        assert_eq!(scheduler.run(&shutdown).await, ExitReason::Cancelled);
        assert!(publisher.points().len() >= 2);
    }

    #[tokio::test]
    async fn test_token_wakes_waiters() {
        let shutdown = Shutdown::new();
        let mut token = shutdown.token();
        assert!(!token.is_cancelled());
        let waiter = tokio::spawn(async move {
            token.cancelled().await;
            token.is_cancelled()
        });
        shutdown.stop();
        shutdown.stop();
        assert!(waiter.await.unwrap());
    }
}
