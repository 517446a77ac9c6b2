//! Cohort lifecycle and crash recovery.
//!
//! The [`Supervisor`] discovers the expected devices, runs one
//! [`DeviceSession`] per device plus the [`AggregationPipeline`] under a
//! single cancellation scope, and waits for the first failure. A failure of
//! any task cancels its siblings, stops every session, waits a fixed backoff
//! and starts a fresh cohort. There is no per-device retry.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use posture_types::{DeviceIdentity, IndicatorCode, Role, SensorSet};

use crate::barrier::ReadinessBarrier;
use crate::error::{Error, Result};
use crate::events::{CohortEvent, EventDispatcher};
use crate::feedback::WarningFlag;
use crate::pipeline::{AggregationPipeline, DeviceFeed, PipelineMode};
use crate::session::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_LIVENESS_INTERVAL, DeviceSession, SessionConfig,
};
use crate::transport::GattTransport;
use crate::util::{addresses_match, bounded};

/// Default wait between a cohort failure and the next attempt.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);

/// Default scan window per discovery attempt.
pub const DEFAULT_SCAN_WINDOW: Duration = Duration::from_secs(5);

/// One expected device.
#[derive(Debug, Clone)]
pub struct DeviceSpec {
    /// Address and role.
    pub identity: DeviceIdentity,
    /// Sensors to enable.
    pub sensors: SensorSet,
    /// Whether the device drives its LED/buzzer from the warning flag.
    pub indicator: bool,
}

impl DeviceSpec {
    /// A device with the given sensors and no indicator.
    pub fn new(identity: DeviceIdentity, sensors: SensorSet) -> Self {
        Self {
            identity,
            sensors,
            indicator: false,
        }
    }

    /// Enable the indicator.
    #[must_use]
    pub fn with_indicator(mut self) -> Self {
        self.indicator = true;
        self
    }
}

/// Timing of the supervision loop.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Connect budget per device.
    pub connect_timeout: Duration,
    /// Liveness polling interval per session.
    pub liveness_interval: Duration,
    /// Wait between a failure and the next cohort.
    pub backoff: Duration,
    /// Scan window per discovery attempt.
    pub scan_window: Duration,
    /// Code shown by indicator devices while the warning is active.
    pub warning_code: IndicatorCode,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            liveness_interval: DEFAULT_LIVENESS_INTERVAL,
            backoff: DEFAULT_BACKOFF,
            scan_window: DEFAULT_SCAN_WINDOW,
            warning_code: IndicatorCode::RedBuzzer,
        }
    }
}

/// How a cohort ended.
#[derive(Debug)]
enum CohortOutcome {
    /// Shutdown was requested or the export duration elapsed.
    Finished,
    /// A task failed; the cohort must be restarted.
    Failed { role: Option<Role>, error: Error },
}

/// Result of one task of the cohort.
enum TaskOutcome {
    Session(Box<DeviceSession>, Result<()>),
    Pipeline(Result<()>),
    Status,
}

/// Owner of every cohort.
pub struct Supervisor {
    transport: Arc<dyn GattTransport>,
    devices: Vec<DeviceSpec>,
    config: SupervisorConfig,
    mode: PipelineMode,
    events: EventDispatcher,
    warning: WarningFlag,
    emitted: Arc<AtomicU64>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("devices", &self.devices)
            .field("config", &self.config)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Create a supervisor.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] if `devices` is empty or repeats a role or an
    /// address.
    pub fn new(
        transport: Arc<dyn GattTransport>,
        devices: Vec<DeviceSpec>,
        config: SupervisorConfig,
        mode: PipelineMode,
    ) -> Result<Self> {
        if devices.is_empty() {
            return Err(Error::invalid_config("no devices configured"));
        }
        let mut roles = HashSet::new();
        for (i, device) in devices.iter().enumerate() {
            if !roles.insert(device.identity.role) {
                return Err(Error::invalid_config(format!(
                    "role '{}' is assigned to more than one device",
                    device.identity.role
                )));
            }
            if devices[..i]
                .iter()
                .any(|other| addresses_match(&other.identity.address, &device.identity.address))
            {
                return Err(Error::invalid_config(format!(
                    "address '{}' is listed more than once",
                    device.identity.address
                )));
            }
        }

        Ok(Self {
            transport,
            devices,
            config,
            mode,
            events: EventDispatcher::default(),
            warning: WarningFlag::new(),
            emitted: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Use an existing event dispatcher.
    #[must_use]
    pub fn with_events(mut self, events: EventDispatcher) -> Self {
        self.events = events;
        self
    }

    /// Use an existing warning flag.
    #[must_use]
    pub fn with_warning_flag(mut self, warning: WarningFlag) -> Self {
        self.warning = warning;
        self
    }

    /// Dispatcher for cohort events.
    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    /// The posture warning flag shared with every cohort.
    pub fn warning_flag(&self) -> WarningFlag {
        self.warning.clone()
    }

    /// Expected devices.
    pub fn devices(&self) -> &[DeviceSpec] {
        &self.devices
    }

    /// Run cohorts until `shutdown` fires or, in export mode, the configured
    /// duration has elapsed. Both are clean exits.
    ///
    /// The export duration is measured from this call and includes discovery
    /// and restarts.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let deadline = match &self.mode {
            PipelineMode::Export(settings) => Some(Instant::now() + settings.duration),
            PipelineMode::Live(_) => None,
        };
        info!(
            devices = self.devices.len(),
            export = self.mode.is_export(),
            "supervisor started"
        );

        let mut generation = 0u64;
        loop {
            generation += 1;
            if !self.discover_all(&shutdown, deadline).await {
                break;
            }

            match self.run_cohort(generation, &shutdown, deadline).await {
                CohortOutcome::Finished => break,
                CohortOutcome::Failed { role, error } => {
                    error!(
                        generation,
                        role = role.map(|r| r.as_str()).unwrap_or("pipeline"),
                        error = %error,
                        "cohort failed"
                    );
                    self.events.send(CohortEvent::CohortFailed {
                        generation,
                        role,
                        error: error.to_string(),
                    });
                }
            }

            info!(backoff_secs = self.config.backoff.as_secs_f64(), "restarting cohort after backoff");
            self.events.send(CohortEvent::Restarting {
                backoff: self.config.backoff,
            });
            if bounded(&shutdown, deadline, sleep(self.config.backoff))
                .await
                .is_none()
            {
                break;
            }
        }

        info!(generations = generation, "supervisor finished");
        self.events.send(CohortEvent::Finished);
        Ok(())
    }

    /// Scan until every expected device is visible.
    ///
    /// Returns `false` if shutdown or the deadline interrupted discovery.
    async fn discover_all(&self, shutdown: &CancellationToken, deadline: Option<Instant>) -> bool {
        let addresses: Vec<String> = self
            .devices
            .iter()
            .map(|d| d.identity.address.clone())
            .collect();

        loop {
            let scan = bounded(
                shutdown,
                deadline,
                self.transport.discover(&addresses, self.config.scan_window),
            )
            .await;
            let visible = match scan {
                None => return false,
                Some(Ok(visible)) => visible,
                Some(Err(e)) => {
                    warn!(error = %e, "scan failed");
                    if bounded(shutdown, deadline, sleep(self.config.backoff))
                        .await
                        .is_none()
                    {
                        return false;
                    }
                    continue;
                }
            };

            let missing: Vec<&str> = self
                .devices
                .iter()
                .filter(|d| !visible.contains(&d.identity.address))
                .map(|d| d.identity.role.as_str())
                .collect();
            if missing.is_empty() {
                info!("all sensors visible");
                return true;
            }
            info!(missing = ?missing, "waiting for sensors");
        }
    }

    #[tracing::instrument(level = "info", skip(self, shutdown, deadline))]
    async fn run_cohort(
        &self,
        generation: u64,
        shutdown: &CancellationToken,
        deadline: Option<Instant>,
    ) -> CohortOutcome {
        let cancel = shutdown.child_token();
        let barrier = ReadinessBarrier::new(self.devices.iter().map(|d| d.identity.clone()));
        info!(devices = self.devices.len(), "starting cohort");
        self.events.send(CohortEvent::CohortStarted { generation });

        let mut tasks: JoinSet<TaskOutcome> = JoinSet::new();
        let mut feeds = Vec::with_capacity(self.devices.len());

        for spec in &self.devices {
            let mut config = SessionConfig::new(spec.identity.clone(), spec.sensors.clone())
                .connect_timeout(self.config.connect_timeout)
                .liveness_interval(self.config.liveness_interval);
            if spec.indicator {
                config = config.indicator(self.config.warning_code);
            }
            let mut session = DeviceSession::new(
                config,
                barrier.clone(),
                self.events.clone(),
                self.warning.clone(),
            );
            feeds.push(DeviceFeed {
                identity: spec.identity.clone(),
                sensors: spec.sensors.clone(),
                snapshots: session.snapshots(),
            });

            let transport = Arc::clone(&self.transport);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let result = session.run(transport.as_ref(), &cancel).await;
                TaskOutcome::Session(Box::new(session), result)
            });
        }

        let pipeline = AggregationPipeline::new(
            feeds,
            barrier.clone(),
            self.events.clone(),
            self.mode.clone(),
        )
        .with_counter(Arc::clone(&self.emitted));
        {
            let cancel = cancel.clone();
            tasks.spawn(async move { TaskOutcome::Pipeline(pipeline.run(&cancel, deadline).await) });
        }

        {
            let cancel = cancel.clone();
            let events = self.events.clone();
            tasks.spawn(async move {
                if let Some(Ok(())) = bounded(&cancel, None, barrier.wait_all()).await {
                    info!(generation, "all sensors streaming");
                    events.send(CohortEvent::CohortReady { generation });
                }
                TaskOutcome::Status
            });
        }

        let mut sessions = Vec::with_capacity(self.devices.len());
        let outcome = loop {
            let expiry = async {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("shutdown requested");
                    break CohortOutcome::Finished;
                }
                _ = expiry => {
                    info!("export duration reached");
                    break CohortOutcome::Finished;
                }
                joined = tasks.join_next() => match joined {
                    None => break CohortOutcome::Finished,
                    Some(Ok(TaskOutcome::Session(session, result))) => {
                        let role = session.identity().role;
                        sessions.push(session);
                        if let Err(error) = result {
                            break CohortOutcome::Failed { role: Some(role), error };
                        }
                    }
                    Some(Ok(TaskOutcome::Pipeline(Ok(())))) => break CohortOutcome::Finished,
                    Some(Ok(TaskOutcome::Pipeline(Err(error)))) => {
                        break CohortOutcome::Failed { role: None, error };
                    }
                    Some(Ok(TaskOutcome::Status)) => {}
                    Some(Err(e)) => {
                        break CohortOutcome::Failed {
                            role: None,
                            error: Error::Task(e.to_string()),
                        };
                    }
                },
            }
        };

        cancel.cancel();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(TaskOutcome::Session(session, result)) => {
                    if let Err(e) = result {
                        debug!(device = %session.identity(), error = %e, "session ended with error during teardown");
                    }
                    sessions.push(session);
                }
                Ok(TaskOutcome::Pipeline(Err(e))) => {
                    debug!(error = %e, "pipeline ended with error during teardown");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "task failed during teardown"),
            }
        }
        for session in &sessions {
            session.stop().await;
        }
        info!(sessions = sessions.len(), "cohort torn down");

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MemorySink, MockTransport};
    use crate::pipeline::ExportSettings;
    use crate::sink::shared;

    fn mode() -> PipelineMode {
        PipelineMode::Export(ExportSettings {
            duration: Duration::from_secs(10),
            label: None,
            samples_per_row: 1,
            sample_interval: Duration::from_millis(500),
            sink: shared(MemorySink::new()),
        })
    }

    fn spec(address: &str, role: Role) -> DeviceSpec {
        DeviceSpec::new(DeviceIdentity::new(address, role), SensorSet::default())
    }

    #[test]
    fn test_rejects_empty_cohort() {
        let result = Supervisor::new(
            Arc::new(MockTransport::new()),
            Vec::new(),
            SupervisorConfig::default(),
            mode(),
        );
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_duplicate_role() {
        let result = Supervisor::new(
            Arc::new(MockTransport::new()),
            vec![spec("AA:01", Role::Neck), spec("AA:02", Role::Neck)],
            SupervisorConfig::default(),
            mode(),
        );
        let err = result.unwrap_err();
        assert!(err.to_string().contains("neck"));
    }

    #[test]
    fn test_rejects_duplicate_address() {
        let result = Supervisor::new(
            Arc::new(MockTransport::new()),
            vec![spec("aa:01", Role::Neck), spec("AA:01", Role::BackMid)],
            SupervisorConfig::default(),
            mode(),
        );
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_discovery() {
        let transport = Arc::new(MockTransport::new());
        transport.add("AA:01").set_visible(false);
        let supervisor = Supervisor::new(
            transport.clone(),
            vec![spec("AA:01", Role::Neck)],
            SupervisorConfig::default(),
            mode(),
        )
        .unwrap();
        let mut events = supervisor.events().subscribe();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(supervisor.run(shutdown.clone()));
        sleep(Duration::from_secs(3)).await;
        shutdown.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(events.recv().await.unwrap(), CohortEvent::Finished);
        assert_eq!(transport.peripheral("AA:01").unwrap().connect_count(), 0);
    }

    #[test]
    fn test_default_config() {
        let config = SupervisorConfig::default();
        assert_eq!(config.backoff, Duration::from_secs(5));
        assert_eq!(config.connect_timeout, Duration::from_secs(15));
        assert_eq!(config.warning_code, IndicatorCode::RedBuzzer);
    }
}
