//! Control loop for Bankwarden
//!
//! Owns every core component and the process-wide working state. One task
//! runs the startup self-test, then repeats the cycle: temperatures,
//! calibration and anomaly rules, voltages, alerts, balancing, publish.
//! External components only see a [`SupervisorHandle`].

mod commands;
mod cycle;
mod snapshot;
mod types;

pub use commands::{SupervisorHandle, evaluate_request};
pub use snapshot::StatusPublisher;
pub use types::{
    BalanceRequestOutcome, CycleReport, StatusSnapshot, SupervisorCommand, SupervisorState,
    SystemStatus,
};

use crate::anomaly::{AnomalyDetector, Thresholds};
use crate::balancing::{BalanceSettings, BalancingController};
use crate::banks::{BankLayout, RelayTable};
use crate::bus::BusArbiter;
use crate::calibration::CalibrationEngine;
use crate::config::Config;
use crate::error::Result;
use crate::hardware::Hardware;
use crate::logging::{StructuredLogger, get_logger};
use crate::notify::{AlertSink, RateLimitedNotifier};
use crate::persistence::OffsetStore;
use crate::selftest::{SelfTestOrchestrator, SelfTestReport};
use crate::temperature::TemperatureSource;
use crate::voltage::VoltageSampler;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;

/// Battery bank supervisor
pub struct Supervisor {
    config: Config,
    layout: BankLayout,
    arbiter: Arc<BusArbiter>,
    sampler: VoltageSampler,
    temperatures: Arc<dyn TemperatureSource>,
    calibration: CalibrationEngine,
    detector: AnomalyDetector,
    balancer: BalancingController,
    notifier: RateLimitedNotifier,
    publisher: StatusPublisher,

    /// Command receiver for external control
    commands_rx: mpsc::UnboundedReceiver<SupervisorCommand>,
    manual_requested: bool,

    shutdown: watch::Receiver<bool>,
    state: SupervisorState,
    logger: StructuredLogger,
}

impl Supervisor {
    /// Wire the core over `hardware` and `temperatures`
    ///
    /// `config` must already be validated.
    pub fn new(
        config: Config,
        hardware: Hardware,
        relays: RelayTable,
        temperatures: Arc<dyn TemperatureSource>,
        sink: Arc<dyn AlertSink>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(Self, SupervisorHandle)> {
        let layout = BankLayout::from_config(&config.banks, config.temperature.num_channels)?;
        let arbiter = Arc::new(BusArbiter::new(hardware, &config.bus));
        let sampler = VoltageSampler::new(arbiter.clone(), &config.bus, &config.adc);
        let calibration = CalibrationEngine::new(
            OffsetStore::new(&config.calibration.offsets_file),
            layout.channel_count(),
        );
        let detector = AnomalyDetector::new(Thresholds::from(&config.temperature), layout.clone());
        let balancer = BalancingController::new(BalanceSettings::from(&config.balance), relays);
        let notifier = RateLimitedNotifier::new(sink, &config.alerts);
        let publisher = StatusPublisher::new();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let handle = SupervisorHandle::new(
            publisher.subscribe(),
            commands_tx,
            config.balance.voltage_difference_to_balance,
        );
        let supervisor = Self {
            config,
            layout,
            arbiter,
            sampler,
            temperatures,
            calibration,
            detector,
            balancer,
            notifier,
            publisher,
            commands_rx,
            manual_requested: false,
            shutdown,
            state: SupervisorState::default(),
            logger: get_logger("supervisor"),
        };
        Ok((supervisor, handle))
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    pub const fn state(&self) -> &SupervisorState {
        &self.state
    }

    pub const fn publisher(&self) -> &StatusPublisher {
        &self.publisher
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleep up to `duration`, waking early on shutdown
    async fn pause(&self, duration: Duration) {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            () = sleep(duration) => {}
            Ok(_) = shutdown.wait_for(|stop| *stop) => {}
        }
    }

    /// One self-test pass, publishing its outcome
    pub async fn run_self_test(&mut self) -> SelfTestReport {
        self.publisher
            .update(|s| s.system_status = SystemStatus::SelfTest);
        let publisher = &self.publisher;
        let orchestrator = SelfTestOrchestrator {
            config: &self.config,
            layout: &self.layout,
            arbiter: &self.arbiter,
            sampler: &self.sampler,
            temperatures: self.temperatures.as_ref(),
            calibration: &self.calibration,
            detector: &self.detector,
            publisher: Some(publisher),
        };
        let report = orchestrator
            .run(&mut self.balancer, &mut self.state.calibration, &self.shutdown)
            .await;

        self.state.startup_failures.clone_from(&report.failures);
        let locked = self.state.calibration.locked;
        let failures = report.failures.clone();
        let voltages = report.voltages.clone();
        self.publisher.update(|s| {
            s.system_status = if failures.is_empty() {
                SystemStatus::Running
            } else {
                SystemStatus::SelfTestFailed
            };
            s.startup_failures = failures;
            s.voltages = voltages;
            s.calibration_locked = locked;
            s.balance_progress = None;
        });

        if !report.passed() {
            if let Err(e) = self.arbiter.set_alarm_enabled(true).await {
                self.logger
                    .error(&format!("Failed to assert alarm output: {}", e));
            }
            self.notifier
                .notify_startup_failures(&report.failures)
                .await;
        }
        report
    }

    /// Repeat the self-test until it passes; false if shutdown came first
    async fn pass_self_test(&mut self) -> bool {
        let cooldown = Duration::from_secs(self.config.self_test.retry_cooldown_secs);
        let heartbeat = self.config.temperature.poll_interval().max(Duration::from_secs(1));
        loop {
            let report = self.run_self_test().await;
            if report.passed() {
                return true;
            }
            self.logger.warn(&format!(
                "Self-test failed; retrying in {}s",
                cooldown.as_secs()
            ));

            let deadline = tokio::time::Instant::now() + cooldown;
            while tokio::time::Instant::now() < deadline {
                if self.shutdown_requested() {
                    return false;
                }
                let left = deadline.saturating_duration_since(tokio::time::Instant::now());
                self.pause(heartbeat.min(left)).await;
                // Keep the snapshot fresh for the watchdog while waiting
                self.publisher.update(|_| {});
            }
            if self.shutdown_requested() {
                return false;
            }
        }
    }

    /// Run until shutdown is signalled, then leave the pack disconnected
    pub async fn run(&mut self) -> Result<()> {
        self.logger.info("Starting battery supervisor");
        self.calibration.restore(&mut self.state.calibration);

        if self.config.self_test.enabled {
            if !self.pass_self_test().await {
                self.finish().await;
                return Ok(());
            }
        } else {
            self.logger.info("Startup self-test disabled via configuration");
            self.publisher
                .update(|s| s.system_status = SystemStatus::Running);
        }

        let pause = self
            .config
            .temperature
            .poll_interval()
            .min(Duration::from_secs(self.config.balance.sleep_between_checks_secs));
        while !self.shutdown_requested() {
            self.run_cycle().await;
            if self.shutdown_requested() {
                break;
            }
            self.pause(pause).await;
        }

        self.finish().await;
        Ok(())
    }

    async fn finish(&mut self) {
        self.logger.info("Shutting down: disconnecting banks");
        self.publisher
            .update(|s| s.system_status = SystemStatus::ShuttingDown);
        self.balancer.force_disconnect(&self.arbiter).await;
        if let Err(e) = self.arbiter.set_alarm_enabled(false).await {
            self.logger
                .error(&format!("Failed to release alarm output: {}", e));
        }
    }
}
