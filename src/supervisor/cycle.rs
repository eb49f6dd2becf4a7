use super::Supervisor;
use super::types::{CycleReport, SystemStatus};
use crate::alerts::{Alert, AlertKind, VoltageLimits, check_voltages};
use crate::anomaly::{TemperatureFrame, TemperatureHistory};
use crate::temperature::TemperatureLink;
use tokio::time::Instant;

impl Supervisor {
    /// Read temperatures and raise temperature alerts
    async fn acquire_temperatures(&mut self) -> (TemperatureFrame, Vec<Alert>) {
        let t = &self.config.temperature;
        let channels = self.layout.channel_count();
        match self
            .temperatures
            .read(t.num_channels, TemperatureLink::policy(t))
            .await
        {
            Ok(raw) => {
                let valid_min = t.valid_min;
                self.calibration
                    .observe(&mut self.state.calibration, &raw, valid_min);
                let calibrated = self.state.calibration.calibrate(&raw, valid_min);
                let frame = TemperatureFrame::new(raw, calibrated, &self.layout);
                let alerts = self.detector.evaluate(&frame, self.state.history.as_ref());
                self.state.history = Some(TemperatureHistory::from(&frame));
                (frame, alerts)
            }
            Err(e) => {
                self.logger
                    .error(&format!("Temperature acquisition failed: {}", e));
                let frame = TemperatureFrame::new(Vec::new(), vec![None; channels], &self.layout);
                let alert = Alert::system(AlertKind::AcquisitionFailure, e.to_string());
                (frame, vec![alert])
            }
        }
    }

    /// One acquisition, detection, balancing and publish pass
    pub async fn run_cycle(&mut self) -> CycleReport {
        self.drain_commands();

        let (frame, mut alerts) = self.acquire_temperatures().await;
        let temperature_alerts = alerts.iter().filter(|a| a.kind.is_temperature()).count();

        let voltages: Vec<Option<f64>> = self
            .sampler
            .read_all()
            .await
            .into_iter()
            .map(|r| r.voltage)
            .collect();
        let limits = VoltageLimits {
            low: self.config.balance.low_voltage_threshold,
            high: self.config.balance.high_voltage_threshold,
        };
        alerts.extend(check_voltages(&voltages, limits));

        let emitted = self.state.tracker.filter(&alerts);
        for alert in &emitted {
            self.logger.warn(&format!("Alert: {}", alert));
        }
        if !emitted.is_empty() {
            self.notifier.notify_alerts(&emitted).await;
        }
        if let Err(e) = self.arbiter.set_alarm_enabled(!alerts.is_empty()).await {
            self.logger
                .error(&format!("Failed to drive alarm output: {}", e));
        }

        self.state.cycle_count += 1;
        let cycle = self.state.cycle_count;
        let locked = self.state.calibration.locked;
        let status = if alerts.is_empty() {
            SystemStatus::Running
        } else {
            SystemStatus::Alert
        };
        {
            let alerts = alerts.clone();
            let voltages = voltages.clone();
            let frame = frame.clone();
            self.publisher.update(|s| {
                s.cycle = cycle;
                s.system_status = status;
                s.voltages = voltages;
                s.temperatures = frame.calibrated;
                s.raw_temperatures = frame.raw;
                s.bank_medians = frame.bank_medians;
                s.alerts = alerts;
                s.balancing = false;
                s.balance_progress = None;
                s.calibration_locked = locked;
            });
        }

        let mut report = CycleReport {
            alerts,
            emitted,
            voltages,
            session: None,
            refused: None,
        };
        self.balance_if_needed(temperature_alerts, &mut report).await;
        report
    }

    async fn balance_if_needed(&mut self, temperature_alerts: usize, report: &mut CycleReport) {
        let manual = std::mem::take(&mut self.manual_requested);
        let decision =
            match self
                .balancer
                .evaluate(&report.voltages, temperature_alerts, Instant::now(), manual)
            {
                Ok(d) => d,
                Err(reason) => {
                    if manual {
                        self.logger
                            .info(&format!("Manual balance request refused: {}", reason));
                    } else {
                        self.logger.debug(&format!("Not balancing: {}", reason));
                    }
                    report.refused = Some(reason);
                    return;
                }
            };

        self.publisher.update(|s| {
            s.balancing = true;
            s.system_status = SystemStatus::Balancing;
        });
        let publisher = &self.publisher;
        let outcome = self
            .balancer
            .run_session(
                decision,
                &self.arbiter,
                &self.sampler,
                &self.shutdown,
                |p| publisher.update(|s| s.balance_progress = Some(p.clone())),
            )
            .await;

        let status = if report.alerts.is_empty() {
            SystemStatus::Running
        } else {
            SystemStatus::Alert
        };
        self.publisher.update(|s| {
            s.balancing = false;
            s.balance_progress = None;
            s.system_status = status;
        });
        self.state.last_session = Some(outcome.clone());
        report.session = Some(outcome);
    }
}
