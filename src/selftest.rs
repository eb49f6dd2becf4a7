//! Startup self-test
//!
//! Runs before the first control cycle: configuration sanity, bus and gateway
//! connectivity, a first full acquisition that may lock calibration, then an
//! empirical transfer test over every ordered bank pair. The caller decides
//! what to do with a failing report (alarm, notification, retry).

use crate::anomaly::{AnomalyDetector, TemperatureFrame};
use crate::balancing::{BalanceDecision, BalancingController, Interlock};
use crate::banks::BankLayout;
use crate::bus::BusArbiter;
use crate::calibration::{CalibrationEngine, CalibrationState};
use crate::config::Config;
use crate::logging::{StructuredLogger, get_logger};
use crate::retry::RetryPolicy;
use crate::supervisor::StatusPublisher;
use crate::temperature::{TemperatureLink, TemperatureSource};
use crate::voltage::VoltageSampler;
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

/// Minimum samples for a pair verdict
pub const MIN_PAIR_SAMPLES: usize = 3;

/// Verdict for one ordered bank pair
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairResult {
    pub source: usize,
    pub dest: usize,
    pub samples: usize,
    /// First minus last source sample
    pub source_drop: f64,
    /// Last minus first destination sample
    pub dest_rise: f64,
    pub passed: bool,
}

/// Everything the self-test found
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SelfTestReport {
    pub failures: Vec<String>,
    pub skipped: Vec<String>,
    pub pair_results: Vec<PairResult>,
    pub calibration_locked: bool,
    pub voltages: Vec<Option<f64>>,
    pub temperatures: Option<Vec<f64>>,
}

impl SelfTestReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Collaborators the self-test drives
pub struct SelfTestOrchestrator<'a> {
    pub config: &'a Config,
    pub layout: &'a BankLayout,
    pub arbiter: &'a BusArbiter,
    pub sampler: &'a VoltageSampler,
    pub temperatures: &'a dyn TemperatureSource,
    pub calibration: &'a CalibrationEngine,
    pub detector: &'a AnomalyDetector,
    /// Receives transfer progress while pairs are tested
    pub publisher: Option<&'a StatusPublisher>,
}

impl SelfTestOrchestrator<'_> {
    fn logger() -> StructuredLogger {
        get_logger("selftest")
    }

    /// Run every step once
    pub async fn run(
        &self,
        balancer: &mut BalancingController,
        calibration: &mut CalibrationState,
        shutdown: &watch::Receiver<bool>,
    ) -> SelfTestReport {
        let logger = Self::logger();
        logger.info("Starting self-test: configuration, connectivity, sensors and balancer");
        let mut report = SelfTestReport::default();

        self.check_configuration(balancer, &mut report);
        self.check_connectivity(&mut report).await;
        let anomalous = self.first_acquisition(calibration, &mut report).await;
        report.calibration_locked = calibration.locked;

        let all_live = report.voltages.iter().all(|v| v.is_some_and(|v| v > 0.0));
        if report.failures.is_empty() && all_live {
            self.test_pairs(balancer, &anomalous, shutdown, &mut report)
                .await;
        }

        if report.passed() {
            logger.info(&format!(
                "Self-test passed ({} pair(s) verified, {} skipped)",
                report.pair_results.len(),
                report.skipped.len()
            ));
        } else {
            logger.error(&format!(
                "Startup self-test failures: {}",
                report.failures.join("; ")
            ));
        }
        report
    }

    fn check_configuration(&self, balancer: &BalancingController, report: &mut SelfTestReport) {
        let configured = self.config.banks.count;
        let checks = [
            ("bank range table", self.layout.bank_count()),
            ("relay table", balancer.relays().bank_count()),
            ("voltage channels", self.sampler.bank_count()),
        ];
        for (what, count) in checks {
            if count != configured {
                report.failures.push(format!(
                    "Config mismatch: {} banks configured, {} has {}",
                    configured, what, count
                ));
            }
        }
    }

    async fn check_connectivity(&self, report: &mut SelfTestReport) {
        let bus = &self.config.bus;
        let adc_channel = bus.bank_mux_channels.first().copied().unwrap_or(0);
        let devices = [
            ("voltage meter", adc_channel, bus.voltage_meter_address),
            ("relay expander", bus.relay_mux_channel, bus.relay_address),
        ];
        for (name, channel, addr) in devices {
            if let Err(e) = self.arbiter.probe(channel, addr).await {
                report.failures.push(format!(
                    "I2C connectivity failure: {} {:#04x} (mux {:#04x} ch {}): {}",
                    name, addr, bus.multiplexer_address, channel, e
                ));
            }
        }

        if let Err(e) = self.temperatures.read(1, RetryPolicy::once()).await {
            report.failures.push(format!(
                "Modbus test failure ({}): {}",
                self.temperatures.endpoint(),
                e
            ));
        }
    }

    /// Returns banks with a temperature anomaly in the first reading
    async fn first_acquisition(
        &self,
        calibration: &mut CalibrationState,
        report: &mut SelfTestReport,
    ) -> BTreeSet<usize> {
        let t = &self.config.temperature;
        let mut anomalous = BTreeSet::new();

        match self
            .temperatures
            .read(t.num_channels, TemperatureLink::policy(t))
            .await
        {
            Ok(raw) => {
                self.calibration.observe(calibration, &raw, t.valid_min);
                let calibrated = calibration.calibrate(&raw, t.valid_min);
                let frame = TemperatureFrame::new(raw.clone(), calibrated, self.layout);
                for alert in self.detector.evaluate(&frame, None) {
                    if let Some(bank) = alert.bank {
                        anomalous.insert(bank);
                    }
                }
                report.temperatures = Some(raw);
            }
            Err(e) => report
                .failures
                .push(format!("Initial temp read failure: {}", e)),
        }

        report.voltages = self
            .sampler
            .read_all()
            .await
            .into_iter()
            .map(|r| r.voltage)
            .collect();
        let dead: Vec<String> = report
            .voltages
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_some_and(|v| v > 0.0))
            .map(|(i, _)| (i + 1).to_string())
            .collect();
        if !dead.is_empty() {
            report.failures.push(format!(
                "Initial voltage read failure: zero voltage on bank(s) {}",
                dead.join(", ")
            ));
        }
        anomalous
    }

    /// Ordered pairs, highest pre-test source voltage first
    fn ordered_pairs(voltages: &[Option<f64>]) -> Vec<(usize, usize)> {
        let v = |bank: usize| voltages[bank - 1].unwrap_or(0.0);
        let n = voltages.len();
        let mut pairs: Vec<(usize, usize)> = (1..=n)
            .flat_map(|s| (1..=n).filter(move |&d| d != s).map(move |d| (s, d)))
            .collect();
        pairs.sort_by(|a, b| v(b.0).total_cmp(&v(a.0)).then(v(a.1).total_cmp(&v(b.1))));
        pairs
    }

    async fn test_pairs(
        &self,
        balancer: &mut BalancingController,
        anomalous: &BTreeSet<usize>,
        shutdown: &watch::Receiver<bool>,
        report: &mut SelfTestReport,
    ) {
        let logger = Self::logger();
        let st = &self.config.self_test;
        let duration = Duration::from_secs(st.test_duration_secs);
        let interval = Duration::from_secs(st.test_read_interval_secs);
        let pairs = Self::ordered_pairs(&report.voltages);

        for (i, &(source, dest)) in pairs.iter().enumerate() {
            if *shutdown.borrow() {
                report
                    .failures
                    .push("Self-test interrupted by shutdown".to_string());
                return;
            }
            if anomalous.contains(&source) || anomalous.contains(&dest) {
                let note = format!(
                    "Skipping balance test {}->{}: temperature anomalies",
                    source, dest
                );
                logger.warn(&note);
                report.skipped.push(note);
                continue;
            }

            logger.info(&format!(
                "Testing balance: bank {} -> {} for {}s",
                source, dest, st.test_duration_secs
            ));
            let spread = report.voltages[source - 1].unwrap_or(0.0)
                - report.voltages[dest - 1].unwrap_or(0.0);
            let decision = BalanceDecision {
                source,
                dest,
                spread,
            };
            let mut trend: Vec<(f64, f64)> = Vec::new();
            let outcome = balancer
                .run_timed(
                    decision,
                    duration,
                    interval,
                    self.arbiter,
                    self.sampler,
                    shutdown,
                    |p| {
                        trend.push((
                            p.source_voltage.unwrap_or(0.0),
                            p.dest_voltage.unwrap_or(0.0),
                        ));
                        if let Some(publisher) = self.publisher {
                            publisher.update(|s| s.balance_progress = Some(p.clone()));
                        }
                    },
                )
                .await;

            match outcome.aborted {
                Some(Interlock::Shutdown) => {
                    report
                        .failures
                        .push("Self-test interrupted by shutdown".to_string());
                    return;
                }
                Some(reason) => report.failures.push(format!(
                    "Balance test {}->{} aborted: {}",
                    source, dest, reason
                )),
                None => {
                    let result = judge_pair(source, dest, &trend, st.min_voltage_delta);
                    if !result.passed {
                        report.failures.push(if result.samples < MIN_PAIR_SAMPLES {
                            format!(
                                "Balance test {}->{} failed: insufficient readings ({})",
                                source, dest, result.samples
                            )
                        } else {
                            format!(
                                "Balance test {}->{} failed: insufficient change (source Δ={:.3}V, dest Δ={:.3}V)",
                                source, dest, result.source_drop, result.dest_rise
                            )
                        });
                    }
                    report.pair_results.push(result);
                }
            }

            if i + 1 < pairs.len() {
                sleep(Duration::from_secs(st.pair_rest_secs)).await;
            }
        }
    }
}

/// Pass when the source fell and the destination rose by at least `min_delta`
pub fn judge_pair(source: usize, dest: usize, trend: &[(f64, f64)], min_delta: f64) -> PairResult {
    let (source_drop, dest_rise) = match (trend.first(), trend.last()) {
        (Some(first), Some(last)) if trend.len() >= MIN_PAIR_SAMPLES => {
            (first.0 - last.0, last.1 - first.1)
        }
        _ => (0.0, 0.0),
    };
    PairResult {
        source,
        dest,
        samples: trend.len(),
        source_drop,
        dest_rise,
        passed: trend.len() >= MIN_PAIR_SAMPLES
            && source_drop >= min_delta
            && dest_rise >= min_delta,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::Thresholds;
    use crate::balancing::BalanceSettings;
    use crate::banks::RelayTable;
    use crate::hardware::Hardware;
    use crate::hardware::sim::{SimulatedPack, SimulatedTemperatures};
    use crate::persistence::OffsetStore;
    use std::sync::Arc;

    struct Rig {
        config: Config,
        layout: BankLayout,
        pack: SimulatedPack,
        temps: SimulatedTemperatures,
        arbiter: Arc<BusArbiter>,
        sampler: VoltageSampler,
        engine: CalibrationEngine,
        detector: AnomalyDetector,
        balancer: BalancingController,
        _dir: tempfile::TempDir,
    }

    fn rig(temps: Vec<f64>) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.self_test.test_duration_secs = 5;
        config.self_test.test_read_interval_secs = 1;
        config.self_test.pair_rest_secs = 1;
        let layout = BankLayout::from_config(&config.banks, config.temperature.num_channels).unwrap();
        let relays = RelayTable::source_dest_select(3).unwrap();
        let pack = SimulatedPack::new(&config, &relays, vec![20.0, 19.8, 20.5]);
        let hw = Hardware::new(Box::new(pack.bus()), Box::new(pack.pins()));
        let arbiter = Arc::new(BusArbiter::new(hw, &config.bus));
        let sampler = VoltageSampler::new(arbiter.clone(), &config.bus, &config.adc);
        let engine = CalibrationEngine::new(OffsetStore::new(dir.path().join("offsets.txt")), 24);
        let detector = AnomalyDetector::new(Thresholds::from(&config.temperature), layout.clone());
        let balancer = BalancingController::new(BalanceSettings::from(&config.balance), relays);
        Rig {
            config,
            layout,
            pack,
            temps: SimulatedTemperatures::new(temps),
            arbiter,
            sampler,
            engine,
            detector,
            balancer,
            _dir: dir,
        }
    }

    async fn run(r: &mut Rig) -> (SelfTestReport, CalibrationState) {
        let (_tx, shutdown) = watch::channel(false);
        let mut state = CalibrationState::default();
        let orchestrator = SelfTestOrchestrator {
            config: &r.config,
            layout: &r.layout,
            arbiter: &r.arbiter,
            sampler: &r.sampler,
            temperatures: &r.temps,
            calibration: &r.engine,
            detector: &r.detector,
            publisher: None,
        };
        let report = orchestrator.run(&mut r.balancer, &mut state, &shutdown).await;
        (report, state)
    }

    #[test]
    fn pair_order_follows_source_voltage() {
        let pairs = SelfTestOrchestrator::ordered_pairs(&[Some(20.0), Some(19.8), Some(20.5)]);
        assert_eq!(pairs, vec![(3, 2), (3, 1), (1, 2), (1, 3), (2, 1), (2, 3)]);
    }

    #[test]
    fn test_judge_pair() {
        let good = [(20.5, 19.8), (20.4, 19.9), (20.3, 20.0)];
        assert!(judge_pair(3, 2, &good, 0.01).passed);
        let short = [(20.5, 19.8), (20.3, 20.0)];
        let r = judge_pair(3, 2, &short, 0.01);
        assert!(!r.passed);
        assert_eq!(r.samples, 2);
        let backwards = [(20.3, 20.0), (20.4, 19.9), (20.5, 19.8)];
        assert!(!judge_pair(3, 2, &backwards, 0.01).passed);
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_rig_passes_and_locks_calibration() {
        let mut r = rig(vec![25.0; 24]);
        let (report, state) = run(&mut r).await;
        assert!(report.passed(), "failures: {:?}", report.failures);
        assert!(state.locked);
        assert!(report.calibration_locked);
        assert_eq!(report.pair_results.len(), 6);
        assert!(report.pair_results.iter().all(|p| p.passed));
        assert_eq!(r.pack.relay_mask(), 0);
        assert!(!r.pack.converter_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn one_invalid_channel_leaves_calibration_unlocked_without_failure() {
        let mut temps = vec![25.0; 24];
        temps[4] = 0.0;
        let mut r = rig(temps);
        let (report, state) = run(&mut r).await;
        assert!(report.passed(), "failures: {:?}", report.failures);
        assert!(!state.locked);
        // Bank 1 holds the invalid channel; its four pairs are skipped
        assert_eq!(report.skipped.len(), 4);
        assert_eq!(report.pair_results.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_relay_expander_fails_and_skips_pairs() {
        let mut r = rig(vec![25.0; 24]);
        r.pack.set_absent(r.config.bus.relay_address, true);
        let (report, _) = run(&mut r).await;
        assert!(!report.passed());
        assert!(report.failures[0].starts_with("I2C connectivity failure: relay expander"));
        assert!(report.pair_results.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn gateway_down_fails() {
        let mut r = rig(vec![25.0; 24]);
        r.temps.set_failing(true);
        let (report, state) = run(&mut r).await;
        assert!(report.failures.iter().any(|f| f.starts_with("Modbus test failure")));
        assert!(report.failures.iter().any(|f| f.starts_with("Initial temp read failure")));
        assert!(!state.locked);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_converter_fails_every_pair() {
        let mut r = rig(vec![25.0; 24]);
        r.pack.set_transfer_per_read(0.0);
        let (report, _) = run(&mut r).await;
        assert_eq!(report.pair_results.len(), 6);
        assert!(report.pair_results.iter().all(|p| !p.passed));
        assert_eq!(report.failures.len(), 6);
        assert!(report.failures[0].contains("insufficient change"));
    }

    #[tokio::test(start_paused = true)]
    async fn bank_count_mismatch_is_reported() {
        let mut r = rig(vec![25.0; 24]);
        r.config.banks.count = 4;
        let (report, _) = run(&mut r).await;
        assert_eq!(
            report
                .failures
                .iter()
                .filter(|f| f.starts_with("Config mismatch"))
                .count(),
            3
        );
        assert!(report.pair_results.is_empty());
    }
}
