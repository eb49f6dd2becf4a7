//! Bank balancing state machine
//!
//! `Idle → Armed → Connecting → Transferring → Disconnecting → Resting`.
//! A session routes the highest bank through the DC-DC converter into the
//! lowest one for a bounded time. The controller is owned by the control loop
//! and `run_session` takes `&mut self`, so two sessions can never overlap.

use crate::banks::RelayTable;
use crate::bus::BusArbiter;
use crate::config::BalanceConfig;
use crate::logging::{LogContext, StructuredLogger, get_logger, get_logger_with_context};
use crate::voltage::VoltageSampler;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, sleep};
use uuid::Uuid;

/// Controller phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancePhase {
    Idle,
    Armed,
    Connecting,
    Transferring,
    Disconnecting,
    Resting,
}

/// Chosen bank pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BalanceDecision {
    pub source: usize,
    pub dest: usize,
    pub spread: f64,
}

/// Reason a session was refused or cut short
#[derive(Debug, Clone, PartialEq)]
pub enum Interlock {
    AlreadyActive,
    TemperatureAlerts(usize),
    NotEnoughBanks,
    MissingVoltage(usize),
    ZeroVoltage(usize),
    SpreadBelowThreshold { spread: f64, threshold: f64 },
    Resting { remaining: Duration },
    NoRelayPattern { source: usize, dest: usize },
    BusFailure(String),
    Shutdown,
}

impl fmt::Display for Interlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyActive => write!(f, "balancing already active"),
            Self::TemperatureAlerts(n) => write!(f, "{} temperature alert(s) active", n),
            Self::NotEnoughBanks => write!(f, "fewer than two banks"),
            Self::MissingVoltage(b) => write!(f, "bank {} has no voltage reading", b),
            Self::ZeroVoltage(b) => write!(f, "bank {} reads 0.00V", b),
            Self::SpreadBelowThreshold { spread, threshold } => {
                write!(f, "spread {:.3}V not above {:.3}V", spread, threshold)
            }
            Self::Resting { remaining } => {
                write!(f, "rest period, {}s remaining", remaining.as_secs())
            }
            Self::NoRelayPattern { source, dest } => {
                write!(f, "no relay pattern for {} -> {}", source, dest)
            }
            Self::BusFailure(e) => write!(f, "bus failure: {}", e),
            Self::Shutdown => write!(f, "shutdown requested"),
        }
    }
}

/// Live state of the transferring phase
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceProgress {
    pub session_id: Uuid,
    pub source: usize,
    pub dest: usize,
    pub source_voltage: Option<f64>,
    pub dest_voltage: Option<f64>,
    pub elapsed_secs: f64,
    /// 0.0 to 1.0
    pub fraction: f64,
}

/// Result of one session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOutcome {
    pub session_id: Uuid,
    pub decision: BalanceDecision,
    pub transferred_for: Duration,
    pub aborted: Option<Interlock>,
}

impl SessionOutcome {
    pub const fn completed(&self) -> bool {
        self.aborted.is_none()
    }
}

/// Timing and threshold settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BalanceSettings {
    pub difference_to_balance: f64,
    pub duration: Duration,
    pub rest_period: Duration,
    pub progress_poll: Duration,
}

impl From<&BalanceConfig> for BalanceSettings {
    fn from(c: &BalanceConfig) -> Self {
        Self {
            difference_to_balance: c.voltage_difference_to_balance,
            duration: Duration::from_secs(c.duration_secs),
            rest_period: Duration::from_secs(c.rest_period_secs),
            progress_poll: Duration::from_millis(c.progress_poll_ms.max(1)),
        }
    }
}

/// Highest and lowest bank, first index winning ties (1-based)
pub fn select_pair(voltages: &[f64]) -> Option<(usize, usize)> {
    let mut high = 0;
    let mut low = 0;
    for (i, &v) in voltages.iter().enumerate() {
        if v > voltages[high] {
            high = i;
        }
        if v < voltages[low] {
            low = i;
        }
    }
    (!voltages.is_empty()).then_some((high + 1, low + 1))
}

#[derive(Debug, Clone, Copy)]
struct TransferWindow {
    session_id: Uuid,
    decision: BalanceDecision,
    duration: Duration,
    poll: Duration,
}

pub struct BalancingController {
    settings: BalanceSettings,
    relays: RelayTable,
    phase: BalancePhase,
    last_session_end: Option<Instant>,
    logger: StructuredLogger,
}

impl BalancingController {
    pub fn new(settings: BalanceSettings, relays: RelayTable) -> Self {
        Self {
            settings,
            relays,
            phase: BalancePhase::Idle,
            last_session_end: None,
            logger: get_logger("balancing"),
        }
    }

    pub const fn settings(&self) -> &BalanceSettings {
        &self.settings
    }

    pub const fn relays(&self) -> &RelayTable {
        &self.relays
    }

    /// Current phase; `Resting` turns into `Idle` once the rest period is over
    pub fn phase(&self, now: Instant) -> BalancePhase {
        match (self.phase, self.last_session_end) {
            (BalancePhase::Resting, Some(end)) if now >= end + self.settings.rest_period => {
                BalancePhase::Idle
            }
            (phase, _) => phase,
        }
    }

    pub const fn last_session_end(&self) -> Option<Instant> {
        self.last_session_end
    }

    /// Entry check; a manual request waives only the rest period
    pub fn evaluate(
        &self,
        voltages: &[Option<f64>],
        temperature_alerts: usize,
        now: Instant,
        manual: bool,
    ) -> Result<BalanceDecision, Interlock> {
        if !matches!(self.phase(now), BalancePhase::Idle | BalancePhase::Resting) {
            return Err(Interlock::AlreadyActive);
        }
        if temperature_alerts > 0 {
            return Err(Interlock::TemperatureAlerts(temperature_alerts));
        }
        if voltages.len() < 2 {
            return Err(Interlock::NotEnoughBanks);
        }
        let mut values = Vec::with_capacity(voltages.len());
        for (i, v) in voltages.iter().enumerate() {
            match v {
                Some(v) => values.push(*v),
                None => return Err(Interlock::MissingVoltage(i + 1)),
            }
        }
        let Some((source, dest)) = select_pair(&values) else {
            return Err(Interlock::NotEnoughBanks);
        };
        let (max_v, min_v) = (values[source - 1], values[dest - 1]);
        if min_v <= 0.0 {
            return Err(Interlock::ZeroVoltage(dest));
        }
        let spread = max_v - min_v;
        if spread <= self.settings.difference_to_balance || source == dest {
            return Err(Interlock::SpreadBelowThreshold {
                spread,
                threshold: self.settings.difference_to_balance,
            });
        }
        if !manual {
            if let Some(end) = self.last_session_end {
                let ready_at = end + self.settings.rest_period;
                if now < ready_at {
                    return Err(Interlock::Resting {
                        remaining: ready_at - now,
                    });
                }
            }
        }
        Ok(BalanceDecision {
            source,
            dest,
            spread,
        })
    }

    /// Drive one session to completion or abort, always ending disconnected
    pub async fn run_session<F>(
        &mut self,
        decision: BalanceDecision,
        arbiter: &BusArbiter,
        sampler: &VoltageSampler,
        shutdown: &watch::Receiver<bool>,
        on_progress: F,
    ) -> SessionOutcome
    where
        F: FnMut(&BalanceProgress),
    {
        let (duration, poll) = (self.settings.duration, self.settings.progress_poll);
        self.run_timed(decision, duration, poll, arbiter, sampler, shutdown, on_progress)
            .await
    }

    /// Same sequence as [`run_session`](Self::run_session) with explicit
    /// transfer time and sampling interval
    #[allow(clippy::too_many_arguments)]
    pub async fn run_timed<F>(
        &mut self,
        decision: BalanceDecision,
        duration: Duration,
        poll: Duration,
        arbiter: &BusArbiter,
        sampler: &VoltageSampler,
        shutdown: &watch::Receiver<bool>,
        mut on_progress: F,
    ) -> SessionOutcome
    where
        F: FnMut(&BalanceProgress),
    {
        let session_id = Uuid::new_v4();
        let BalanceDecision { source, dest, .. } = decision;
        let logger = get_logger_with_context(
            LogContext::new("balancing")
                .with_session_id(session_id.to_string())
                .with_bank(source)
                .with_field("dest_bank", dest.to_string()),
        );
        logger.info(&format!(
            "Starting balance from bank {} to bank {} for {}s (spread {:.3}V)",
            source,
            dest,
            duration.as_secs(),
            decision.spread
        ));

        self.phase = BalancePhase::Armed;
        let mut transferred_for = Duration::ZERO;
        let aborted = match self.connect(source, dest, arbiter, sampler).await {
            Err(reason) => Some(reason),
            Ok(()) => {
                let window = TransferWindow {
                    session_id,
                    decision,
                    duration,
                    poll: poll.max(Duration::from_millis(1)),
                };
                let (elapsed, reason) = self
                    .transfer(window, arbiter, sampler, shutdown, &mut on_progress)
                    .await;
                transferred_for = elapsed;
                reason
            }
        };

        self.disconnect(arbiter).await;

        match &aborted {
            None => logger.info(&format!(
                "Balance from bank {} to bank {} completed after {:.1}s",
                source,
                dest,
                transferred_for.as_secs_f64()
            )),
            Some(reason) => logger.info(&format!(
                "Balance from bank {} to bank {} aborted: {}",
                source, dest, reason
            )),
        }

        SessionOutcome {
            session_id,
            decision,
            transferred_for,
            aborted,
        }
    }

    async fn connect(
        &mut self,
        source: usize,
        dest: usize,
        arbiter: &BusArbiter,
        sampler: &VoltageSampler,
    ) -> Result<(), Interlock> {
        self.phase = BalancePhase::Connecting;
        let mask = self.relays.pattern(source, dest);
        if mask == 0 {
            return Err(Interlock::NoRelayPattern { source, dest });
        }
        arbiter
            .set_converter_enabled(false)
            .await
            .map_err(|e| Interlock::BusFailure(e.to_string()))?;
        arbiter
            .set_relay_mask(mask)
            .await
            .map_err(|e| Interlock::BusFailure(e.to_string()))?;

        let low = sampler.read_bank(dest).await;
        match low.voltage {
            Some(v) if v > 0.0 => Ok(()),
            _ => Err(Interlock::ZeroVoltage(dest)),
        }
    }

    async fn transfer<F>(
        &mut self,
        window: TransferWindow,
        arbiter: &BusArbiter,
        sampler: &VoltageSampler,
        shutdown: &watch::Receiver<bool>,
        on_progress: &mut F,
    ) -> (Duration, Option<Interlock>)
    where
        F: FnMut(&BalanceProgress),
    {
        let TransferWindow {
            session_id,
            decision,
            duration,
            poll,
        } = window;
        self.phase = BalancePhase::Transferring;
        if let Err(e) = arbiter.set_converter_enabled(true).await {
            return (Duration::ZERO, Some(Interlock::BusFailure(e.to_string())));
        }

        let start = Instant::now();
        let mut shutdown = shutdown.clone();
        loop {
            let elapsed = start.elapsed();
            if *shutdown.borrow() {
                return (elapsed, Some(Interlock::Shutdown));
            }
            if elapsed >= duration {
                return (elapsed, None);
            }

            let source_voltage = sampler.read_bank(decision.source).await.voltage;
            let dest_voltage = sampler.read_bank(decision.dest).await.voltage;
            let elapsed = start.elapsed();
            let fraction = if duration.is_zero() {
                1.0
            } else {
                (elapsed.as_secs_f64() / duration.as_secs_f64()).min(1.0)
            };
            let progress = BalanceProgress {
                session_id,
                source: decision.source,
                dest: decision.dest,
                source_voltage,
                dest_voltage,
                elapsed_secs: elapsed.as_secs_f64(),
                fraction,
            };
            self.logger.debug(&format!(
                "Balancing progress {:.0}%: bank {} {:?}V -> bank {} {:?}V",
                fraction * 100.0,
                decision.source,
                source_voltage,
                decision.dest,
                dest_voltage
            ));
            on_progress(&progress);

            let wait = poll.min(duration.saturating_sub(elapsed));
            tokio::select! {
                () = sleep(wait) => {}
                Ok(_) = shutdown.wait_for(|stop| *stop) => {}
            }
        }
    }

    async fn disconnect(&mut self, arbiter: &BusArbiter) {
        self.phase = BalancePhase::Disconnecting;
        self.open_all(arbiter).await;
        self.last_session_end = Some(Instant::now());
        self.phase = BalancePhase::Resting;
    }

    async fn open_all(&self, arbiter: &BusArbiter) {
        if let Err(e) = arbiter.set_converter_enabled(false).await {
            self.logger
                .error(&format!("Failed to disable DC-DC converter: {}", e));
        }
        if let Err(e) = arbiter.set_relay_mask(0).await {
            self.logger.error(&format!("Failed to open relays: {}", e));
        }
    }

    /// Converter off and relays open regardless of phase
    pub async fn force_disconnect(&mut self, arbiter: &BusArbiter) {
        self.logger.info("Forcing disconnect: converter off, relays open");
        let was_active = !matches!(self.phase, BalancePhase::Idle | BalancePhase::Resting);
        self.open_all(arbiter).await;
        if was_active {
            self.last_session_end = Some(Instant::now());
        }
        self.phase = BalancePhase::Idle;
    }
}
