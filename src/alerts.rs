//! Alerts, repeat suppression and bank voltage checks

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Every condition the supervisor can raise
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Invalid,
    HighTemperature,
    LowTemperature,
    Deviation,
    AbnormalRise,
    GroupLag,
    SuddenDisconnection,
    AcquisitionFailure,
    ZeroVoltage,
    HighVoltage,
    LowVoltage,
    StartupFailure,
}

impl AlertKind {
    /// Raised from temperature data (blocks balancing)
    pub const fn is_temperature(self) -> bool {
        matches!(
            self,
            Self::Invalid
                | Self::HighTemperature
                | Self::LowTemperature
                | Self::Deviation
                | Self::AbnormalRise
                | Self::GroupLag
                | Self::SuddenDisconnection
                | Self::AcquisitionFailure
        )
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Invalid => "Invalid reading",
            Self::HighTemperature => "High temperature",
            Self::LowTemperature => "Low temperature",
            Self::Deviation => "High deviation",
            Self::AbnormalRise => "Abnormal temperature rise",
            Self::GroupLag => "Temperature not tracking group",
            Self::SuddenDisconnection => "Sudden disconnection",
            Self::AcquisitionFailure => "Temperature acquisition failed",
            Self::ZeroVoltage => "Zero voltage",
            Self::HighVoltage => "High voltage",
            Self::LowVoltage => "Low voltage",
            Self::StartupFailure => "Startup self-test failure",
        }
    }
}

/// One raised condition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    /// 1-based bank, when the alert is bank-scoped
    pub bank: Option<usize>,

    /// 1-based channel, when the alert is channel-scoped
    pub channel: Option<usize>,

    pub kind: AlertKind,
    pub detail: String,
}

impl Alert {
    pub fn channel(bank: usize, channel: usize, kind: AlertKind, detail: impl Into<String>) -> Self {
        Self {
            bank: Some(bank),
            channel: Some(channel),
            kind,
            detail: detail.into(),
        }
    }

    pub fn bank(bank: usize, kind: AlertKind, detail: impl Into<String>) -> Self {
        Self {
            bank: Some(bank),
            channel: None,
            kind,
            detail: detail.into(),
        }
    }

    pub fn system(kind: AlertKind, detail: impl Into<String>) -> Self {
        Self {
            bank: None,
            channel: None,
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.bank, self.channel) {
            (Some(b), Some(c)) => write!(f, "Bank {} Ch {}: {} ({})", b, c, self.kind.label(), self.detail),
            (Some(b), None) => write!(f, "Bank {}: {} ({})", b, self.kind.label(), self.detail),
            _ => write!(f, "{} ({})", self.kind.label(), self.detail),
        }
    }
}

/// Repeat-suppression state for one alert source
///
/// `last_kinds` is the sorted set of kinds the source raised in the last
/// cycle it alerted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertState {
    pub last_kinds: Vec<AlertKind>,
    pub consecutive_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum AlertKey {
    Channel(usize),
    Bank(usize),
    System(AlertKind),
}

impl AlertKey {
    const fn of(alert: &Alert) -> Self {
        match (alert.channel, alert.bank) {
            (Some(c), _) => Self::Channel(c),
            (None, Some(b)) => Self::Bank(b),
            (None, None) => Self::System(alert.kind),
        }
    }
}

/// Emit a source's alerts the first time and every fifth repeat
///
/// A repeat is a cycle in which a channel (or bank) raises the same set of
/// kinds as the last cycle it alerted; any other set resets the count.
#[derive(Debug, Default)]
pub struct AlertTracker {
    states: HashMap<AlertKey, AlertState>,
}

/// Repeats between two emissions of a persistent alert
pub const REPEAT_EVERY: u32 = 5;

impl AlertTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one cycle's alerts for a single source; returns whether to emit
    fn admit_kinds(&mut self, key: AlertKey, kinds: Vec<AlertKind>) -> bool {
        match self.states.get_mut(&key) {
            Some(state) if state.last_kinds == kinds => {
                state.consecutive_count += 1;
                state.consecutive_count % REPEAT_EVERY == 0
            }
            _ => {
                self.states.insert(
                    key,
                    AlertState {
                        last_kinds: kinds,
                        consecutive_count: 1,
                    },
                );
                true
            }
        }
    }

    /// Record a cycle in which `alert` is its source's only alert
    pub fn admit(&mut self, alert: &Alert) -> bool {
        self.admit_kinds(AlertKey::of(alert), vec![alert.kind])
    }

    /// Record one cycle's alerts; returns those to emit, in order
    pub fn filter(&mut self, alerts: &[Alert]) -> Vec<Alert> {
        let mut kinds: HashMap<AlertKey, Vec<AlertKind>> = HashMap::new();
        for alert in alerts {
            kinds.entry(AlertKey::of(alert)).or_default().push(alert.kind);
        }
        let mut emit: HashMap<AlertKey, bool> = HashMap::with_capacity(kinds.len());
        for (key, mut set) in kinds {
            set.sort_unstable();
            set.dedup();
            emit.insert(key, self.admit_kinds(key, set));
        }
        alerts
            .iter()
            .filter(|a| emit.get(&AlertKey::of(a)).copied().unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Suppression state of one channel
    pub fn channel_state(&self, channel: usize) -> Option<&AlertState> {
        self.states.get(&AlertKey::Channel(channel))
    }
}

/// Bank voltage thresholds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoltageLimits {
    pub low: f64,
    pub high: f64,
}

/// Zero, high and low checks over per-bank voltages (index 0 is bank 1)
pub fn check_voltages(voltages: &[Option<f64>], limits: VoltageLimits) -> Vec<Alert> {
    let mut alerts = Vec::new();
    for (i, v) in voltages.iter().enumerate() {
        let bank = i + 1;
        match *v {
            None => alerts.push(Alert::bank(bank, AlertKind::ZeroVoltage, "no reading")),
            Some(v) if v == 0.0 => {
                alerts.push(Alert::bank(bank, AlertKind::ZeroVoltage, "0.00V"));
            }
            Some(v) if v > limits.high => alerts.push(Alert::bank(
                bank,
                AlertKind::HighVoltage,
                format!("{:.2}V > {:.2}V", v, limits.high),
            )),
            Some(v) if v < limits.low => alerts.push(Alert::bank(
                bank,
                AlertKind::LowVoltage,
                format!("{:.2}V < {:.2}V", v, limits.low),
            )),
            Some(_) => {}
        }
    }
    alerts
}
