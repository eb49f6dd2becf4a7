use crate::alerts::{Alert, AlertTracker};
use crate::anomaly::TemperatureHistory;
use crate::balancing::{BalanceProgress, Interlock, SessionOutcome};
use crate::calibration::CalibrationState;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse supervisor state shown to status consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemStatus {
    Starting,
    SelfTest,
    SelfTestFailed,
    Running,
    Alert,
    Balancing,
    ShuttingDown,
}

impl fmt::Display for SystemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "Starting",
            Self::SelfTest => "Self-test",
            Self::SelfTestFailed => "Self-test failed",
            Self::Running => "Running",
            Self::Alert => "Alert",
            Self::Balancing => "Balancing",
            Self::ShuttingDown => "Shutting down",
        };
        f.write_str(s)
    }
}

/// Read-only view published after every cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    /// RFC 3339
    pub last_update: String,
    pub cycle: u64,
    pub system_status: SystemStatus,

    /// Per bank; `None` when no usable sample was read
    pub voltages: Vec<Option<f64>>,

    /// Calibrated, per channel
    pub temperatures: Vec<Option<f64>>,
    pub raw_temperatures: Vec<f64>,
    pub bank_medians: Vec<Option<f64>>,

    /// Every active alert, before repeat suppression
    pub alerts: Vec<Alert>,

    pub balancing: bool,
    pub balance_progress: Option<BalanceProgress>,
    pub calibration_locked: bool,
    pub startup_failures: Vec<String>,
}

impl StatusSnapshot {
    pub fn initial() -> Self {
        Self {
            last_update: chrono::Utc::now().to_rfc3339(),
            cycle: 0,
            system_status: SystemStatus::Starting,
            voltages: Vec::new(),
            temperatures: Vec::new(),
            raw_temperatures: Vec::new(),
            bank_medians: Vec::new(),
            alerts: Vec::new(),
            balancing: false,
            balance_progress: None,
            calibration_locked: false,
            startup_failures: Vec::new(),
        }
    }
}

/// Commands accepted by the supervisor from external components (web, etc.)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorCommand {
    /// Balance at the next cycle, waiving the rest period
    RequestBalance,
}

/// Answer to a manual balance request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct BalanceRequestOutcome {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl BalanceRequestOutcome {
    pub const fn accepted() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
        }
    }
}

/// Process-wide working state, mutated only by the control loop
#[derive(Debug, Default)]
pub struct SupervisorState {
    pub calibration: CalibrationState,
    pub tracker: AlertTracker,
    /// Last successful temperature cycle
    pub history: Option<TemperatureHistory>,
    pub cycle_count: u64,
    pub last_session: Option<SessionOutcome>,
    pub startup_failures: Vec<String>,
}

/// What one control cycle observed and did
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub alerts: Vec<Alert>,
    /// Alerts that passed repeat suppression
    pub emitted: Vec<Alert>,
    pub voltages: Vec<Option<f64>>,
    pub session: Option<SessionOutcome>,
    pub refused: Option<Interlock>,
}
