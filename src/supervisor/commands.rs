use super::Supervisor;
use super::types::{BalanceRequestOutcome, StatusSnapshot, SupervisorCommand, SystemStatus};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Cloneable handle given to external components
///
/// Reads the latest snapshot and forwards balance requests to the control
/// loop; it never touches the working state.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    snapshot_rx: watch::Receiver<Arc<StatusSnapshot>>,
    commands_tx: mpsc::UnboundedSender<SupervisorCommand>,
    balance_threshold: f64,
}

impl SupervisorHandle {
    pub(crate) const fn new(
        snapshot_rx: watch::Receiver<Arc<StatusSnapshot>>,
        commands_tx: mpsc::UnboundedSender<SupervisorCommand>,
        balance_threshold: f64,
    ) -> Self {
        Self {
            snapshot_rx,
            commands_tx,
            balance_threshold,
        }
    }

    pub fn snapshot(&self) -> Arc<StatusSnapshot> {
        self.snapshot_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<StatusSnapshot>> {
        self.snapshot_rx.clone()
    }

    /// Check a manual request against the latest snapshot and queue it
    pub fn request_balance(&self) -> BalanceRequestOutcome {
        let outcome = evaluate_request(&self.snapshot(), self.balance_threshold);
        if !outcome.accepted {
            return outcome;
        }
        match self.commands_tx.send(SupervisorCommand::RequestBalance) {
            Ok(()) => outcome,
            Err(_) => BalanceRequestOutcome::rejected("Supervisor is not running"),
        }
    }
}

/// Request admission against a snapshot
pub fn evaluate_request(snapshot: &StatusSnapshot, threshold: f64) -> BalanceRequestOutcome {
    if snapshot.balancing {
        return BalanceRequestOutcome::rejected("Balancing already in progress");
    }
    if !matches!(
        snapshot.system_status,
        SystemStatus::Running | SystemStatus::Alert
    ) {
        return BalanceRequestOutcome::rejected(format!(
            "Supervisor is {}",
            snapshot.system_status
        ));
    }
    if !snapshot.alerts.is_empty() {
        return BalanceRequestOutcome::rejected(format!(
            "{} alert(s) active",
            snapshot.alerts.len()
        ));
    }
    let mut values = Vec::with_capacity(snapshot.voltages.len());
    for (i, v) in snapshot.voltages.iter().enumerate() {
        match v {
            Some(v) => values.push(*v),
            None => return BalanceRequestOutcome::rejected(format!("Bank {} has no reading", i + 1)),
        }
    }
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    if values.len() < 2 || max - min <= threshold {
        return BalanceRequestOutcome::rejected("Voltage spread below threshold");
    }
    BalanceRequestOutcome::accepted()
}

impl Supervisor {
    pub(crate) fn handle_command(&mut self, cmd: SupervisorCommand) {
        match cmd {
            SupervisorCommand::RequestBalance => {
                self.logger.info("Manual balance request queued for next cycle");
                self.manual_requested = true;
            }
        }
    }

    /// Apply every queued command without waiting
    pub(crate) fn drain_commands(&mut self) {
        while let Ok(cmd) = self.commands_rx.try_recv() {
            self.handle_command(cmd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{Alert, AlertKind};

    fn running(voltages: Vec<Option<f64>>) -> StatusSnapshot {
        StatusSnapshot {
            system_status: SystemStatus::Running,
            voltages,
            ..StatusSnapshot::initial()
        }
    }

    #[test]
    fn accepts_wide_spread() {
        let s = running(vec![Some(20.0), Some(19.8), Some(20.5)]);
        assert_eq!(evaluate_request(&s, 0.1), BalanceRequestOutcome::accepted());
    }

    #[test]
    fn rejections() {
        let narrow = running(vec![Some(20.0), Some(20.05)]);
        assert_eq!(
            evaluate_request(&narrow, 0.1).reason.as_deref(),
            Some("Voltage spread below threshold")
        );

        let mut busy = running(vec![Some(20.0), Some(19.0)]);
        busy.balancing = true;
        assert!(!evaluate_request(&busy, 0.1).accepted);

        let mut alerting = running(vec![Some(20.0), Some(19.0)]);
        alerting.alerts = vec![Alert::bank(1, AlertKind::HighVoltage, "x")];
        assert_eq!(
            evaluate_request(&alerting, 0.1).reason.as_deref(),
            Some("1 alert(s) active")
        );

        let starting = StatusSnapshot::initial();
        assert!(!evaluate_request(&starting, 0.1).accepted);

        let missing = running(vec![Some(20.0), None]);
        assert!(!evaluate_request(&missing, 0.1).accepted);
    }

    #[tokio::test]
    async fn handle_queues_accepted_requests_only() {
        let (snap_tx, snap_rx) = watch::channel(Arc::new(running(vec![Some(20.0), Some(19.0)])));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = SupervisorHandle::new(snap_rx, tx, 0.1);

        assert!(handle.request_balance().accepted);
        assert_eq!(rx.try_recv().ok(), Some(SupervisorCommand::RequestBalance));

        snap_tx.send_replace(Arc::new(running(vec![Some(20.0), Some(20.0)])));
        assert!(!handle.request_balance().accepted);
        assert!(rx.try_recv().is_err());

        drop(rx);
        snap_tx.send_replace(Arc::new(running(vec![Some(20.0), Some(19.0)])));
        assert_eq!(
            handle.request_balance(),
            BalanceRequestOutcome::rejected("Supervisor is not running")
        );
    }
}
