//! Temperature anomaly rules
//!
//! Per channel: invalid reading, absolute limits, deviation from the bank
//! median. Between consecutive cycles: abnormal rise, lag behind the bank's
//! median rise, sudden disconnection. The detector is stateless; the caller
//! owns the previous-cycle history.

use crate::alerts::{Alert, AlertKind};
use crate::banks::BankLayout;
use crate::calibration::median;
use crate::config::TemperatureConfig;
use serde::Serialize;

/// Rule thresholds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub valid_min: f64,
    pub high: f64,
    pub low: f64,
    pub abs_deviation: f64,
    pub rel_deviation: f64,
    pub rise: f64,
    pub lag: f64,
}

impl From<&TemperatureConfig> for Thresholds {
    fn from(c: &TemperatureConfig) -> Self {
        Self {
            valid_min: c.valid_min,
            high: c.high_threshold,
            low: c.low_threshold,
            abs_deviation: c.abs_deviation_threshold,
            rel_deviation: c.deviation_threshold,
            rise: c.rise_threshold,
            lag: c.disconnection_lag_threshold,
        }
    }
}

/// Median of each bank's valid calibrated temperatures
pub fn bank_medians(calibrated: &[Option<f64>], layout: &BankLayout) -> Vec<Option<f64>> {
    layout
        .split(calibrated)
        .into_iter()
        .map(|bank| {
            let valid: Vec<f64> = bank.iter().flatten().copied().collect();
            median(&valid)
        })
        .collect()
}

/// One cycle's temperature data
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemperatureFrame {
    pub raw: Vec<f64>,
    pub calibrated: Vec<Option<f64>>,
    pub bank_medians: Vec<Option<f64>>,
}

impl TemperatureFrame {
    pub fn new(raw: Vec<f64>, calibrated: Vec<Option<f64>>, layout: &BankLayout) -> Self {
        let bank_medians = bank_medians(&calibrated, layout);
        Self {
            raw,
            calibrated,
            bank_medians,
        }
    }
}

/// Previous successful cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemperatureHistory {
    pub calibrated: Vec<Option<f64>>,
    pub bank_medians: Vec<Option<f64>>,
}

impl From<&TemperatureFrame> for TemperatureHistory {
    fn from(frame: &TemperatureFrame) -> Self {
        Self {
            calibrated: frame.calibrated.clone(),
            bank_medians: frame.bank_medians.clone(),
        }
    }
}

/// Evaluates every rule over a frame
#[derive(Debug, Clone)]
pub struct AnomalyDetector {
    thresholds: Thresholds,
    layout: BankLayout,
}

impl AnomalyDetector {
    pub const fn new(thresholds: Thresholds, layout: BankLayout) -> Self {
        Self { thresholds, layout }
    }

    pub const fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// All alerts raised by `frame`, before repeat suppression
    pub fn evaluate(
        &self,
        frame: &TemperatureFrame,
        previous: Option<&TemperatureHistory>,
    ) -> Vec<Alert> {
        let mut alerts = Vec::new();
        self.check_levels(frame, &mut alerts);
        if let Some(prev) = previous {
            self.check_changes(frame, prev, &mut alerts);
        }
        alerts
    }

    fn check_levels(&self, frame: &TemperatureFrame, alerts: &mut Vec<Alert>) {
        let t = &self.thresholds;
        for (i, &raw) in frame.raw.iter().enumerate() {
            let ch = i + 1;
            let bank = self.layout.bank_for_channel(ch).unwrap_or(0);

            if raw <= t.valid_min {
                alerts.push(Alert::channel(
                    bank,
                    ch,
                    AlertKind::Invalid,
                    format!("{:.1} <= {}", raw, t.valid_min),
                ));
                continue;
            }
            let Some(calib) = frame.calibrated.get(i).copied().flatten() else {
                continue;
            };

            if calib > t.high {
                alerts.push(Alert::channel(
                    bank,
                    ch,
                    AlertKind::HighTemperature,
                    format!("{:.1}°C > {}°C", calib, t.high),
                ));
            }
            if calib < t.low {
                alerts.push(Alert::channel(
                    bank,
                    ch,
                    AlertKind::LowTemperature,
                    format!("{:.1}°C < {}°C", calib, t.low),
                ));
            }

            let Some(bank_median) = bank
                .checked_sub(1)
                .and_then(|b| frame.bank_medians.get(b).copied().flatten())
            else {
                continue;
            };
            let abs_dev = (calib - bank_median).abs();
            let rel_dev = if bank_median == 0.0 {
                0.0
            } else {
                abs_dev / bank_median.abs()
            };
            if abs_dev > t.abs_deviation || rel_dev > t.rel_deviation {
                alerts.push(Alert::channel(
                    bank,
                    ch,
                    AlertKind::Deviation,
                    format!(
                        "abs {:.1}°C or {:.2}% from bank median {:.1}°C",
                        abs_dev,
                        rel_dev * 100.0,
                        bank_median
                    ),
                ));
            }
        }
    }

    fn check_changes(
        &self,
        frame: &TemperatureFrame,
        prev: &TemperatureHistory,
        alerts: &mut Vec<Alert>,
    ) {
        let t = &self.thresholds;
        for bank in 1..=self.layout.bank_count() {
            let median_rise = match (
                frame.bank_medians.get(bank - 1).copied().flatten(),
                prev.bank_medians.get(bank - 1).copied().flatten(),
            ) {
                (Some(now), Some(before)) => Some(now - before),
                _ => None,
            };

            for ch in self.layout.channels(bank) {
                let current = frame.calibrated.get(ch - 1).copied().flatten();
                let previous = prev.calibrated.get(ch - 1).copied().flatten();

                match (current, previous) {
                    (Some(now), Some(before)) => {
                        let rise = now - before;
                        if rise > t.rise {
                            alerts.push(Alert::channel(
                                bank,
                                ch,
                                AlertKind::AbnormalRise,
                                format!("{:.1}°C since last cycle", rise),
                            ));
                        }
                        if let Some(group) = median_rise {
                            if (rise - group).abs() > t.lag {
                                alerts.push(Alert::channel(
                                    bank,
                                    ch,
                                    AlertKind::GroupLag,
                                    format!("channel rise {:.1}°C vs bank {:.1}°C", rise, group),
                                ));
                            }
                        }
                    }
                    (None, Some(before)) => alerts.push(Alert::channel(
                        bank,
                        ch,
                        AlertKind::SuddenDisconnection,
                        format!("was {:.1}°C, now invalid", before),
                    )),
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> BankLayout {
        BankLayout::from_ranges(&[[1, 4], [5, 8]], 8).unwrap()
    }

    fn detector() -> AnomalyDetector {
        AnomalyDetector::new(Thresholds::from(&TemperatureConfig::default()), layout())
    }

    fn frame(raw: &[f64]) -> TemperatureFrame {
        let calibrated = raw.iter().map(|&r| (r > 0.0).then_some(r)).collect();
        TemperatureFrame::new(raw.to_vec(), calibrated, &layout())
    }

    fn kinds(alerts: &[Alert]) -> Vec<(usize, AlertKind)> {
        alerts
            .iter()
            .map(|a| (a.channel.unwrap_or(0), a.kind))
            .collect()
    }

    #[test]
    fn quiet_pack_raises_nothing() {
        let f = frame(&[25.0; 8]);
        assert!(detector().evaluate(&f, None).is_empty());
    }

    #[test]
    fn deviation_boundary_is_exclusive() {
        // Bank median stays 25.0; 27.0 is exactly the absolute threshold
        let at = frame(&[25.0, 25.0, 25.0, 27.0, 25.0, 25.0, 25.0, 25.0]);
        assert_eq!(at.bank_medians[0], Some(25.0));
        assert!(detector().evaluate(&at, None).is_empty());

        let above = frame(&[25.0, 25.0, 25.0, 28.0, 25.0, 25.0, 25.0, 25.0]);
        assert_eq!(
            kinds(&detector().evaluate(&above, None)),
            vec![(4, AlertKind::Deviation)]
        );
    }

    #[test]
    fn relative_deviation_alone_triggers() {
        // 1.5 abs (below 2.0) but 15% of a 10.0 median
        let f = frame(&[10.0, 10.0, 10.0, 11.5, 25.0, 25.0, 25.0, 25.0]);
        assert_eq!(kinds(&detector().evaluate(&f, None)), vec![(4, AlertKind::Deviation)]);
    }

    #[test]
    fn invalid_reading_skips_other_level_checks() {
        let f = frame(&[25.0, 0.0, 25.0, 61.0, 25.0, 25.0, 25.0, 25.0]);
        let k = kinds(&detector().evaluate(&f, None));
        assert_eq!(
            k,
            vec![
                (2, AlertKind::Invalid),
                (4, AlertKind::HighTemperature),
                (4, AlertKind::Deviation),
            ]
        );
    }

    #[test]
    fn empty_bank_has_no_median() {
        let f = frame(&[0.0, 0.0, 0.0, 0.0, 25.0, 25.0, 25.0, 25.0]);
        assert_eq!(f.bank_medians, vec![None, Some(25.0)]);
        let k = kinds(&detector().evaluate(&f, None));
        assert_eq!(k.len(), 4);
        assert!(k.iter().all(|(_, kind)| *kind == AlertKind::Invalid));
    }

    #[test]
    fn rise_lag_and_disconnection() {
        let d = detector();
        let before = frame(&[25.0; 8]);
        let history = TemperatureHistory::from(&before);

        let now = frame(&[25.2, 25.2, 25.2, 27.6, 25.0, 0.0, 25.0, 25.0]);
        let k = kinds(&d.evaluate(&now, Some(&history)));
        assert!(k.contains(&(4, AlertKind::AbnormalRise)));
        // bank 1 median rise is 0.2; channel 4 rose 2.6
        assert!(k.contains(&(4, AlertKind::GroupLag)));
        assert!(k.contains(&(6, AlertKind::SuddenDisconnection)));
        assert!(k.contains(&(6, AlertKind::Invalid)));
        assert!(!k.iter().any(|(ch, _)| *ch == 1 || *ch == 5));
    }

    #[test]
    fn first_cycle_skips_change_rules() {
        let f = frame(&[25.0, 25.0, 25.0, 25.0, 25.0, 0.0, 25.0, 25.0]);
        let k = kinds(&detector().evaluate(&f, None));
        assert_eq!(k, vec![(6, AlertKind::Invalid)]);
    }
}
