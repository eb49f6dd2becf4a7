//! Startup temperature calibration
//!
//! The pack is assumed thermally uniform at startup. The first full set of
//! valid readings (or a persisted set) fixes a reference median and one
//! offset per channel; once locked the state never changes for the life of
//! the process.

use crate::logging::{StructuredLogger, get_logger};
use crate::persistence::{OffsetStore, PersistedOffsets};
use serde::Serialize;

/// Reference median and per-channel offsets
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CalibrationState {
    pub locked: bool,
    pub reference_median: f64,
    pub offsets: Vec<f64>,
}

impl CalibrationState {
    /// Calibrated temperature per channel; `None` for invalid readings
    pub fn calibrate(&self, raw: &[f64], valid_min: f64) -> Vec<Option<f64>> {
        raw.iter()
            .enumerate()
            .map(|(i, &r)| {
                if r <= valid_min {
                    None
                } else if self.locked {
                    Some(r + self.offsets.get(i).copied().unwrap_or(0.0))
                } else {
                    Some(r)
                }
            })
            .collect()
    }

    fn lock_with(&mut self, persisted: PersistedOffsets) {
        self.reference_median = persisted.reference_median;
        self.offsets = persisted.offsets;
        self.locked = true;
    }
}

/// Median of a set; mean of the two middle values for even counts
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Locks calibration and keeps the offsets file in sync
pub struct CalibrationEngine {
    store: OffsetStore,
    channel_count: usize,
    logger: StructuredLogger,
}

impl CalibrationEngine {
    pub fn new(store: OffsetStore, channel_count: usize) -> Self {
        Self {
            store,
            channel_count,
            logger: get_logger("calibration"),
        }
    }

    /// Lock from the offsets file alone; returns whether the state is locked
    pub fn restore(&self, state: &mut CalibrationState) -> bool {
        if state.locked {
            return true;
        }
        if let Some(persisted) = self.store.load(self.channel_count) {
            state.lock_with(persisted);
            self.logger.info("Calibration restored from offsets file");
        }
        state.locked
    }

    /// Lock from a reading set if every channel is valid
    ///
    /// Persisted offsets with a matching channel count take precedence over
    /// freshly computed ones. Returns `true` only when this call locked the
    /// state; an already locked state is left untouched.
    pub fn observe(&self, state: &mut CalibrationState, raw: &[f64], valid_min: f64) -> bool {
        if state.locked {
            return false;
        }
        if raw.len() != self.channel_count || raw.iter().any(|&r| r <= valid_min) {
            self.logger.debug("Calibration deferred: not every channel is valid");
            return false;
        }

        if let Some(persisted) = self.store.load(self.channel_count) {
            state.lock_with(persisted);
            self.logger.info("Calibration locked from persisted offsets");
            return true;
        }

        let Some(reference_median) = median(raw) else {
            return false;
        };
        let persisted = PersistedOffsets {
            reference_median,
            offsets: raw.iter().map(|r| reference_median - r).collect(),
        };
        if let Err(e) = self.store.save(&persisted) {
            self.logger.error(&format!(
                "Failed to persist offsets to {}: {}",
                self.store.path().display(),
                e
            ));
        }
        state.lock_with(persisted);
        self.logger.info(&format!(
            "Calibration locked: reference median {:.2} over {} channels",
            reference_median, self.channel_count
        ));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(dir: &tempfile::TempDir, channels: usize) -> CalibrationEngine {
        CalibrationEngine::new(OffsetStore::new(dir.path().join("offsets.txt")), channels)
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&[]), None);
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
    }

    #[test]
    fn reference_is_median_of_valid_readings() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(&dir, 4);
        let mut state = CalibrationState::default();
        assert!(eng.observe(&mut state, &[25.0, 26.0, 24.0, 27.0], 0.0));
        assert!(state.locked);
        assert_eq!(state.reference_median, 25.5);
        assert_eq!(state.offsets, vec![0.5, -0.5, 1.5, -1.5]);
        let cal = state.calibrate(&[25.0, 26.0, 24.0, 27.0], 0.0);
        assert!(cal.iter().all(|c| *c == Some(25.5)));
    }

    #[test]
    fn lock_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(&dir, 3);
        let mut state = CalibrationState::default();
        eng.observe(&mut state, &[20.0, 21.0, 22.0], 0.0);
        let locked = state.clone();
        for readings in [[30.0, 31.0, 29.0], [10.0, 10.0, 10.0], [21.0, 20.0, 22.0]] {
            assert!(!eng.observe(&mut state, &readings, 0.0));
            assert_eq!(state, locked);
        }
    }

    #[test]
    fn invalid_channel_keeps_unlocked() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(&dir, 3);
        let mut state = CalibrationState::default();
        assert!(!eng.observe(&mut state, &[20.0, 0.0, 22.0], 0.0));
        assert!(!state.locked);
        assert_eq!(
            state.calibrate(&[20.0, 0.0, 22.0], 0.0),
            vec![Some(20.0), None, Some(22.0)]
        );
        assert!(!dir.path().join("offsets.txt").exists());
    }

    #[test]
    fn persisted_offsets_take_precedence() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("offsets.txt"), "30\n1\n2\n3\n").unwrap();
        let eng = engine(&dir, 3);
        let mut state = CalibrationState::default();
        assert!(eng.observe(&mut state, &[20.0, 21.0, 22.0], 0.0));
        assert_eq!(state.reference_median, 30.0);
        assert_eq!(state.offsets, vec![1.0, 2.0, 3.0]);

        let mut restored = CalibrationState::default();
        assert!(eng.restore(&mut restored));
        assert_eq!(restored, state);
    }

    #[test]
    fn mismatched_file_is_recomputed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("offsets.txt"), "30\n1\n2\n").unwrap();
        let eng = engine(&dir, 3);
        let mut state = CalibrationState::default();
        assert!(!eng.restore(&mut state));
        assert!(eng.observe(&mut state, &[20.0, 21.0, 22.0], 0.0));
        assert_eq!(state.reference_median, 21.0);
        let text = std::fs::read_to_string(dir.path().join("offsets.txt")).unwrap();
        assert_eq!(text.lines().count(), 4);
    }
}
