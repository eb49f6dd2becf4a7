//! Per-bank voltage acquisition through the multiplexer and ADC
//!
//! Each sample holds the bus for the whole select, configure, trigger, wait,
//! read sequence. Samples deviating more than 5% from the mean of their
//! attempt are discarded.

use crate::bus::BusArbiter;
use crate::config::{AdcConfig, BusConfig};
use crate::error::{BmsError, Result};
use crate::logging::{LogContext, StructuredLogger, get_logger, get_logger_with_context};
use crate::retry::{Backoff, RetryPolicy, with_retries};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Samples taken per attempt
pub const SAMPLES_PER_ATTEMPT: usize = 2;

/// Attempts before reporting no reading
pub const ATTEMPTS: u32 = 2;

/// Maximum relative deviation from the attempt mean
pub const CONSISTENCY_TOLERANCE: f64 = 0.05;

/// ADC single-byte trigger command
const TRIGGER_CONVERSION: u8 = 0x01;

/// One bank's filtered reading
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoltageReading {
    /// 1-based bank
    pub bank: usize,

    /// Mean of retained samples; `None` when nothing usable was read
    pub voltage: Option<f64>,

    /// Retained samples (volts)
    pub samples: Vec<f64>,

    /// ADC codes behind the retained samples
    pub raw_codes: Vec<i16>,
}

/// Convert an ADC code to bank volts
pub fn code_to_voltage(code: i16, adc: &AdcConfig, calibration_factor: f64) -> f64 {
    if code <= 0 {
        return 0.0;
    }
    let measured = f64::from(code) * (adc.reference_fullscale / adc.max_code);
    (measured / adc.divider_ratio) * calibration_factor
}

/// Whether each sample lies within tolerance of the set's mean
fn consistency_mask(samples: &[f64]) -> Vec<bool> {
    if samples.is_empty() {
        return Vec::new();
    }
    let avg = samples.iter().sum::<f64>() / samples.len() as f64;
    let denom = if avg == 0.0 { 1.0 } else { avg.abs() };
    samples
        .iter()
        .map(|r| (r - avg).abs() / denom <= CONSISTENCY_TOLERANCE)
        .collect()
}

/// Samples within tolerance of the set's mean
pub fn filter_consistent(samples: &[f64]) -> Vec<f64> {
    samples
        .iter()
        .zip(consistency_mask(samples))
        .filter_map(|(v, keep)| keep.then_some(*v))
        .collect()
}

/// Consistent samples together with the ADC codes they came from
pub fn retain_consistent(volts: &[f64], codes: &[i16]) -> (Vec<f64>, Vec<i16>) {
    volts
        .iter()
        .zip(codes)
        .zip(consistency_mask(volts))
        .filter_map(|((v, c), keep)| keep.then_some((*v, *c)))
        .unzip()
}

/// Drives the multiplexer and ADC under the bus lock
pub struct VoltageSampler {
    arbiter: Arc<BusArbiter>,
    adc: AdcConfig,
    adc_addr: u16,
    bank_channels: Vec<u8>,
    logger: StructuredLogger,
}

impl VoltageSampler {
    pub fn new(arbiter: Arc<BusArbiter>, bus: &BusConfig, adc: &AdcConfig) -> Self {
        Self {
            arbiter,
            adc: adc.clone(),
            adc_addr: bus.voltage_meter_address,
            bank_channels: bus.bank_mux_channels.clone(),
            logger: get_logger("voltage"),
        }
    }

    pub fn bank_count(&self) -> usize {
        self.bank_channels.len()
    }

    fn calibration_factor(&self, bank: usize) -> f64 {
        bank.checked_sub(1)
            .and_then(|i| self.adc.calibration_factors.get(i))
            .copied()
            .unwrap_or(1.0)
    }

    async fn sample(&self, bank: usize, channel: u8) -> Result<i16> {
        let mux = self.arbiter.mux_address();
        let operation = format!("voltage sample bank {}", bank);
        let mut hw = self.arbiter.lock(&operation).await?;
        hw.bus.select_channel(mux, channel)?;
        hw.bus
            .write_word(self.adc_addr, self.adc.config_register, self.adc.config_word())?;
        hw.bus.write_byte(self.adc_addr, TRIGGER_CONVERSION)?;
        sleep(Duration::from_millis(self.adc.conversion_delay_ms)).await;
        let word = hw
            .bus
            .read_word(self.adc_addr, self.adc.conversion_register)?;
        // SMBus transfers the big-endian register low byte first
        Ok(word.swap_bytes() as i16)
    }

    async fn attempt(&self, bank: usize, channel: u8) -> Result<(Vec<f64>, Vec<i16>)> {
        let factor = self.calibration_factor(bank);
        let mut volts = Vec::with_capacity(SAMPLES_PER_ATTEMPT);
        let mut codes = Vec::with_capacity(SAMPLES_PER_ATTEMPT);
        for _ in 0..SAMPLES_PER_ATTEMPT {
            match self.sample(bank, channel).await {
                Ok(code) => {
                    codes.push(code);
                    volts.push(code_to_voltage(code, &self.adc, factor));
                }
                Err(e) => self.logger.warn(&format!(
                    "Bank {} sample failed (adc {:#04x}, mux ch {}): {}",
                    bank, self.adc_addr, channel, e
                )),
            }
        }
        let (retained, codes) = retain_consistent(&volts, &codes);
        if retained.is_empty() {
            return Err(BmsError::generic(format!(
                "no consistent samples for bank {} (samples {:?})",
                bank, volts
            )));
        }
        Ok((retained, codes))
    }

    /// Read one 1-based bank
    pub async fn read_bank(&self, bank: usize) -> VoltageReading {
        let Some(&channel) = bank.checked_sub(1).and_then(|i| self.bank_channels.get(i)) else {
            self.logger
                .error(&format!("Bank {} has no multiplexer channel", bank));
            return VoltageReading {
                bank,
                voltage: None,
                samples: Vec::new(),
                raw_codes: Vec::new(),
            };
        };

        let policy = RetryPolicy::new(ATTEMPTS, Backoff::None);
        match with_retries(policy, |_| self.attempt(bank, channel)).await {
            Ok((samples, raw_codes)) => {
                let voltage = samples.iter().sum::<f64>() / samples.len() as f64;
                self.logger.trace(&format!(
                    "Bank {}: {:.3} V from samples {:?} codes {:?}",
                    bank, voltage, samples, raw_codes
                ));
                VoltageReading {
                    bank,
                    voltage: Some(voltage),
                    samples,
                    raw_codes,
                }
            }
            Err(e) => {
                let logger = get_logger_with_context(
                    LogContext::new("voltage")
                        .with_bank(bank)
                        .with_field("adc", format!("{:#04x}", self.adc_addr)),
                );
                logger.error(&format!(
                    "Bank {} voltage unavailable after {} attempts: {}",
                    bank, e.attempts, e.last
                ));
                VoltageReading {
                    bank,
                    voltage: None,
                    samples: Vec::new(),
                    raw_codes: Vec::new(),
                }
            }
        }
    }

    /// Read every bank in order
    pub async fn read_all(&self) -> Vec<VoltageReading> {
        let mut out = Vec::with_capacity(self.bank_channels.len());
        for bank in 1..=self.bank_channels.len() {
            out.push(self.read_bank(bank).await);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::banks::RelayTable;
    use crate::config::Config;
    use crate::hardware::Hardware;
    use crate::hardware::sim::SimulatedPack;

    fn sampler(voltages: Vec<f64>) -> (VoltageSampler, SimulatedPack) {
        let config = Config::default();
        let pack = SimulatedPack::new(&config, &RelayTable::three_bank_default(), voltages);
        let hw = Hardware::new(Box::new(pack.bus()), Box::new(pack.pins()));
        let arbiter = Arc::new(BusArbiter::new(hw, &config.bus));
        (
            VoltageSampler::new(arbiter, &config.bus, &config.adc),
            pack,
        )
    }

    #[test]
    fn test_code_to_voltage() {
        let adc = AdcConfig::default();
        assert_eq!(code_to_voltage(0, &adc, 1.0), 0.0);
        assert_eq!(code_to_voltage(-12, &adc, 1.0), 0.0);
        let v = code_to_voltage(1698, &adc, 1.0);
        assert!((v - 20.0).abs() < 0.01);
        let scaled = code_to_voltage(1698, &adc, 1.01);
        assert!((scaled - v * 1.01).abs() < 1e-9);
    }

    #[test]
    fn test_filter_consistent() {
        assert_eq!(filter_consistent(&[3.70, 3.72]), vec![3.70, 3.72]);
        // Both samples 33% away from their mean
        assert!(filter_consistent(&[1.0, 2.0]).is_empty());
        assert_eq!(filter_consistent(&[0.0, 0.0]), vec![0.0, 0.0]);
        assert_eq!(filter_consistent(&[4.0, 4.0, 4.0, 4.4]), vec![4.0, 4.0, 4.0]);
    }

    #[test]
    fn discarded_samples_drop_their_codes() {
        let volts = [4.0, 4.0, 4.0, 4.4];
        let codes = [340, 341, 339, 374];
        let (kept, kept_codes) = retain_consistent(&volts, &codes);
        assert_eq!(kept, vec![4.0, 4.0, 4.0]);
        assert_eq!(kept_codes, vec![340, 341, 339]);

        let (kept, kept_codes) = retain_consistent(&[1.0, 2.0], &[85, 170]);
        assert!(kept.is_empty());
        assert!(kept_codes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reads_each_bank_through_its_channel() {
        let (s, pack) = sampler(vec![20.0, 19.8, 20.5]);
        let readings = s.read_all().await;
        assert_eq!(readings.len(), 3);
        for (r, expected) in readings.iter().zip([20.0, 19.8, 20.5]) {
            let v = r.voltage.unwrap();
            assert!((v - expected).abs() < 0.02, "bank {} read {}", r.bank, v);
            assert_eq!(r.raw_codes.len(), SAMPLES_PER_ATTEMPT);
        }
        assert_eq!(pack.adc_config_writes(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_bank_reads_zero_not_none() {
        let (s, _pack) = sampler(vec![20.0, 0.0, 20.0]);
        let r = s.read_bank(2).await;
        assert_eq!(r.voltage, Some(0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_adc_gives_no_reading() {
        let (s, pack) = sampler(vec![20.0, 20.0, 20.0]);
        pack.set_absent(0x48, true);
        let r = s.read_bank(1).await;
        assert_eq!(r.voltage, None);
        assert!(r.samples.is_empty());
    }
}
