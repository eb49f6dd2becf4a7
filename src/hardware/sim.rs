//! Simulated rig: multiplexer, voltage meter, relay expander, GPIO outputs
//! and a temperature gateway, all backed by shared in-memory state.
//!
//! While the converter is enabled and the relay mask matches a wired pair,
//! every voltage conversion moves a fixed amount of charge from the source
//! bank to the destination bank.

use super::{HardwareBus, OutputPins};
use crate::banks::RelayTable;
use crate::config::Config;
use crate::error::{BmsError, Result};
use crate::retry::RetryPolicy;
use crate::temperature::TemperatureSource;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Volts moved per conversion while transferring
pub const DEFAULT_TRANSFER_PER_READ: f64 = 0.02;

#[derive(Debug)]
struct SimState {
    mux_addr: u16,
    adc_addr: u16,
    relay_addr: u16,
    relay_register: u8,
    conversion_register: u8,
    bank_mux_channels: Vec<u8>,
    reference_fullscale: f64,
    max_code: f64,
    divider_ratio: f64,

    voltages: Vec<f64>,
    selected: Option<u8>,
    relay_mask: u8,
    converter: bool,
    alarm: bool,
    transfer_per_read: f64,
    wiring: Vec<(u8, usize, usize)>,
    absent: Vec<u16>,
    relay_writes: Vec<u8>,
    adc_config_writes: u64,
}

impl SimState {
    fn check_present(&self, addr: u16) -> Result<()> {
        if self.absent.contains(&addr) {
            return Err(BmsError::bus_io(format!("no ACK from {:#04x}", addr)));
        }
        Ok(())
    }

    fn selected_bank(&self) -> Option<usize> {
        let ch = self.selected?;
        self.bank_mux_channels.iter().position(|&c| c == ch)
    }

    fn transfer(&mut self) {
        if !self.converter || self.relay_mask == 0 {
            return;
        }
        let mask = self.relay_mask;
        let n = self.voltages.len();
        if let Some(&(_, s, d)) = self
            .wiring
            .iter()
            .find(|(m, s, d)| *m == mask && *s <= n && *d <= n)
        {
            let amount = self.transfer_per_read.min(self.voltages[s - 1]);
            self.voltages[s - 1] -= amount;
            self.voltages[d - 1] += amount;
        }
    }

    fn conversion_code(&self, bank: usize) -> i16 {
        let volts = self.voltages.get(bank).copied().unwrap_or(0.0);
        let measured = volts * self.divider_ratio;
        let code = (measured * self.max_code / self.reference_fullscale).round();
        code.clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
    }
}

/// Simulated battery pack and bus peripherals
#[derive(Debug, Clone)]
pub struct SimulatedPack {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedPack {
    /// Build a pack wired according to `relays`, starting at `voltages`
    pub fn new(config: &Config, relays: &RelayTable, voltages: Vec<f64>) -> Self {
        let state = SimState {
            mux_addr: config.bus.multiplexer_address,
            adc_addr: config.bus.voltage_meter_address,
            relay_addr: config.bus.relay_address,
            relay_register: config.bus.relay_register,
            conversion_register: config.adc.conversion_register,
            bank_mux_channels: config.bus.bank_mux_channels.clone(),
            reference_fullscale: config.adc.reference_fullscale,
            max_code: config.adc.max_code,
            divider_ratio: config.adc.divider_ratio,
            voltages,
            selected: None,
            relay_mask: 0,
            converter: false,
            alarm: false,
            transfer_per_read: DEFAULT_TRANSFER_PER_READ,
            wiring: relays.entries().map(|(s, d, m)| (m, s, d)).collect(),
            absent: Vec::new(),
            relay_writes: Vec::new(),
            adc_config_writes: 0,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bus capability sharing this pack's state
    pub fn bus(&self) -> SimBus {
        SimBus { pack: self.clone() }
    }

    /// Output capability sharing this pack's state
    pub fn pins(&self) -> SimPins {
        SimPins { pack: self.clone() }
    }

    pub fn voltages(&self) -> Vec<f64> {
        self.lock().voltages.clone()
    }

    pub fn set_voltage(&self, bank: usize, volts: f64) {
        let mut st = self.lock();
        if let Some(v) = bank.checked_sub(1).and_then(|i| st.voltages.get_mut(i)) {
            *v = volts;
        }
    }

    pub fn set_transfer_per_read(&self, volts: f64) {
        self.lock().transfer_per_read = volts;
    }

    /// Make a device stop acknowledging
    pub fn set_absent(&self, addr: u16, absent: bool) {
        let mut st = self.lock();
        st.absent.retain(|&a| a != addr);
        if absent {
            st.absent.push(addr);
        }
    }

    pub fn relay_mask(&self) -> u8 {
        self.lock().relay_mask
    }

    pub fn converter_enabled(&self) -> bool {
        self.lock().converter
    }

    pub fn alarm_enabled(&self) -> bool {
        self.lock().alarm
    }

    /// Every mask written to the relay expander, in order
    pub fn relay_writes(&self) -> Vec<u8> {
        self.lock().relay_writes.clone()
    }

    pub fn adc_config_writes(&self) -> u64 {
        self.lock().adc_config_writes
    }
}

/// [`HardwareBus`] view of a [`SimulatedPack`]
#[derive(Debug)]
pub struct SimBus {
    pack: SimulatedPack,
}

impl HardwareBus for SimBus {
    fn write_byte(&mut self, addr: u16, value: u8) -> Result<()> {
        let mut st = self.pack.lock();
        st.check_present(addr)?;
        if addr == st.mux_addr {
            st.selected = (value != 0).then(|| value.trailing_zeros() as u8);
        }
        Ok(())
    }

    fn read_byte(&mut self, addr: u16) -> Result<u8> {
        let st = self.pack.lock();
        st.check_present(addr)?;
        if addr == st.relay_addr {
            return Ok(st.relay_mask);
        }
        Ok(0)
    }

    fn read_word(&mut self, addr: u16, reg: u8) -> Result<u16> {
        let mut st = self.pack.lock();
        st.check_present(addr)?;
        if addr != st.adc_addr || reg != st.conversion_register {
            return Ok(0);
        }
        st.transfer();
        let code = match st.selected_bank() {
            Some(bank) => st.conversion_code(bank),
            None => 0,
        };
        // SMBus words arrive low byte first
        Ok((code as u16).swap_bytes())
    }

    fn write_byte_data(&mut self, addr: u16, reg: u8, value: u8) -> Result<()> {
        let mut st = self.pack.lock();
        st.check_present(addr)?;
        if addr == st.relay_addr && reg == st.relay_register {
            st.relay_mask = value;
            st.relay_writes.push(value);
        }
        Ok(())
    }

    fn write_word(&mut self, addr: u16, _reg: u8, _value: u16) -> Result<()> {
        let mut st = self.pack.lock();
        st.check_present(addr)?;
        if addr == st.adc_addr {
            st.adc_config_writes += 1;
        }
        Ok(())
    }
}

/// [`OutputPins`] view of a [`SimulatedPack`]
#[derive(Debug)]
pub struct SimPins {
    pack: SimulatedPack,
}

impl OutputPins for SimPins {
    fn set_converter(&mut self, enabled: bool) -> Result<()> {
        self.pack.lock().converter = enabled;
        Ok(())
    }

    fn set_alarm(&mut self, enabled: bool) -> Result<()> {
        self.pack.lock().alarm = enabled;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SimTemps {
    values: Vec<f64>,
    queued: VecDeque<Vec<f64>>,
    failing: bool,
    reads: u64,
}

/// In-memory temperature gateway
#[derive(Debug, Clone, Default)]
pub struct SimulatedTemperatures {
    inner: Arc<Mutex<SimTemps>>,
}

impl SimulatedTemperatures {
    pub fn new(values: Vec<f64>) -> Self {
        let temps = SimTemps {
            values,
            ..SimTemps::default()
        };
        Self {
            inner: Arc::new(Mutex::new(temps)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimTemps> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_values(&self, values: Vec<f64>) {
        self.lock().values = values;
    }

    /// Values returned by the next read, after which they persist
    pub fn push_values(&self, values: Vec<f64>) {
        self.lock().queued.push_back(values);
    }

    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }

    pub fn read_count(&self) -> u64 {
        self.lock().reads
    }
}

#[async_trait]
impl TemperatureSource for SimulatedTemperatures {
    async fn read(&self, channels: u16, policy: RetryPolicy) -> Result<Vec<f64>> {
        let mut st = self.lock();
        st.reads += 1;
        if st.failing {
            return Err(BmsError::acquisition(
                "simulated",
                policy.attempts.max(1),
                BmsError::network("simulated gateway offline"),
            ));
        }
        if let Some(next) = st.queued.pop_front() {
            st.values = next;
        }
        let mut out = st.values.clone();
        out.resize(usize::from(channels), 0.0);
        Ok(out)
    }

    fn endpoint(&self) -> String {
        "simulated".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack() -> SimulatedPack {
        let config = Config::default();
        let relays = RelayTable::source_dest_select(3).unwrap();
        SimulatedPack::new(&config, &relays, vec![20.0, 19.8, 20.5])
    }

    #[test]
    fn conversion_follows_selected_channel() {
        let p = pack();
        let mut bus = p.bus();
        bus.select_channel(0x70, 2).unwrap();
        let word = bus.read_word(0x48, 0x00).unwrap();
        let code = word.swap_bytes() as i16;
        let volts = f64::from(code) * 6.144 / 32767.0 / 0.01592;
        assert!((volts - 20.5).abs() < 0.02);
    }

    #[test]
    fn converter_moves_charge_along_wired_pair() {
        let p = pack();
        let relays = RelayTable::source_dest_select(3).unwrap();
        let mut bus = p.bus();
        let mut pins = p.pins();
        bus.write_byte_data(0x10, 0x11, relays.pattern(3, 2)).unwrap();
        pins.set_converter(true).unwrap();
        bus.select_channel(0x70, 0).unwrap();
        bus.read_word(0x48, 0x00).unwrap();
        let v = p.voltages();
        assert!((v[2] - 20.48).abs() < 1e-9);
        assert!((v[1] - 19.82).abs() < 1e-9);
        assert!((v[0] - 20.0).abs() < 1e-9);
        assert_eq!(p.relay_writes(), vec![relays.pattern(3, 2)]);
    }

    #[test]
    fn absent_device_fails() {
        let p = pack();
        p.set_absent(0x48, true);
        assert!(p.bus().read_byte(0x48).is_err());
        p.set_absent(0x48, false);
        assert!(p.bus().read_byte(0x48).is_ok());
    }

    #[tokio::test]
    async fn simulated_temperatures_queue_and_fail() {
        let t = SimulatedTemperatures::new(vec![25.0; 4]);
        t.push_values(vec![26.0, 26.0]);
        let v = t.read(3, RetryPolicy::once()).await.unwrap();
        assert_eq!(v, vec![26.0, 26.0, 0.0]);
        t.set_failing(true);
        assert!(t.read(3, RetryPolicy::once()).await.is_err());
        assert_eq!(t.read_count(), 2);
    }
}
