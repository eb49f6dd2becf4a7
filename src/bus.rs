//! Arbitration of the shared hardware bus
//!
//! The multiplexer, voltage meter, relay expander and GPIO outputs sit behind
//! one async mutex. Every access waits at most the configured lock timeout;
//! on expiry the operation is abandoned with [`BmsError::BusTimeout`].

use crate::config::BusConfig;
use crate::error::{BmsError, Result};
use crate::hardware::Hardware;
use crate::logging::{StructuredLogger, get_logger};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::timeout;

/// Sole owner of the hardware bus
pub struct BusArbiter {
    hw: Mutex<Hardware>,
    lock_timeout: Duration,
    mux_addr: u16,
    relay_addr: u16,
    relay_register: u8,
    relay_mux_channel: u8,
    logger: StructuredLogger,
}

impl BusArbiter {
    pub fn new(hw: Hardware, config: &BusConfig) -> Self {
        Self {
            hw: Mutex::new(hw),
            lock_timeout: Duration::from_millis(config.lock_timeout_ms),
            mux_addr: config.multiplexer_address,
            relay_addr: config.relay_address,
            relay_register: config.relay_register,
            relay_mux_channel: config.relay_mux_channel,
            logger: get_logger("bus"),
        }
    }

    pub const fn mux_address(&self) -> u16 {
        self.mux_addr
    }

    /// Acquire the bus, waiting at most the lock timeout
    pub async fn lock(&self, operation: &str) -> Result<MutexGuard<'_, Hardware>> {
        match timeout(self.lock_timeout, self.hw.lock()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                self.logger.error(&format!(
                    "Bus lock not acquired within {} ms for {}; operation skipped",
                    self.lock_timeout.as_millis(),
                    operation
                ));
                Err(BmsError::bus_timeout(operation))
            }
        }
    }

    /// Run `op` with exclusive bus access
    pub async fn with_bus<T, F>(&self, operation: &str, op: F) -> Result<T>
    where
        F: FnOnce(&mut Hardware) -> Result<T>,
    {
        let mut guard = self.lock(operation).await?;
        op(&mut *guard).inspect_err(|e| {
            self.logger
                .warn(&format!("Bus operation {} failed: {}", operation, e));
        })
    }

    /// Write a relay pattern (0 opens every relay)
    pub async fn set_relay_mask(&self, mask: u8) -> Result<()> {
        let (mux, ch, addr, reg) = (
            self.mux_addr,
            self.relay_mux_channel,
            self.relay_addr,
            self.relay_register,
        );
        self.logger.debug(&format!(
            "Relay mask {:#06b} -> {:#04x} reg {:#04x} (mux {:#04x} ch {})",
            mask, addr, reg, mux, ch
        ));
        self.with_bus("relay write", |hw| {
            hw.bus.select_channel(mux, ch)?;
            hw.bus.write_byte_data(addr, reg, mask)
        })
        .await
    }

    pub async fn set_converter_enabled(&self, enabled: bool) -> Result<()> {
        self.logger
            .debug(&format!("DC-DC converter {}", if enabled { "on" } else { "off" }));
        self.with_bus("converter output", |hw| hw.pins.set_converter(enabled))
            .await
    }

    pub async fn set_alarm_enabled(&self, enabled: bool) -> Result<()> {
        self.with_bus("alarm output", |hw| hw.pins.set_alarm(enabled))
            .await
    }

    /// Read one byte from a device behind a multiplexer channel
    pub async fn probe(&self, channel: u8, addr: u16) -> Result<u8> {
        let mux = self.mux_addr;
        self.with_bus("device probe", |hw| {
            hw.bus.select_channel(mux, channel)?;
            hw.bus.read_byte(addr)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::banks::RelayTable;
    use crate::config::Config;
    use crate::hardware::sim::SimulatedPack;

    fn arbiter() -> (BusArbiter, SimulatedPack) {
        let config = Config::default();
        let pack = SimulatedPack::new(
            &config,
            &RelayTable::three_bank_default(),
            vec![3.7, 3.7, 3.7],
        );
        let hw = Hardware::new(Box::new(pack.bus()), Box::new(pack.pins()));
        (BusArbiter::new(hw, &config.bus), pack)
    }

    #[tokio::test]
    async fn relay_and_outputs_reach_hardware() {
        let (arb, pack) = arbiter();
        arb.set_relay_mask(0b1011).await.unwrap();
        arb.set_converter_enabled(true).await.unwrap();
        arb.set_alarm_enabled(true).await.unwrap();
        assert_eq!(pack.relay_mask(), 0b1011);
        assert!(pack.converter_enabled());
        assert!(pack.alarm_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn lock_wait_is_bounded() {
        let (arb, pack) = arbiter();
        let _held = arb.lock("test holder").await.unwrap();
        let err = arb.set_relay_mask(0b0111).await.unwrap_err();
        assert!(matches!(err, BmsError::BusTimeout { .. }));
        assert_eq!(pack.relay_mask(), 0);
    }

    #[tokio::test]
    async fn probe_reports_missing_device() {
        let (arb, pack) = arbiter();
        assert!(arb.probe(0, 0x48).await.is_ok());
        pack.set_absent(0x48, true);
        let err = arb.probe(0, 0x48).await.unwrap_err();
        assert!(err.is_bus_error());
    }
}
