//! Raspberry Pi backend: I2C through `/dev/i2c-N`, outputs through GPIO

use super::{HardwareBus, OutputPins};
use crate::config::{BusConfig, GpioConfig};
use crate::error::Result;
use crate::logging::get_logger;
use rppal::gpio::{Gpio, OutputPin};
use rppal::i2c::I2c;

/// I2C bus with slave address caching
pub struct RpiBus {
    i2c: I2c,
    current_addr: Option<u16>,
}

impl RpiBus {
    pub fn open(config: &BusConfig) -> Result<Self> {
        let i2c = I2c::with_bus(config.i2c_bus)?;
        get_logger("hardware").info(&format!("Opened I2C bus {}", config.i2c_bus));
        Ok(Self {
            i2c,
            current_addr: None,
        })
    }

    fn address(&mut self, addr: u16) -> Result<&mut I2c> {
        if self.current_addr != Some(addr) {
            self.i2c.set_slave_address(addr)?;
            self.current_addr = Some(addr);
        }
        Ok(&mut self.i2c)
    }
}

impl HardwareBus for RpiBus {
    fn write_byte(&mut self, addr: u16, value: u8) -> Result<()> {
        self.address(addr)?.smbus_send_byte(value)?;
        Ok(())
    }

    fn read_byte(&mut self, addr: u16) -> Result<u8> {
        Ok(self.address(addr)?.smbus_receive_byte()?)
    }

    fn read_word(&mut self, addr: u16, reg: u8) -> Result<u16> {
        Ok(self.address(addr)?.smbus_read_word(reg)?)
    }

    fn write_byte_data(&mut self, addr: u16, reg: u8, value: u8) -> Result<()> {
        self.address(addr)?.smbus_write_byte(reg, value)?;
        Ok(())
    }

    fn write_word(&mut self, addr: u16, reg: u8, value: u16) -> Result<()> {
        self.address(addr)?.smbus_write_word(reg, value)?;
        Ok(())
    }
}

/// Converter and alarm outputs, both driven low at startup
pub struct RpiPins {
    converter: OutputPin,
    alarm: OutputPin,
}

impl RpiPins {
    pub fn open(config: &GpioConfig) -> Result<Self> {
        let gpio = Gpio::new()?;
        let converter = gpio.get(config.dc_dc_pin)?.into_output_low();
        let alarm = gpio.get(config.alarm_pin)?.into_output_low();
        Ok(Self { converter, alarm })
    }
}

fn drive(pin: &mut OutputPin, high: bool) {
    if high {
        pin.set_high();
    } else {
        pin.set_low();
    }
}

impl OutputPins for RpiPins {
    fn set_converter(&mut self, enabled: bool) -> Result<()> {
        drive(&mut self.converter, enabled);
        Ok(())
    }

    fn set_alarm(&mut self, enabled: bool) -> Result<()> {
        drive(&mut self.alarm, enabled);
        Ok(())
    }
}
