//! Modbus RTU-over-TCP frame codec for the temperature gateway
//!
//! Only the read-holding-registers query is supported: slave 1, function 3,
//! start register 0, with a CRC-16/MODBUS trailer in little-endian order.

use crate::error::{BmsError, Result};

/// Slave id of the temperature gateway
pub const SLAVE_ID: u8 = 1;

/// Read holding registers
pub const FUNCTION_READ_HOLDING: u8 = 3;

/// Bit set in the function code of an exception response
const EXCEPTION_FLAG: u8 = 0x80;

/// Smallest well-formed response: slave, function, byte count/code, CRC
pub const MIN_FRAME_LEN: usize = 5;

/// Bit-serial CRC-16/MODBUS (init 0xFFFF, reflected polynomial 0xA001)
pub fn crc16_modbus(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16_modbus(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

fn trailing_crc(frame: &[u8]) -> u16 {
    let n = frame.len();
    u16::from_le_bytes([frame[n - 2], frame[n - 1]])
}

/// Build the read-holding-registers query for `count` registers
pub fn build_read_query(count: u16) -> Vec<u8> {
    let [hi, lo] = count.to_be_bytes();
    let mut frame = vec![SLAVE_ID, FUNCTION_READ_HOLDING, 0x00, 0x00, hi, lo];
    append_crc(&mut frame);
    frame
}

/// Build a well-formed response carrying the given raw register values
pub fn build_read_response(values: &[i16]) -> Vec<u8> {
    let byte_count = u8::try_from(values.len() * 2).unwrap_or(u8::MAX);
    let mut frame = Vec::with_capacity(values.len() * 2 + MIN_FRAME_LEN);
    frame.extend_from_slice(&[SLAVE_ID, FUNCTION_READ_HOLDING, byte_count]);
    for v in values {
        frame.extend_from_slice(&v.to_be_bytes());
    }
    append_crc(&mut frame);
    frame
}

/// Build an exception response with the given exception code
pub fn build_exception_response(code: u8) -> Vec<u8> {
    let mut frame = vec![SLAVE_ID, FUNCTION_READ_HOLDING | EXCEPTION_FLAG, code];
    append_crc(&mut frame);
    frame
}

/// Validate a response frame and decode its registers, divided by `scaling`
pub fn decode_response(frame: &[u8], expected_count: u16, scaling: f64) -> Result<Vec<f64>> {
    if frame.len() < MIN_FRAME_LEN {
        return Err(BmsError::ShortFrame { len: frame.len() });
    }

    // Exception frames carry a code instead of a byte count
    if frame[1] & EXCEPTION_FLAG != 0 && frame.len() == MIN_FRAME_LEN {
        check_crc(frame)?;
        if frame[0] != SLAVE_ID || frame[1] & !EXCEPTION_FLAG != FUNCTION_READ_HOLDING {
            return Err(BmsError::protocol(format!(
                "Unexpected exception header: slave {}, function {:#04x}",
                frame[0], frame[1]
            )));
        }
        return Err(BmsError::ModbusException { code: frame[2] });
    }

    let expected_len = 3 + usize::from(frame[2]) + 2;
    if frame.len() != expected_len {
        return Err(BmsError::LengthMismatch {
            expected: expected_len,
            actual: frame.len(),
        });
    }

    check_crc(frame)?;

    let expected_bytes = usize::from(expected_count) * 2;
    if frame[0] != SLAVE_ID
        || frame[1] != FUNCTION_READ_HOLDING
        || usize::from(frame[2]) != expected_bytes
    {
        if frame[1] & EXCEPTION_FLAG != 0 {
            return Err(BmsError::ModbusException { code: frame[2] });
        }
        return Err(BmsError::protocol(format!(
            "Invalid header: slave {}, function {}, byte count {} (expected {})",
            frame[0], frame[1], frame[2], expected_bytes
        )));
    }

    let values = frame[3..3 + expected_bytes]
        .chunks_exact(2)
        .map(|pair| f64::from(i16::from_be_bytes([pair[0], pair[1]])) / scaling)
        .collect();
    Ok(values)
}

fn check_crc(frame: &[u8]) -> Result<()> {
    let expected = crc16_modbus(&frame[..frame.len() - 2]);
    let actual = trailing_crc(frame);
    if expected != actual {
        return Err(BmsError::CrcMismatch { expected, actual });
    }
    Ok(())
}
