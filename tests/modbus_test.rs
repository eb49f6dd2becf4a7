use bankwarden::error::BmsError;
use bankwarden::modbus::{
    build_exception_response, build_read_query, build_read_response, crc16_modbus,
    decode_response,
};

#[test]
fn query_for_full_probe_set() {
    let q = build_read_query(24);
    assert_eq!(&q[..6], &[0x01, 0x03, 0x00, 0x00, 0x00, 0x18]);
    let crc = crc16_modbus(&q[..6]);
    assert_eq!(&q[6..], &crc.to_le_bytes());
}

#[test]
fn negative_registers_decode_signed() {
    let frame = build_read_response(&[2550, -125, 0]);
    let values = decode_response(&frame, 3, 100.0).unwrap();
    assert_eq!(values, vec![25.5, -1.25, 0.0]);
}

#[test]
fn exception_frame_surfaces_code() {
    let frame = build_exception_response(0x02);
    assert!(matches!(
        decode_response(&frame, 24, 100.0),
        Err(BmsError::ModbusException { code: 0x02 })
    ));

    // A corrupted exception frame is a CRC failure, not an exception
    let mut bad = frame.clone();
    bad[3] ^= 0xFF;
    assert!(matches!(
        decode_response(&bad, 24, 100.0),
        Err(BmsError::CrcMismatch { .. })
    ));
}

#[test]
fn truncated_and_wrong_count_frames_rejected() {
    let frame = build_read_response(&[100; 24]);
    let err = decode_response(&frame[..frame.len() - 1], 24, 100.0).unwrap_err();
    assert!(err.is_frame_error());

    let err = decode_response(&frame, 23, 100.0).unwrap_err();
    assert!(matches!(err, BmsError::Protocol { .. }));

    assert!(matches!(
        decode_response(&[0x01, 0x03], 24, 100.0),
        Err(BmsError::ShortFrame { len: 2 })
    ));
}
