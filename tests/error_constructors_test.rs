use bankwarden::error::BmsError;

#[test]
fn error_constructors() {
    assert!(matches!(BmsError::config("x"), BmsError::Config { .. }));
    assert!(matches!(BmsError::io("x"), BmsError::Io { .. }));
    assert!(matches!(BmsError::network("x"), BmsError::Network { .. }));
    assert!(matches!(BmsError::timeout("x"), BmsError::Timeout { .. }));
    assert!(matches!(BmsError::protocol("x"), BmsError::Protocol { .. }));
    assert!(matches!(
        BmsError::bus_timeout("relay write"),
        BmsError::BusTimeout { .. }
    ));
    assert!(matches!(BmsError::bus_io("x"), BmsError::BusIo { .. }));
    assert!(matches!(
        BmsError::interlock("x"),
        BmsError::SafetyInterlock { .. }
    ));
    assert!(matches!(BmsError::web("x"), BmsError::Web { .. }));
    assert!(matches!(BmsError::generic("x"), BmsError::Generic { .. }));
    assert!(matches!(
        BmsError::validation("f", "m"),
        BmsError::Validation { .. }
    ));
}

#[test]
fn classification() {
    assert!(BmsError::ShortFrame { len: 2 }.is_frame_error());
    assert!(BmsError::ModbusException { code: 2 }.is_frame_error());
    assert!(
        BmsError::CrcMismatch {
            expected: 1,
            actual: 2
        }
        .is_frame_error()
    );
    assert!(!BmsError::network("down").is_frame_error());

    assert!(BmsError::bus_timeout("probe").is_bus_error());
    assert!(!BmsError::timeout("connect").is_bus_error());
}

#[test]
fn acquisition_error_keeps_context() {
    let e = BmsError::acquisition(
        "192.168.15.240:10001",
        3,
        BmsError::network("connection refused"),
    );
    let s = format!("{}", e);
    assert!(s.contains("192.168.15.240:10001"));
    assert!(s.contains("3 attempts"));
    assert!(s.contains("connection refused"));
    assert!(std::error::Error::source(&e).is_some());
}

#[test]
fn io_errors_convert() {
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
    let e: BmsError = io.into();
    assert!(format!("{}", e).contains("I/O error"));
}
