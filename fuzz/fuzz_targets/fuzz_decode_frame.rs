#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // First byte picks the expected register count, the rest is the frame
    let Some((&count, frame)) = data.split_first() else {
        return;
    };
    let count = u16::from(count % 64);

    if let Ok(values) = bankwarden::modbus::decode_response(frame, count, 100.0) {
        assert_eq!(values.len(), usize::from(count));
    }
});
