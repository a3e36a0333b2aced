#![no_main]
use libfuzzer_sys::fuzz_target;

use mqtt_packet::{parse, ProtocolVersion};

fuzz_target!(|data: &[u8]| {
    let _ = parse(data, ProtocolVersion::V311);
});
