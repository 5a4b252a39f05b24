#![no_main]

use libfuzzer_sys::fuzz_target;
use keel::consensus::dag::Unit;

fuzz_target!(|data: &[u8]| {
    // A unit arrives from the network as untrusted bytes. Decoding and the
    // structural checks must reject garbage without panicking.
    if let Ok(unit) = keel::deserialize::<Unit>(data) {
        let _ = unit.validate_structure();
    }
});
