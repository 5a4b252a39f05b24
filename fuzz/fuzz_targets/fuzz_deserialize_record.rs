#![no_main]

use libfuzzer_sys::fuzz_target;
use keel::consensus::dag::UnitRecord;
use keel::storage::StabilityBatch;

fuzz_target!(|data: &[u8]| {
    // Stored records are decoded on restart; a corrupted database must
    // surface as an error, never a panic.
    let _ = keel::deserialize::<UnitRecord>(data);
    let _ = keel::deserialize::<StabilityBatch>(data);
});
