#![no_main]

use libfuzzer_sys::fuzz_target;
use keel::consensus::dag::Ball;
use keel::consensus::skiplist::{verify_proof_chain, ProofChain};

fuzz_target!(|data: &[u8]| {
    // Proof chains come from untrusted peers. Any decodable chain must be
    // accepted or rejected with a typed error.
    if let Ok(chain) = keel::deserialize::<ProofChain>(data) {
        let _ = verify_proof_chain(&chain, &Ball([0u8; 32]));
    }
});
