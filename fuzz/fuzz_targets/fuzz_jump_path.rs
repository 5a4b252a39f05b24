#![no_main]

use libfuzzer_sys::fuzz_target;
use keel::consensus::skiplist::{jump_path, skiplist_targets};

fuzz_target!(|data: [u64; 2]| {
    let (low, high) = (data[0].min(data[1]), data[0].max(data[1]));
    let path = jump_path(low, high);
    assert_eq!(path.first(), Some(&high));
    assert_eq!(path.last(), Some(&low));
    assert!(path.len() <= 2 * 64 + 2);
    for pair in path.windows(2) {
        assert!(pair[0] - pair[1] == 1 || skiplist_targets(pair[0]).contains(&pair[1]));
    }
});
