//! # Keel
//!
//! The consensus core of a witnessed DAG ledger:
//! - **Main-chain selection**: every unit picks a best parent by witnessed level,
//!   level and hash; the best-parent path from the best tip is the main chain
//! - **Witnessed levels**: how deep a unit's history is confirmed by a majority
//!   of the 12-address witness committee
//! - **Stability**: the main-chain prefix that no competing branch can displace,
//!   advanced one index at a time with content-hash "balls"
//! - **Committee tracking**: governance replacements and address definition
//!   changes, resolved from stable state only
//! - **Skiplists**: exponential backward pointers for log-depth proof chains

pub mod config;
pub mod consensus;
pub mod node;
pub mod state;
pub mod storage;

/// Protocol constants
pub mod constants {
    /// Number of witnesses in a committee
    pub const COMMITTEE_SIZE: usize = 12;
    /// Distinct witnesses needed to fix a witnessed level or a stability proof
    pub const MAJORITY_OF_WITNESSES: usize = COMMITTEE_SIZE / 2 + 1;
    /// Maximum number of parent references per unit
    pub const MAX_PARENTS_PER_UNIT: usize = 16;
    /// Maximum number of authors per unit
    pub const MAX_AUTHORS_PER_UNIT: usize = 16;
    /// Maximum number of messages carried by one unit
    pub const MAX_MESSAGES_PER_UNIT: usize = 128;
    /// Maximum opaque payload size of a data message (64 KiB)
    pub const MAX_DATA_MESSAGE_SIZE: usize = 65_536;
    /// Maximum size of a stored record accepted by `deserialize` (16 MiB)
    pub const MAX_RECORD_BYTES: usize = 16 * 1024 * 1024;

    /// Capacity of the `stabilized` broadcast channel.
    pub const STABILITY_EVENT_CAPACITY: usize = 256;
    /// Maximum units parked while waiting for a missing dependency.
    pub const MAX_PENDING_UNITS: usize = 10_000;
    /// Capacity of the node's unit ingestion channel.
    pub const INGEST_CHANNEL_CAPACITY: usize = 1_024;

    /// Compute the genesis unit domain tag for a network name.
    pub fn network_tag(network: &str) -> crate::Hash {
        crate::hash_domain(b"keel.network", network.as_bytes())
    }
}

/// 32-byte hash used throughout the protocol
pub type Hash = [u8; 32];

/// Compute a domain-separated BLAKE3 hash.
///
/// The domain MUST be valid UTF-8 (all Keel domains are ASCII literals).
/// Panics if it is not; that is a programming error, not an input error.
pub fn hash_domain(domain: &[u8], data: &[u8]) -> Hash {
    let domain_str = std::str::from_utf8(domain).expect("hash_domain: domain must be valid UTF-8");
    let mut hasher = blake3::Hasher::new_derive_key(domain_str);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Compute BLAKE3 hash of length-prefixed concatenated slices.
///
/// Each part is prefixed with its length as a little-endian u64, preventing
/// ambiguous concatenation (e.g., `["AB","C"]` vs `["A","BC"]`).
pub fn hash_concat(parts: &[&[u8]]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Serialize a value using bincode with legacy (v1-compatible) encoding.
pub fn serialize<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, bincode::error::EncodeError> {
    bincode::serde::encode_to_vec(val, bincode::config::legacy())
}

/// Deserialize a value using bincode with legacy (v1-compatible) encoding.
///
/// Rejects inputs larger than `MAX_RECORD_BYTES` to prevent OOM from
/// corrupted or hostile records.
pub fn deserialize<T: serde::de::DeserializeOwned>(
    bytes: &[u8],
) -> Result<T, bincode::error::DecodeError> {
    if bytes.len() > constants::MAX_RECORD_BYTES {
        return Err(bincode::error::DecodeError::LimitExceeded);
    }
    let (val, _len) = bincode::serde::decode_from_slice(bytes, bincode::config::legacy())?;
    Ok(val)
}
