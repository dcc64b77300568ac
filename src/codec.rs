/// Caller-supplied capabilities the content table needs but doesn't own:
/// a codec for values that aren't already raw byte strings, and a hash
/// function over the key domain.
///
/// Generic rather than stringly-typed so a caller's typed read/write
/// schema layer plugs in here instead of reinventing serialization.
pub trait ValueCodec<T> {
    fn encode(&self, value: &T) -> Vec<u8>;
    fn decode(&self, bytes: &[u8]) -> T;
}

/// Produces the 128-bit key used to address an entry in the content table.
/// Only the first 8 bytes are significant to the table itself; the caller
/// is responsible for collision resistance over the full hash domain.
pub trait KeyHash128 {
    fn hash128(bytes: &[u8]) -> [u8; 16];
}

/// Default, non-cryptographic implementation for callers who don't need a
/// hash stable across crate versions.
pub struct Xxh3KeyHash;

impl KeyHash128 for Xxh3KeyHash {
    fn hash128(bytes: &[u8]) -> [u8; 16] {
        xxhash_rust::xxh3::xxh3_128(bytes).to_le_bytes()
    }
}

/// Extract the in-memory hashtbl key (first 8 bytes, little-endian) from a
/// 128-bit hash as produced by a [`KeyHash128`] implementation.
pub fn hashtbl_key(hash128: &[u8; 16]) -> u64 {
    u64::from_le_bytes(hash128[..8].try_into().unwrap())
}
