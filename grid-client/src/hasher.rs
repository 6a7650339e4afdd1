//! Pluggable hash functions used for affinity routing.

use std::hash::Hasher as _;

use siphasher::sip::SipHasher24;

/// Produces a hash code for binary data.
///
/// Implementations must be deterministic: identical input yields identical
/// output for the lifetime of the process and across client instances.
pub trait Hasher: Send + Sync {
    fn hash(&self, data: &[u8]) -> i32;
}

impl<F> Hasher for F
where
    F: Fn(&[u8]) -> i32 + Send + Sync,
{
    fn hash(&self, data: &[u8]) -> i32 {
        self(data)
    }
}

/// SipHash-2-4 with fixed zero keys, truncated to 32 bits.
#[derive(Debug, Clone, Copy, Default)]
pub struct SipHash;

impl Hasher for SipHash {
    fn hash(&self, data: &[u8]) -> i32 {
        let mut hasher = SipHasher24::new();
        hasher.write(data);
        let full = hasher.finish();
        (full ^ (full >> 32)) as u32 as i32
    }
}
