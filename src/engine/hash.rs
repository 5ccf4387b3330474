//! Fast hash aliases and the path-checksum helpers.
//!
//! Interior maps on the hot path (context value map, per-path value
//! collection) use FxHash instead of SipHash: keys are small integers or
//! short interned strings, DOS resistance buys nothing inside the engine.
//!
//! Path checksums are sequential FxHash folds over (key id, value hash)
//! pairs. Two contexts that assign the same keys to the same values in the
//! same order produce the same checksum, which is what lets independently
//! built match paths share one property-map cache entry.

use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;

pub use rustc_hash::{FxHashMap, FxHashSet};

/// Fold one (key, value-hash) assignment into a running path checksum.
#[inline]
pub fn chain_checksum(prior: u64, key_id: u32, value_hash: u64) -> u64 {
    let mut hasher = FxHasher::default();
    prior.hash(&mut hasher);
    key_id.hash(&mut hasher);
    value_hash.hash(&mut hasher);
    hasher.finish()
}

/// Hash a sorted rule-id slice together with the generation it was computed
/// against. Used as the third component of property-cache keys.
#[inline]
pub fn ids_hash(ids: &[u32], generation: u64) -> u64 {
    let mut hasher = FxHasher::default();
    generation.hash(&mut hasher);
    ids.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_checksum_order_sensitive() {
        let a = chain_checksum(chain_checksum(0, 1, 10), 2, 20);
        let b = chain_checksum(chain_checksum(0, 2, 20), 1, 10);
        assert_ne!(a, b);
    }

    #[test]
    fn test_ids_hash_generation_sensitive() {
        assert_ne!(ids_hash(&[1, 2, 3], 0), ids_hash(&[1, 2, 3], 1));
    }
}
