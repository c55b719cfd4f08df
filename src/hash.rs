/*
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! The hash functor. Mirrors the `Hash` template parameter of the source
//! library: a type producing a 64-bit hash, shared immutably across every
//! shard and safe to call concurrently from any thread.

use core::hash::{BuildHasher, Hash};

/// Produces a 64-bit hash of a key. Implementations declare whether their
/// output already avalanches (spreads single-bit input changes across the
/// whole 64-bit output); if not, the table post-mixes before using the
/// value for shard/group selection and tag derivation.
pub trait HashOne<K: ?Sized>: Send + Sync {
    fn hash_one(&self, key: &K) -> u64;

    /// Whether `hash_one`'s output already avalanches. `ahash` (the
    /// default) does; a naive `key as u64` identity hash does not.
    fn is_avalanching(&self) -> bool {
        false
    }
}

/// The default hasher: `ahash`, matching
/// `server/src/corestore/htable.rs`'s choice of `ahash::RandomState` for
/// its own sharded map.
#[derive(Clone, Default)]
pub struct AHashBuilder(ahash::RandomState);

impl<K: Hash + ?Sized> HashOne<K> for AHashBuilder {
    fn hash_one(&self, key: &K) -> u64 {
        self.0.hash_one(key)
    }

    fn is_avalanching(&self) -> bool {
        true
    }
}

/// MurmurHash3's 64-bit finalizer. Used to post-mix a non-avalanching
/// hasher's output before it drives shard/group selection, so a weak
/// `Hash` implementation does not turn into a table-wide pathology.
#[inline]
pub(crate) const fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51afd7ed558ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ceb9fe1a85ec53);
    k ^= k >> 33;
    k
}

/// Hashes `key` with `hasher`, post-mixing if `hasher` does not already
/// avalanche.
#[inline]
pub(crate) fn mixed_hash<K, H>(hasher: &H, key: &K) -> u64
where
    K: ?Sized,
    H: HashOne<K>,
{
    let raw = hasher.hash_one(key);
    if hasher.is_avalanching() {
        raw
    } else {
        fmix64(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fmix64_is_a_bijection_on_zero() {
        // sanity: the finalizer must not collapse distinct inputs that differ
        // only in their low bits
        assert_ne!(fmix64(0), fmix64(1));
    }

    #[test]
    fn ahash_builder_is_avalanching_and_deterministic_within_instance() {
        let h = AHashBuilder::default();
        assert!(HashOne::<str>::is_avalanching(&h));
        assert_eq!(h.hash_one("same"), h.hash_one("same"));
    }
}
