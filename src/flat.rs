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

//! The single-threaded sibling of [`crate::table::Table`]: the identical
//! bucket-group/overflow-chain layout (`crate::shard::ShardData`, the same
//! type a `Table` shard wraps in a `RwLock`) with no lock and no sharding
//! at all. For a caller that already has exclusive access — a worker
//! thread's private scratch table, an embedded lookup table built once and
//! never touched concurrently — paying for a `RwLock` acquisition on every
//! lookup buys nothing.

use core::borrow::Borrow;

use crate::alloc::{Allocator, Global};
use crate::equal::{EqualTo, KeyEqual};
use crate::error::AllocError;
use crate::group::{groups_needed_for_load, load_factor, tag_of, DEFAULT_MAX_LOAD_FACTOR};
use crate::hash::{mixed_hash, AHashBuilder, HashOne};
use crate::policy::{Assign, Ignore, OnExisting};
use crate::shard::ShardData;

/// A single-threaded, non-concurrent associative container built on the
/// same fixed-capacity bucket-group/overflow-chain layout as [`Table`]'s
/// shards, but with exactly one implicit "shard" and no lock around it.
///
/// [`Table`]: crate::table::Table
pub struct FlatHashTable<K, V, H = AHashBuilder, Equal = EqualTo, A = Global> {
    data: ShardData<K, V>,
    len: usize,
    max_load_factor: f64,
    hasher: H,
    eq: Equal,
    allocator: A,
}

impl<K, V> FlatHashTable<K, V, AHashBuilder, EqualTo, Global> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::build(capacity, AHashBuilder::default(), EqualTo, Global)
    }
}

impl<K, V> Default for FlatHashTable<K, V, AHashBuilder, EqualTo, Global> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, H, Equal, A> FlatHashTable<K, V, H, Equal, A>
where
    H: HashOne<K>,
    Equal: KeyEqual<K>,
    A: Allocator,
{
    pub fn build(capacity: usize, hasher: H, eq: Equal, allocator: A) -> Self {
        // As with `Table::build`: an absurd `capacity` only degrades the
        // starting guess here, it does not change correctness, since every
        // later insert still goes through `maybe_grow`'s fallible growth
        // path. `FlatHashTable::new`/`with_capacity`/`build` stay
        // infallible rather than threading a `Result` through them.
        let initial_groups = groups_needed_for_load(capacity, 1.0).unwrap_or(1);
        Self {
            data: ShardData::new(initial_groups),
            len: 0,
            max_load_factor: DEFAULT_MAX_LOAD_FACTOR,
            hasher,
            eq,
            allocator,
        }
    }

    fn hash_of<Q>(&self, key: &Q) -> u64
    where
        K: Borrow<Q>,
        Q: ?Sized,
        H: HashOne<Q>,
    {
        mixed_hash(&self.hasher, key)
    }

    /// Mirrors `Table::group_index` with zero shard bits: the top 7 bits
    /// are reserved for the tag fingerprint ([`tag_of`]), so group
    /// selection draws from the bits immediately below those rather than
    /// overlapping them (which would correlate a slot's tag with which
    /// group it lands in).
    fn group_index(&self, hash: u64, group_bits: u32) -> usize {
        if group_bits == 0 {
            return 0;
        }
        ((hash << 7) >> (64 - group_bits)) as usize
    }

    fn locate<Q>(&self, key: &Q) -> (u64, usize, u8)
    where
        K: Borrow<Q>,
        Q: ?Sized,
        H: HashOne<Q>,
    {
        let hash = self.hash_of(key);
        let group_idx = self.group_index(hash, self.data.group_bits());
        (hash, group_idx, tag_of(hash))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn max_load_factor(&self) -> f64 {
        self.max_load_factor
    }

    pub fn set_max_load_factor(&mut self, factor: f64) {
        self.max_load_factor = factor;
    }

    pub fn load_factor(&self) -> f64 {
        load_factor(self.len, self.data.group_count())
    }

    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: ?Sized,
        H: HashOne<Q>,
        Equal: KeyEqual<K, Q>,
    {
        let (_, group_idx, tag) = self.locate(key);
        let mut out = None;
        self.data.cvisit_at(group_idx, tag, key, &self.eq, |_, v| out = Some(v));
        out
    }

    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: ?Sized,
        H: HashOne<Q>,
        Equal: KeyEqual<K, Q>,
    {
        let (_, group_idx, tag) = self.locate(key);
        // re-borrow through a raw pointer: the closure form used by `visit`
        // elsewhere in this crate can't hand back a reference that
        // outlives it, but a single-threaded table with `&mut self` has no
        // lock to release, so there is no reason to force every caller
        // through a closure here too.
        let data = &mut self.data;
        let mut out: Option<*mut V> = None;
        data.visit_at(group_idx, tag, key, &self.eq, |_, v| out = Some(v as *mut V));
        out.map(|p| unsafe { &mut *p })
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized,
        H: HashOne<Q>,
        Equal: KeyEqual<K, Q>,
    {
        self.get(key).is_some()
    }

    /// Inserts `(key, value)` if `key` is absent; otherwise applies
    /// `on_existing` to the stored entry. Returns whether a new entry was
    /// created.
    pub fn insert_with<P>(&mut self, key: K, value: V, on_existing: P) -> Result<bool, AllocError>
    where
        H: HashOne<K>,
        P: OnExisting<K, V>,
    {
        let hash = mixed_hash(&self.hasher, &key);
        let tag = tag_of(hash);
        let group_idx = self.group_index(hash, self.data.group_bits());
        let inserted = self
            .data
            .emplace_at(group_idx, tag, key, value, &self.eq, on_existing, &self.allocator)?;
        if inserted {
            self.len += 1;
            // As with `Table::emplace_with`: the entry is already inserted
            // and counted, so a failing opportunistic grow is surfaced as
            // `Err` without undoing the insert. Both types resolve this
            // the same way (see DESIGN.md's autogrow-failure note).
            self.maybe_grow()?;
        }
        Ok(inserted)
    }

    /// Inserts `(key, value)` if `key` is absent; leaves any existing
    /// entry untouched. Returns whether a new entry was created.
    pub fn insert(&mut self, key: K, value: V) -> Result<bool, AllocError>
    where
        H: HashOne<K>,
    {
        self.insert_with(key, value, Ignore)
    }

    /// Inserts `(key, value)`, overwriting any existing value for `key`.
    pub fn insert_or_assign(&mut self, key: K, value: V) -> Result<bool, AllocError>
    where
        H: HashOne<K>,
        V: Clone,
    {
        let insert_value = value.clone();
        self.insert_with(key, insert_value, Assign(value))
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized,
        H: HashOne<Q>,
        Equal: KeyEqual<K, Q>,
    {
        let (_, group_idx, tag) = self.locate(key);
        let removed = self.data.erase_at(group_idx, tag, key, &self.eq);
        if removed.is_some() {
            self.len -= 1;
        }
        removed.map(|(_, v)| v)
    }

    pub fn erase_if(&mut self, mut pred: impl FnMut(&K, &V) -> bool) -> usize {
        let mut total = 0;
        for group_idx in 0..self.data.group_count() {
            total += self.data.retain_chain(group_idx, &mut pred);
        }
        self.len -= total;
        total
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.len = 0;
    }

    pub fn for_each(&self, mut f: impl FnMut(&K, &V) -> bool) {
        for group_idx in 0..self.data.group_count() {
            if !self.data.walk_chain(group_idx, &mut f) {
                return;
            }
        }
    }

    pub fn for_each_mut(&mut self, mut f: impl FnMut(&K, &mut V) -> bool) {
        for group_idx in 0..self.data.group_count() {
            if !self.data.walk_chain_mut(group_idx, &mut f) {
                return;
            }
        }
    }

    pub fn reserve(&mut self, additional: usize) -> Result<(), AllocError>
    where
        H: HashOne<K>,
    {
        let needed = groups_needed_for_load(self.len + additional, 1.0)?;
        if needed > self.data.group_count() {
            self.rehash_to(needed)?;
        }
        Ok(())
    }

    pub fn rehash(&mut self, capacity: usize) -> Result<(), AllocError>
    where
        H: HashOne<K>,
    {
        let needed = groups_needed_for_load(capacity, 1.0)?;
        if needed > self.data.group_count() {
            self.rehash_to(needed)?;
        }
        Ok(())
    }

    fn maybe_grow(&mut self) -> Result<(), AllocError>
    where
        H: HashOne<K>,
    {
        if load_factor(self.len, self.data.group_count()) < self.max_load_factor {
            return Ok(());
        }
        let mut new_group_count = self.data.group_count().checked_mul(2).ok_or(AllocError::CapacityOverflow)?;
        while load_factor(self.len, new_group_count) >= self.max_load_factor * 0.5 {
            new_group_count = new_group_count.checked_mul(2).ok_or(AllocError::CapacityOverflow)?;
        }
        self.rehash_to(new_group_count)
    }

    fn rehash_to(&mut self, new_group_count: usize) -> Result<(), AllocError>
    where
        H: HashOne<K>,
    {
        self.allocator.check_grow(new_group_count)?;
        log::trace!(
            target: "ccore_map",
            "flat table rehash: {} -> {} groups",
            self.data.group_count(),
            new_group_count,
        );
        let entries = self.data.take_all_and_resize(new_group_count);
        let group_bits = self.data.group_bits();
        for (k, v) in entries {
            let hash = mixed_hash(&self.hasher, &k);
            let tag = tag_of(hash);
            let group_idx = self.group_index(hash, group_bits);
            self.data.insert_unique(group_idx, tag, k, v, &self.allocator)?;
        }
        Ok(())
    }
}
