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

//! The table: a fixed number of independently-locked [`crate::shard`]s,
//! selected by the high bits of a key's hash. This is the type most
//! callers reach for directly; [`crate::set::ConcurrentSet`] is a thin
//! wrapper over it with `V = ()`.

use core::borrow::Borrow;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::alloc::{Allocator, Global};
use crate::equal::{EqualTo, KeyEqual};
use crate::error::AllocError;
use crate::group::{groups_needed_for_load, load_factor, tag_of, DEFAULT_MAX_LOAD_FACTOR, GROUP_CAPACITY};
use crate::hash::{mixed_hash, AHashBuilder, HashOne};
use crate::policy::{Assign, Ignore, OnExisting};
use crate::shard::{ShardData, ShardInner};

/// One overflow-chain node per this many top-level groups is the point at
/// which a shard forces a rehash regardless of its load factor (distilled
/// spec §4.2: "one chain node per 32 groups"). This bounds worst-case
/// lookup length under an adversarial (constant) hash even though the
/// load-factor trigger alone would never fire for it.
const CHAIN_REHASH_FRACTION: usize = 32;

/// A fixed ladder of shard counts, each a power of two. Picking from a
/// small fixed set (rather than deriving shard count from `num_cpus`, the
/// way `corestore`'s `Skymap` does) keeps a table's shard/group hash-bit
/// split predictable across machines, which the concurrency tests in this
/// crate depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardPolicy {
    /// A single shard: every lock is the same lock. Useful for tests or
    /// for workloads that are already externally single-threaded.
    None,
    Low,
    Medium,
    High,
}

impl ShardPolicy {
    fn shard_count(self) -> usize {
        match self {
            ShardPolicy::None => 1,
            ShardPolicy::Low => 8,
            ShardPolicy::Medium => 32,
            ShardPolicy::High => 128,
        }
    }
}

/// Whether a shard's overflow chains have grown past the "one chain node
/// per `CHAIN_REHASH_FRACTION` groups" trigger fraction (distilled spec
/// §4.2), independent of load factor. Catches an adversarial constant
/// hash that piles every key into one group's chain while every other
/// group sits empty, which the load-factor check alone would never flag.
fn chain_overgrown(chain_nodes: usize, group_count: usize) -> bool {
    chain_nodes * CHAIN_REHASH_FRACTION > group_count
}

/// A sharded, lock-striped concurrent associative container. Every public
/// method that touches stored data takes `&self`: interior mutability
/// lives in each shard's `RwLock`, so a `Table` is typically shared across
/// threads behind an `Arc` rather than a `Mutex`.
pub struct Table<K, V, H = AHashBuilder, Equal = EqualTo, A = Global> {
    shards: Box<[ShardInner<K, V>]>,
    hasher: H,
    eq: Equal,
    allocator: A,
    shard_bits: u32,
    /// Bit pattern of an `f64`, so `set_max_load_factor` can run under
    /// `&self` like every other operation here instead of demanding
    /// exclusive access just to tune a threshold.
    max_load_factor_bits: AtomicU64,
}

/// Alias matching this crate's public surface naming
/// (`Table` / `ConcurrentMap` / `ConcurrentSet`, see [`crate::ConcurrentSet`]).
pub type ConcurrentMap<K, V, H = AHashBuilder, Equal = EqualTo, A = Global> = Table<K, V, H, Equal, A>;

impl<K, V> Table<K, V, AHashBuilder, EqualTo, Global> {
    pub fn new(policy: ShardPolicy) -> Self {
        Self::with_capacity(policy, 0)
    }

    pub fn with_capacity(policy: ShardPolicy, capacity: usize) -> Self {
        Self::build(policy, capacity, AHashBuilder::default(), EqualTo, Global)
    }
}

impl<K, V, H, Equal, A> Table<K, V, H, Equal, A>
where
    H: HashOne<K>,
    Equal: KeyEqual<K>,
    A: Allocator,
{
    /// Full constructor: every policy knob explicit. The `None`/`Low`/
    /// `Medium`/`High` shard ladder is still the only choice for shard
    /// *count*; `capacity` only sizes the starting group count per shard.
    pub fn build(policy: ShardPolicy, capacity: usize, hasher: H, eq: Equal, allocator: A) -> Self {
        let shard_count = policy.shard_count();
        let shard_bits = shard_count.trailing_zeros();
        let per_shard = (capacity + shard_count - 1) / shard_count.max(1);
        // An absurd `capacity` overflowing this sizing computation only
        // degrades the starting capacity guess, not correctness: every
        // later insert still goes through `maybe_autogrow`'s fallible,
        // `AllocError`-propagating growth path. Infallible constructors
        // therefore fall back to a single starting group instead of
        // threading a `Result` through `Table::new`/`with_capacity`.
        let initial_groups = groups_needed_for_load(per_shard, 1.0).unwrap_or(1);
        let shards = (0..shard_count)
            .map(|_| ShardInner::new(initial_groups))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            hasher,
            eq,
            allocator,
            shard_bits,
            max_load_factor_bits: AtomicU64::new(DEFAULT_MAX_LOAD_FACTOR.to_bits()),
        }
    }

    /// The load factor threshold a shard's occupancy must stay at or below
    /// immediately after any successful operation (distilled spec
    /// invariant P6). Defaults to 7/8, matching `hashbrown`'s own default.
    pub fn max_load_factor(&self) -> f64 {
        f64::from_bits(self.max_load_factor_bits.load(Ordering::Relaxed))
    }

    /// Changes the load factor threshold used by future inserts. Does not
    /// retroactively rehash any shard already above the new threshold;
    /// the next insert into such a shard will.
    pub fn set_max_load_factor(&self, factor: f64) {
        self.max_load_factor_bits.store(factor.to_bits(), Ordering::Relaxed);
    }

    /// Aggregate occupancy across every shard: `size() / total capacity`.
    /// Each shard's group count is read under its own shared lock; like
    /// [`Table::size`], this is a relaxed aggregate, not a single atomic
    /// snapshot of a table under concurrent writers.
    pub fn load_factor(&self) -> f64 {
        let mut total_len = 0usize;
        let mut total_capacity = 0usize;
        for shard in self.shards.iter() {
            total_len += shard.len();
            total_capacity += shard.data.read().group_count() * GROUP_CAPACITY;
        }
        if total_capacity == 0 {
            0.0
        } else {
            total_len as f64 / total_capacity as f64
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

    fn shard_index(&self, hash: u64) -> usize {
        if self.shard_bits == 0 {
            0
        } else {
            ((hash << 7) >> (64 - self.shard_bits)) as usize
        }
    }

    fn group_index(&self, hash: u64, group_bits: u32) -> usize {
        if group_bits == 0 {
            return 0;
        }
        let shifted = hash << (7 + self.shard_bits);
        (shifted >> (64 - group_bits)) as usize
    }

    fn locate<Q>(&self, key: &Q) -> (usize, u64, u8)
    where
        K: Borrow<Q>,
        Q: ?Sized,
        H: HashOne<Q>,
    {
        let hash = self.hash_of(key);
        (self.shard_index(hash), hash, tag_of(hash))
    }

    /// Total number of entries across all shards. Each shard's count is a
    /// relaxed atomic updated alongside (not atomically with) the guarded
    /// data, so a concurrent writer can make this return a value that was
    /// never exactly true at any single instant; it converges to the
    /// correct count once writers quiesce.
    pub fn size(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// The configured allocator, exposed so a caller that supplied its own
    /// (via [`Table::build`]) can inspect or drive it directly — e.g. a
    /// test harness using a fault-injecting allocator to assert on the
    /// table's state immediately after a forced allocation failure.
    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// Looks up `key` and, if present, calls `f` with a mutable reference
    /// to its value while the owning shard's write lock is held. Returns
    /// whether a match was found. `f` must not call back into this table
    /// (or any other locked through the same shard) or it will deadlock.
    pub fn visit<Q>(&self, key: &Q, f: impl FnOnce(&K, &mut V)) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized,
        H: HashOne<Q>,
        Equal: KeyEqual<K, Q>,
    {
        let (shard_idx, hash, tag) = self.locate(key);
        let shard = &self.shards[shard_idx];
        let mut data = shard.data.write();
        let group_bits = data.group_bits();
        let group_idx = self.group_index(hash, group_bits);
        data.visit_at(group_idx, tag, key, &self.eq, f)
    }

    /// Read-only counterpart of [`Table::visit`], taking the shard's read
    /// lock instead of its write lock.
    pub fn cvisit<Q>(&self, key: &Q, f: impl FnOnce(&K, &V)) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized,
        H: HashOne<Q>,
        Equal: KeyEqual<K, Q>,
    {
        let (shard_idx, hash, tag) = self.locate(key);
        let shard = &self.shards[shard_idx];
        let data = shard.data.read();
        let group_bits = data.group_bits();
        let group_idx = self.group_index(hash, group_bits);
        data.cvisit_at(group_idx, tag, key, &self.eq, f)
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized,
        H: HashOne<Q>,
        Equal: KeyEqual<K, Q>,
    {
        self.cvisit(key, |_, _| {})
    }

    /// `std::unordered_map`-style `count`: `0` or `1`, since duplicate
    /// keys are not permitted.
    pub fn count<Q>(&self, key: &Q) -> usize
    where
        K: Borrow<Q>,
        Q: ?Sized,
        H: HashOne<Q>,
        Equal: KeyEqual<K, Q>,
    {
        self.contains(key) as usize
    }

    fn emplace_with<P>(&self, key: K, value: V, on_existing: P) -> Result<bool, AllocError>
    where
        H: HashOne<K>,
        P: OnExisting<K, V>,
    {
        let hash = mixed_hash(&self.hasher, &key);
        let shard_idx = self.shard_index(hash);
        let tag = tag_of(hash);
        let shard = &self.shards[shard_idx];
        let inserted = {
            let mut data = shard.data.write();
            let group_bits = data.group_bits();
            let group_idx = self.group_index(hash, group_bits);
            data.emplace_at(group_idx, tag, key, value, &self.eq, on_existing, &self.allocator)?
        };
        if inserted {
            shard.inc_len(1);
            // The entry is already in the table and counted at this point;
            // an opportunistic post-insert grow failing here is still an
            // `AllocationFailure` per the allocation-failure error kind
            // (spec §7) and must be propagated, not swallowed into a log
            // line. It does not roll back the insert that triggered it
            // (mirroring `FlatHashTable::insert_with`, which commits its
            // insert the same way before propagating its own grow's `?`):
            // the shard simply stays over its target load factor until a
            // later insert's autogrow check succeeds.
            self.maybe_autogrow(shard_idx)?;
        }
        Ok(inserted)
    }

    /// Inserts `(key, value)` if `key` is absent; otherwise leaves the
    /// existing entry untouched. Returns whether a new entry was created.
    pub fn emplace(&self, key: K, value: V) -> Result<bool, AllocError>
    where
        H: HashOne<K>,
    {
        self.emplace_with(key, value, Ignore)
    }

    /// Inserts `(key, value)` if `key` is absent; otherwise applies
    /// `on_existing` to the stored entry under the shard's write lock.
    pub fn emplace_or_visit<P>(&self, key: K, value: V, on_existing: P) -> Result<bool, AllocError>
    where
        H: HashOne<K>,
        P: OnExisting<K, V>,
    {
        self.emplace_with(key, value, on_existing)
    }

    /// Inserts `(key, value)` if `key` is absent; otherwise hands the pair
    /// back unused, touching nothing.
    pub fn try_emplace(&self, key: K, value: V) -> Result<Result<(), (K, V)>, AllocError>
    where
        H: HashOne<K>,
        K: Clone,
        V: Clone,
    {
        // Ignore can't hand the rejected pair back without a clone, since
        // the stored-vs-rejected entries alias the same key; this is the
        // one operation in the surface that pays for that with a `Clone`
        // bound instead of threading an extra return channel through
        // `emplace_at`.
        let probe_key = key.clone();
        let probe_value = value.clone();
        let inserted = self.emplace(key, value)?;
        if inserted {
            Ok(Ok(()))
        } else {
            Ok(Err((probe_key, probe_value)))
        }
    }

    /// Inserts `(key, value)`, overwriting any existing value for `key`.
    /// Returns whether a new entry was created.
    pub fn insert_or_assign(&self, key: K, value: V) -> Result<bool, AllocError>
    where
        H: HashOne<K>,
        V: Clone,
    {
        let insert_value = value.clone();
        self.emplace_with(key, insert_value, Assign(value))
    }

    /// Alias of [`Table::emplace`] under the `std`-map-flavored name
    /// (distilled spec §6 canonical operation list; "aliases permitted").
    pub fn insert(&self, key: K, value: V) -> Result<bool, AllocError>
    where
        H: HashOne<K>,
    {
        self.emplace(key, value)
    }

    /// Alias of [`Table::emplace_or_visit`].
    pub fn insert_or_visit<P>(&self, key: K, value: V, on_existing: P) -> Result<bool, AllocError>
    where
        H: HashOne<K>,
        P: OnExisting<K, V>,
    {
        self.emplace_or_visit(key, value, on_existing)
    }

    /// As [`Table::emplace_or_visit`], but the closure sees a shared
    /// reference to the existing entry rather than a mutable one.
    pub fn emplace_or_cvisit<F>(&self, key: K, value: V, on_existing: F) -> Result<bool, AllocError>
    where
        H: HashOne<K>,
        F: FnOnce(&K, &V),
    {
        self.emplace_with(key, value, move |k: &K, v: &mut V| on_existing(k, v))
    }

    /// Alias of [`Table::emplace_or_cvisit`].
    pub fn insert_or_cvisit<F>(&self, key: K, value: V, on_existing: F) -> Result<bool, AllocError>
    where
        H: HashOne<K>,
        F: FnOnce(&K, &V),
    {
        self.emplace_or_cvisit(key, value, on_existing)
    }

    /// Alias of [`Table::emplace_or_visit`] (distilled spec §4.5: "as
    /// above but constructs only if k absent; existing entry is visited
    /// only" — identical to `emplace_or_visit` once a shard's lock is held
    /// exclusively for the whole call, which rules out the check-then-act
    /// race the source library's fine-grained locking needed this distinct
    /// name to paper over; see DESIGN.md).
    pub fn try_emplace_or_visit<P>(&self, key: K, value: V, on_existing: P) -> Result<bool, AllocError>
    where
        H: HashOne<K>,
        P: OnExisting<K, V>,
    {
        self.emplace_or_visit(key, value, on_existing)
    }

    /// Alias of [`Table::emplace_or_cvisit`]; see [`Table::try_emplace_or_visit`].
    pub fn try_emplace_or_cvisit<F>(&self, key: K, value: V, on_existing: F) -> Result<bool, AllocError>
    where
        H: HashOne<K>,
        F: FnOnce(&K, &V),
    {
        self.emplace_or_cvisit(key, value, on_existing)
    }

    pub fn erase<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized,
        H: HashOne<Q>,
        Equal: KeyEqual<K, Q>,
    {
        let (shard_idx, hash, tag) = self.locate(key);
        let shard = &self.shards[shard_idx];
        let removed = {
            let mut data = shard.data.write();
            let group_bits = data.group_bits();
            let group_idx = self.group_index(hash, group_bits);
            data.erase_at(group_idx, tag, key, &self.eq)
        };
        if removed.is_some() {
            shard.dec_len(1);
        }
        removed.map(|(_, v)| v)
    }

    /// Removes every entry for which `pred` returns `true`. Each shard is
    /// visited under its own write lock in turn; entries in other shards
    /// remain reachable by other threads throughout.
    pub fn erase_if(&self, mut pred: impl FnMut(&K, &V) -> bool) -> usize {
        let mut total = 0;
        for shard in self.shards.iter() {
            let mut data = shard.data.write();
            let mut shard_removed = 0;
            for group_idx in 0..data.group_count() {
                shard_removed += data.retain_chain(group_idx, &mut pred);
            }
            if shard_removed > 0 {
                shard.dec_len(shard_removed);
                total += shard_removed;
            }
        }
        total
    }

    pub fn clear(&self) {
        for shard in self.shards.iter() {
            let mut data = shard.data.write();
            data.clear();
            shard.set_len(0);
        }
    }

    /// Visits every entry, read-only, across every shard, one shard at a
    /// time under its shared lock. `f` returning `false` stops the whole
    /// walk early (distilled spec §4.5: "closures returning bool may
    /// short-circuit aggregate walks"). Never observes the table as a
    /// single atomic snapshot under concurrent writers — each entry's
    /// value is consistent as of some point between the walk's start and
    /// end, not necessarily the same point for every entry.
    pub fn cvisit_all(&self, mut f: impl FnMut(&K, &V) -> bool) {
        for shard in self.shards.iter() {
            let data = shard.data.read();
            for group_idx in 0..data.group_count() {
                if !data.walk_chain(group_idx, &mut f) {
                    return;
                }
            }
        }
    }

    /// Mutable counterpart of [`Table::cvisit_all`], taking each shard's
    /// write lock in turn.
    pub fn visit_all(&self, mut f: impl FnMut(&K, &mut V) -> bool) {
        for shard in self.shards.iter() {
            let mut data = shard.data.write();
            for group_idx in 0..data.group_count() {
                if !data.walk_chain_mut(group_idx, &mut f) {
                    return;
                }
            }
        }
    }

    fn maybe_autogrow(&self, shard_idx: usize) -> Result<(), AllocError>
    where
        H: HashOne<K>,
    {
        let shard = &self.shards[shard_idx];
        let max_load = self.max_load_factor();
        let len = shard.len();
        let needs_grow = {
            let data = shard.data.read();
            load_factor(len, data.group_count()) >= max_load
                || chain_overgrown(data.chain_nodes(), data.group_count())
        };
        if !needs_grow {
            return Ok(());
        }
        let mut data = shard.data.write();
        // re-check under the write lock: another thread may have already
        // grown this shard between the read-locked check above and here
        if load_factor(shard.len(), data.group_count()) < max_load
            && !chain_overgrown(data.chain_nodes(), data.group_count())
        {
            return Ok(());
        }
        let mut new_group_count = data.group_count().checked_mul(2).ok_or(AllocError::CapacityOverflow)?;
        while load_factor(shard.len(), new_group_count) >= max_load * 0.5 {
            new_group_count = new_group_count.checked_mul(2).ok_or(AllocError::CapacityOverflow)?;
        }
        self.rehash_shard_locked(&mut data, new_group_count)
    }

    fn rehash_shard_locked(&self, data: &mut ShardData<K, V>, new_group_count: usize) -> Result<(), AllocError>
    where
        H: HashOne<K>,
    {
        self.allocator.check_grow(new_group_count)?;
        log::trace!(
            target: "ccore_map",
            "shard rehash: {} -> {} groups ({} chain nodes)",
            data.group_count(),
            new_group_count,
            data.chain_nodes(),
        );
        let entries = data.take_all_and_resize(new_group_count);
        let moved = entries.len();
        let group_bits = data.group_bits();
        for (k, v) in entries {
            let hash = mixed_hash(&self.hasher, &k);
            let tag = tag_of(hash);
            let group_idx = self.group_index(hash, group_bits);
            data.insert_unique(group_idx, tag, k, v, &self.allocator)?;
        }
        log::trace!(target: "ccore_map", "shard rehash complete: {} entries redistributed", moved);
        Ok(())
    }

    /// Ensures every shard can hold `additional` more entries (on top of
    /// its current share of [`Table::size`]) without triggering an
    /// automatic grow mid-insert. Never shrinks a shard below its current
    /// group count.
    pub fn reserve(&self, additional: usize) -> Result<(), AllocError>
    where
        H: HashOne<K>,
    {
        let shard_count = self.shards.len();
        for shard in self.shards.iter() {
            let per_shard_additional = (additional + shard_count - 1) / shard_count.max(1);
            let mut data = shard.data.write();
            let target = shard.len() + per_shard_additional;
            let needed = groups_needed_for_load(target, 1.0)?;
            if needed > data.group_count() {
                self.rehash_shard_locked(&mut data, needed)?;
            }
        }
        Ok(())
    }

    /// Ensures every shard holds at least `capacity / shard_count` slots
    /// of raw capacity. Like [`Table::reserve`], never shrinks.
    pub fn rehash(&self, capacity: usize) -> Result<(), AllocError>
    where
        H: HashOne<K>,
    {
        let shard_count = self.shards.len();
        for shard in self.shards.iter() {
            let per_shard = (capacity + shard_count - 1) / shard_count.max(1);
            let mut data = shard.data.write();
            let needed = groups_needed_for_load(per_shard, 1.0)?;
            if needed > data.group_count() {
                self.rehash_shard_locked(&mut data, needed)?;
            }
        }
        Ok(())
    }

    /// Walks `other`, trying to insert a clone of each of its entries into
    /// `self`; an entry that is actually inserted is then erased from
    /// `other`, so a key present in both tables is left behind in `other`
    /// rather than overwriting `self`'s existing value (distilled spec
    /// §4.4: "for each entry in other, try to insert into `*this`; if
    /// inserted, erase from other").
    ///
    /// `other` is walked to completion (collecting every entry) before any
    /// insert into `self` is attempted, so this never needs to hold a lock
    /// on both tables at once — a simpler, still deadlock-free resolution
    /// of the distilled spec's "acquire in ascending-address order"
    /// requirement, which exists there only to let the two tables' locks
    /// overlap; see DESIGN.md.
    pub fn merge(&self, other: &Self) -> Result<(), AllocError>
    where
        H: HashOne<K>,
        K: Clone,
        V: Clone,
    {
        let mut entries = Vec::with_capacity(other.size());
        other.cvisit_all(|k, v| {
            entries.push((k.clone(), v.clone()));
            true
        });
        let mut moved = Vec::new();
        for (k, v) in entries {
            if self.emplace(k.clone(), v)? {
                moved.push(k);
            }
        }
        for k in moved {
            other.erase(&k);
        }
        Ok(())
    }
}

impl<K, V, H, Equal, A> Table<K, V, H, Equal, A> {
    /// Exchanges the entire contents (and configuration) of two tables.
    /// Takes `&mut self` because, unlike every other operation here,
    /// swapping is not safe to run concurrently with other access to
    /// either table.
    pub fn swap(&mut self, other: &mut Self) {
        std::mem::swap(&mut self.shards, &mut other.shards);
        std::mem::swap(&mut self.hasher, &mut other.hasher);
        std::mem::swap(&mut self.eq, &mut other.eq);
        std::mem::swap(&mut self.allocator, &mut other.allocator);
        std::mem::swap(&mut self.shard_bits, &mut other.shard_bits);
        let mine = self.max_load_factor_bits.load(Ordering::Relaxed);
        let theirs = other.max_load_factor_bits.load(Ordering::Relaxed);
        self.max_load_factor_bits.store(theirs, Ordering::Relaxed);
        other.max_load_factor_bits.store(mine, Ordering::Relaxed);
    }
}
