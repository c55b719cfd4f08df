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

//! The key-only sibling of [`crate::table::Table`]. Stores `Table<K, (), ...>`
//! under the hood rather than reimplementing the bucket-group/shard/rehash
//! machinery: a set is a map whose value carries no information, which is
//! exactly how the source library's `concurrent_set` is described relative
//! to `concurrent_map` in `original_source/seq/concurrent_map.hpp`.

use core::borrow::Borrow;

use crate::alloc::{Allocator, Global};
use crate::equal::{EqualTo, KeyEqual};
use crate::error::AllocError;
use crate::hash::{AHashBuilder, HashOne};
use crate::table::{ShardPolicy, Table};

/// A sharded, lock-striped concurrent set, built on the identical
/// bucket-group/overflow-chain/shard layout as [`Table`] with `V = ()`.
pub struct ConcurrentSet<K, H = AHashBuilder, Equal = EqualTo, A = Global> {
    inner: Table<K, (), H, Equal, A>,
}

impl<K> ConcurrentSet<K> {
    pub fn new(policy: ShardPolicy) -> Self {
        Self {
            inner: Table::new(policy),
        }
    }

    pub fn with_capacity(policy: ShardPolicy, capacity: usize) -> Self {
        Self {
            inner: Table::with_capacity(policy, capacity),
        }
    }
}

impl<K, H, Equal, A> ConcurrentSet<K, H, Equal, A>
where
    H: HashOne<K>,
    Equal: KeyEqual<K>,
    A: Allocator,
{
    pub fn build(policy: ShardPolicy, capacity: usize, hasher: H, eq: Equal, allocator: A) -> Self {
        Self {
            inner: Table::build(policy, capacity, hasher, eq, allocator),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.size()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn shard_count(&self) -> usize {
        self.inner.shard_count()
    }

    pub fn max_load_factor(&self) -> f64 {
        self.inner.max_load_factor()
    }

    pub fn set_max_load_factor(&self, factor: f64) {
        self.inner.set_max_load_factor(factor)
    }

    pub fn load_factor(&self) -> f64 {
        self.inner.load_factor()
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized,
        H: HashOne<Q>,
        Equal: KeyEqual<K, Q>,
    {
        self.inner.contains(key)
    }

    pub fn count<Q>(&self, key: &Q) -> usize
    where
        K: Borrow<Q>,
        Q: ?Sized,
        H: HashOne<Q>,
        Equal: KeyEqual<K, Q>,
    {
        self.inner.count(key)
    }

    /// Inserts `key` if absent. Returns whether a new entry was created.
    pub fn insert(&self, key: K) -> Result<bool, AllocError>
    where
        H: HashOne<K>,
    {
        self.inner.emplace(key, ())
    }

    pub fn erase<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized,
        H: HashOne<Q>,
        Equal: KeyEqual<K, Q>,
    {
        self.inner.erase(key).is_some()
    }

    pub fn erase_if(&self, mut pred: impl FnMut(&K) -> bool) -> usize {
        self.inner.erase_if(|k, _: &()| pred(k))
    }

    pub fn clear(&self) {
        self.inner.clear()
    }

    /// Visits every key, read-only, across every shard. `f` returning
    /// `false` stops the walk early.
    pub fn visit_all(&self, mut f: impl FnMut(&K) -> bool) {
        self.inner.cvisit_all(|k, _: &()| f(k))
    }

    pub fn reserve(&self, additional: usize) -> Result<(), AllocError>
    where
        H: HashOne<K>,
    {
        self.inner.reserve(additional)
    }

    pub fn rehash(&self, capacity: usize) -> Result<(), AllocError>
    where
        H: HashOne<K>,
    {
        self.inner.rehash(capacity)
    }

    /// As [`Table::merge`]: a key present in both sets is left behind in
    /// `other` rather than being dropped.
    pub fn merge(&self, other: &Self) -> Result<(), AllocError>
    where
        H: HashOne<K>,
        K: Clone,
    {
        self.inner.merge(&other.inner)
    }
}

impl<K, H, Equal, A> ConcurrentSet<K, H, Equal, A> {
    pub fn swap(&mut self, other: &mut Self) {
        self.inner.swap(&mut other.inner)
    }
}
