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

//! One stripe of the table: a write-locked array of top-level bucket
//! groups, each possibly chained to overflow groups. Everything in this
//! module assumes the caller already holds the shard's lock; a `Shard`
//! never locks anything itself, it only stores the `RwLock` wrapping it.

use core::borrow::Borrow;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::alloc::Allocator;
use crate::equal::KeyEqual;
use crate::error::AllocError;
use crate::group::BucketGroup;
use crate::policy::OnExisting;

/// The mutable payload of one shard, guarded by the surrounding
/// [`ShardInner`]'s lock.
pub(crate) struct ShardData<K, V> {
    groups: Vec<BucketGroup<K, V>>,
    free: Vec<Box<BucketGroup<K, V>>>,
    /// Live (non-recycled) overflow-chain node count, across every group's
    /// chain in this shard. Consulted by `Table::maybe_autogrow` alongside
    /// the load factor: past one chain node per 32 groups, a rehash is
    /// forced even if the load factor alone would not yet call for one
    /// (an adversarial hasher that sends every key to one group grows a
    /// single chain arbitrarily long otherwise).
    chain_nodes: usize,
}

impl<K, V> ShardData<K, V> {
    pub(crate) fn new(group_count: usize) -> Self {
        debug_assert!(group_count.is_power_of_two());
        Self {
            groups: (0..group_count).map(|_| BucketGroup::new()).collect(),
            free: Vec::new(),
            chain_nodes: 0,
        }
    }

    pub(crate) fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub(crate) fn chain_nodes(&self) -> usize {
        self.chain_nodes
    }

    /// `log2` of the current top-level group count, used to carve the
    /// group-selector bits out of a hash alongside the shard selector.
    pub(crate) fn group_bits(&self) -> u32 {
        self.groups.len().trailing_zeros()
    }

    /// Searches the chain rooted at `group_index` for `key`, calling `f`
    /// with a mutable reference to the matched value. Returns whether a
    /// match was found.
    pub(crate) fn visit_at<Q>(
        &mut self,
        group_index: usize,
        tag: u8,
        key: &Q,
        eq: &impl KeyEqual<K, Q>,
        f: impl FnOnce(&K, &mut V),
    ) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized,
    {
        let mut node = &mut self.groups[group_index];
        loop {
            if let Some(i) = node.find(tag, key, eq) {
                let (k, v) = node.slot_mut(i);
                f(k, v);
                return true;
            }
            match node.overflow.as_mut() {
                Some(next) => node = next,
                None => return false,
            }
        }
    }

    /// Read-only counterpart of [`ShardData::visit_at`].
    pub(crate) fn cvisit_at<Q>(
        &self,
        group_index: usize,
        tag: u8,
        key: &Q,
        eq: &impl KeyEqual<K, Q>,
        f: impl FnOnce(&K, &V),
    ) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized,
    {
        let mut node = &self.groups[group_index];
        loop {
            if let Some(i) = node.find(tag, key, eq) {
                let (k, v) = node.slot(i);
                f(k, v);
                return true;
            }
            match node.overflow.as_ref() {
                Some(next) => node = next,
                None => return false,
            }
        }
    }

    /// Applies `f` to every occupied entry reachable from `group_index`'s
    /// chain. Used by the table-wide `walk`/`erase_if`/`iter` operations,
    /// one chain at a time.
    pub(crate) fn walk_chain(&self, group_index: usize, f: &mut impl FnMut(&K, &V) -> bool) -> bool {
        let mut node = &self.groups[group_index];
        loop {
            if !node.walk(f) {
                return false;
            }
            match node.overflow.as_ref() {
                Some(next) => node = next,
                None => return true,
            }
        }
    }

    pub(crate) fn walk_chain_mut(&mut self, group_index: usize, f: &mut impl FnMut(&K, &mut V) -> bool) -> bool {
        let mut node = &mut self.groups[group_index];
        loop {
            if !node.walk_mut(f) {
                return false;
            }
            match node.overflow.as_mut() {
                Some(next) => node = next,
                None => return true,
            }
        }
    }

    /// Removes every entry in `group_index`'s chain for which `pred`
    /// returns `true`, splicing out and recycling any overflow group left
    /// empty by the removals. Returns the number removed.
    pub(crate) fn retain_chain(&mut self, group_index: usize, pred: &mut impl FnMut(&K, &V) -> bool) -> usize {
        let head = &mut self.groups[group_index];
        let mut removed = retain_in_group(head, pred);
        removed += retain_in_link(&mut head.overflow, pred, &mut self.free, &mut self.chain_nodes);
        removed
    }

    /// Places `entry` at the head of `group_index`'s chain, growing the
    /// chain with a (recycled or freshly allocated) overflow group if
    /// every existing group in it is full. Does not search for an
    /// existing match first; callers that need upsert semantics must do
    /// that themselves before calling this.
    fn place_in_chain(
        &mut self,
        group_index: usize,
        tag: u8,
        entry: (K, V),
        allocator: &impl Allocator,
    ) -> Result<(), AllocError> {
        let mut entry = entry;
        {
            let mut node = &mut self.groups[group_index];
            loop {
                match node.try_place(tag, entry) {
                    Ok(()) => return Ok(()),
                    Err(back) => entry = back,
                }
                match node.overflow.as_mut() {
                    Some(next) => node = next,
                    None => break,
                }
            }
        }
        allocator.check_grow(1)?;
        let recycled = self.free.pop();
        let mut fresh = recycled.unwrap_or_else(|| Box::new(BucketGroup::new()));
        fresh
            .try_place(tag, entry)
            .unwrap_or_else(|_| unreachable!("a freshly reset group always has room"));
        let mut tail = &mut self.groups[group_index];
        while tail.overflow.is_some() {
            tail = tail.overflow.as_mut().unwrap();
        }
        tail.overflow = Some(fresh);
        self.chain_nodes += 1;
        Ok(())
    }

    /// Finds `key` in `group_index`'s chain and hands it to `on_existing`,
    /// or inserts `(key, value)` fresh if absent. Returns `true` if a new
    /// entry was created. Always searches by the full key: the lookup and
    /// the to-be-inserted value are the same `key`, so there is no reason
    /// to support a borrowed-form lookup here the way `visit`/`erase` do.
    pub(crate) fn emplace_at<P>(
        &mut self,
        group_index: usize,
        tag: u8,
        key: K,
        value: V,
        eq: &impl KeyEqual<K>,
        on_existing: P,
        allocator: &impl Allocator,
    ) -> Result<bool, AllocError>
    where
        P: OnExisting<K, V>,
    {
        if self.visit_at(group_index, tag, &key, eq, |k, v| on_existing.on_existing(k, v)) {
            return Ok(false);
        }
        self.place_in_chain(group_index, tag, (key, value), allocator)?;
        Ok(true)
    }

    /// Inserts `(key, value)` without first searching for a match. Only
    /// safe when the caller already knows no equal key is present in this
    /// shard (bulk rehash).
    pub(crate) fn insert_unique(
        &mut self,
        group_index: usize,
        tag: u8,
        key: K,
        value: V,
        allocator: &impl Allocator,
    ) -> Result<(), AllocError> {
        self.place_in_chain(group_index, tag, (key, value), allocator)
    }

    /// Removes `key` from `group_index`'s chain, splicing out and
    /// recycling any overflow group left empty by the removal.
    pub(crate) fn erase_at<Q>(
        &mut self,
        group_index: usize,
        tag: u8,
        key: &Q,
        eq: &impl KeyEqual<K, Q>,
    ) -> Option<(K, V)>
    where
        K: Borrow<Q>,
        Q: ?Sized,
    {
        let head = &mut self.groups[group_index];
        if let Some(i) = head.find(tag, key, eq) {
            return Some(head.erase(i));
        }
        erase_in_link(&mut head.overflow, tag, key, eq, &mut self.free, &mut self.chain_nodes)
    }

    /// Drains every entry out of every chain, resetting the shard to
    /// `new_group_count` empty top-level groups. All previously allocated
    /// overflow groups (head and chained) are released; the shard's free
    /// list keeps whatever it already had.
    pub(crate) fn take_all_and_resize(&mut self, new_group_count: usize) -> Vec<(K, V)> {
        debug_assert!(new_group_count.is_power_of_two());
        let mut out = Vec::new();
        let mut old = std::mem::replace(&mut self.groups, Vec::new());
        for group in old.iter_mut() {
            drain_chain(group, &mut out);
        }
        old.clear();
        self.groups = (0..new_group_count).map(|_| BucketGroup::new()).collect();
        self.chain_nodes = 0;
        out
    }

    pub(crate) fn clear(&mut self) {
        for group in self.groups.iter_mut() {
            let mut out = Vec::new();
            drain_chain(group, &mut out);
        }
        self.chain_nodes = 0;
    }
}

fn drain_chain<K, V>(group: &mut BucketGroup<K, V>, out: &mut Vec<(K, V)>) {
    while group.len() > 0 {
        out.push(group.erase(0));
    }
    if let Some(mut next) = group.reset() {
        drain_chain(&mut next, out);
    }
}

/// Removes every slot in `group` for which `pred` returns `true` by
/// repeatedly swap-removing (never advancing past a just-filled hole).
fn retain_in_group<K, V>(group: &mut BucketGroup<K, V>, pred: &mut impl FnMut(&K, &V) -> bool) -> usize {
    let mut removed = 0;
    let mut i = 0;
    while i < group.len() {
        let should_erase = {
            let (k, v) = group.slot(i);
            pred(k, v)
        };
        if should_erase {
            group.erase(i);
            removed += 1;
        } else {
            i += 1;
        }
    }
    removed
}

fn retain_in_link<K, V>(
    link: &mut Option<Box<BucketGroup<K, V>>>,
    pred: &mut impl FnMut(&K, &V) -> bool,
    free: &mut Vec<Box<BucketGroup<K, V>>>,
    chain_nodes: &mut usize,
) -> usize {
    let node = match link.as_mut() {
        Some(n) => n,
        None => return 0,
    };
    let mut removed = retain_in_group(node, pred);
    if node.len() == 0 {
        let mut emptied = link.take().unwrap();
        *link = emptied.overflow.take();
        emptied.reset();
        free.push(emptied);
        *chain_nodes -= 1;
        removed += retain_in_link(link, pred, free, chain_nodes);
        return removed;
    }
    removed += retain_in_link(&mut node.overflow, pred, free, chain_nodes);
    removed
}

fn erase_in_link<K, V, Q>(
    link: &mut Option<Box<BucketGroup<K, V>>>,
    tag: u8,
    key: &Q,
    eq: &impl KeyEqual<K, Q>,
    free: &mut Vec<Box<BucketGroup<K, V>>>,
    chain_nodes: &mut usize,
) -> Option<(K, V)>
where
    K: Borrow<Q>,
    Q: ?Sized,
{
    let node = link.as_mut()?;
    if let Some(i) = node.find(tag, key, eq) {
        let removed = node.erase(i);
        if node.len() == 0 {
            let mut emptied = link.take().unwrap();
            *link = emptied.overflow.take();
            emptied.reset();
            free.push(emptied);
            *chain_nodes -= 1;
        }
        return Some(removed);
    }
    erase_in_link(&mut node.overflow, tag, key, eq, free, chain_nodes)
}

/// A shard's lock plus its relaxed, approximate entry counter. The counter
/// is aggregated across shards for `Table::size`/`Table::is_empty`; it is
/// deliberately not kept in lockstep with the guarded data (see the
/// crate's top-level docs for the consistency model this buys).
pub(crate) struct ShardInner<K, V> {
    pub(crate) data: RwLock<ShardData<K, V>>,
    pub(crate) len: AtomicUsize,
}

impl<K, V> ShardInner<K, V> {
    pub(crate) fn new(initial_group_count: usize) -> Self {
        Self {
            data: RwLock::new(ShardData::new(initial_group_count)),
            len: AtomicUsize::new(0),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_len(&self, by: usize) {
        self.len.fetch_add(by, Ordering::Relaxed);
    }

    pub(crate) fn dec_len(&self, by: usize) {
        self.len.fetch_sub(by, Ordering::Relaxed);
    }

    pub(crate) fn set_len(&self, to: usize) {
        self.len.store(to, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::Global;
    use crate::equal::EqualTo;
    use crate::policy::{Assign, Ignore};

    fn tag(h: u64) -> u8 {
        crate::group::tag_of(h)
    }

    #[test]
    fn emplace_then_visit_round_trip() {
        let mut s: ShardData<i32, i32> = ShardData::new(1);
        let inserted = s.emplace_at(0, tag(1), 1, 100, &EqualTo, Ignore, &Global).unwrap();
        assert!(inserted);
        let mut seen = 0;
        assert!(s.visit_at(0, tag(1), &1, &EqualTo, |_, v| seen = *v));
        assert_eq!(seen, 100);
    }

    #[test]
    fn emplace_on_existing_applies_policy() {
        let mut s: ShardData<i32, i32> = ShardData::new(1);
        s.emplace_at(0, tag(1), 1, 100, &EqualTo, Ignore, &Global).unwrap();
        let inserted = s.emplace_at(0, tag(1), 1, 999, &EqualTo, Assign(7), &Global).unwrap();
        assert!(!inserted);
        let mut seen = 0;
        s.cvisit_at(0, tag(1), &1, &EqualTo, |_, v| seen = *v);
        assert_eq!(seen, 7);
    }

    #[test]
    fn overflow_chain_grows_past_group_capacity() {
        let mut s: ShardData<i32, i32> = ShardData::new(1);
        for i in 0..(crate::group::GROUP_CAPACITY as i32 * 3) {
            s.emplace_at(0, tag(i as u64), i, i, &EqualTo, Ignore, &Global).unwrap();
        }
        for i in 0..(crate::group::GROUP_CAPACITY as i32 * 3) {
            let mut seen = -1;
            assert!(s.cvisit_at(0, tag(i as u64), &i, &EqualTo, |_, v| seen = *v));
            assert_eq!(seen, i);
        }
    }

    #[test]
    fn erase_reclaims_emptied_overflow_group() {
        let mut s: ShardData<i32, i32> = ShardData::new(1);
        let n = crate::group::GROUP_CAPACITY * 2;
        for i in 0..n {
            s.emplace_at(0, tag(i as u64), i as i32, i as i32, &EqualTo, Ignore, &Global)
                .unwrap();
        }
        assert!(s.free.is_empty());
        // erase every key that landed in the overflow group
        for i in crate::group::GROUP_CAPACITY..n {
            let removed = s.erase_at(0, tag(i as u64), &(i as i32), &EqualTo);
            assert_eq!(removed, Some((i as i32, i as i32)));
        }
        assert_eq!(s.free.len(), 1);
    }

    #[test]
    fn retain_chain_removes_matches_and_reclaims_overflow() {
        let mut s: ShardData<i32, i32> = ShardData::new(1);
        let n = crate::group::GROUP_CAPACITY * 2;
        for i in 0..n {
            s.emplace_at(0, tag(i as u64), i as i32, i as i32, &EqualTo, Ignore, &Global)
                .unwrap();
        }
        let removed = s.retain_chain(0, &mut |_, v| *v % 2 == 0);
        assert_eq!(removed, n / 2 + n % 2);
        for i in 0..n {
            let mut seen = None;
            s.cvisit_at(0, tag(i as u64), &(i as i32), &EqualTo, |_, v| seen = Some(*v));
            if i % 2 == 0 {
                assert_eq!(seen, None);
            } else {
                assert_eq!(seen, Some(i as i32));
            }
        }
    }

    #[test]
    fn take_all_and_resize_preserves_every_entry() {
        let mut s: ShardData<i32, i32> = ShardData::new(1);
        for i in 0..(crate::group::GROUP_CAPACITY as i32 * 2) {
            s.emplace_at(0, tag(i as u64), i, i, &EqualTo, Ignore, &Global).unwrap();
        }
        let mut drained = s.take_all_and_resize(4);
        drained.sort();
        let expected: Vec<(i32, i32)> = (0..(crate::group::GROUP_CAPACITY as i32 * 2)).map(|i| (i, i)).collect();
        assert_eq!(drained, expected);
        assert_eq!(s.group_count(), 4);
    }
}
