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

//! A sharded, lock-striped concurrent associative container core.
//!
//! A [`Table`] splits its keyspace across a fixed number of independent
//! shards, each guarded by its own `RwLock`. Within a shard, lookup uses
//! SIMD-friendly "bucket groups": fixed-capacity clusters of slots tagged
//! with a 7-bit hash fingerprint, chained to further groups on overflow
//! rather than falling back to linear probing over tombstones.
//!
//! Every operation that touches a stored value does so through a closure
//! called while the owning shard's lock is held ([`Table::visit`],
//! [`Table::cvisit`], [`Table::emplace_or_visit`], ...); no reference into
//! the table ever escapes a lock. This trades away the ergonomics of a
//! guard type you can hold across statements for a table that can never
//! be asked to hand out a reference it can't account for.
//!
//! [`FlatHashTable`] is the single-threaded sibling: the same bucket-group
//! layout without any shard or lock, for callers who already have
//! exclusive access and don't want to pay for synchronization they don't
//! need.
//!
//! ```
//! use ccore_map::{Table, ShardPolicy};
//!
//! let table: Table<String, u32> = Table::new(ShardPolicy::Low);
//! table.emplace("a".to_owned(), 1).unwrap();
//! table.visit("a", |_, v| *v += 1);
//! assert_eq!(table.cvisit("a", |_, v| *v), Some(2));
//! ```

mod alloc;
mod equal;
mod error;
mod flat;
mod group;
mod hash;
mod policy;
mod set;
mod shard;
mod table;

pub use alloc::{Allocator, Global};
pub use equal::{EqualTo, KeyEqual};
pub use error::AllocError;
pub use flat::FlatHashTable;
pub use hash::{AHashBuilder, HashOne};
pub use policy::{Assign, Ignore, OnExisting};
pub use set::ConcurrentSet;
pub use table::{ConcurrentMap, ShardPolicy, Table};
