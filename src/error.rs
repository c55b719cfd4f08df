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

use core::fmt;

/// The only error kind this crate's bookkeeping ever raises: an allocator
/// that refused to grow a bucket-group array or hand out a new chain node.
/// Predicate, visitor, and hasher failures are not represented here; they
/// are ordinary Rust panics that unwind through an already-consistent
/// shard (see the crate's top-level docs for the exact guarantee).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The requested capacity would overflow `usize` bookkeeping.
    CapacityOverflow,
    /// The configured [`crate::alloc::Allocator`] reported failure.
    AllocatorFailure,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CapacityOverflow => write!(f, "requested capacity overflows usize"),
            Self::AllocatorFailure => write!(f, "allocator failed to satisfy the request"),
        }
    }
}

impl std::error::Error for AllocError {}
