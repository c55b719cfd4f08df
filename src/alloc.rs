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

//! Allocation hook. This crate never manages raw memory itself (every
//! group and slot lives behind an ordinary `Box`/`Option`), so this is not
//! a byte allocator in the `GlobalAlloc` sense. It is the seam at which a
//! caller can inject deterministic allocation failure ahead of every point
//! the table would otherwise grow: a new overflow group, or a shard's
//! group array during rehash.

use crate::error::AllocError;

/// A growth gate consulted before the table allocates a new bucket group
/// or grows a shard's group array. The default [`Global`] always succeeds;
/// a test double can fail on a chosen call to exercise the table's
/// exception-safety guarantee (a rejected growth leaves the shard exactly
/// as it was before the call).
pub trait Allocator: Send + Sync {
    /// Called immediately before a growth of `additional` units (new
    /// overflow groups, or new top-level shard groups). Returning `Err`
    /// aborts the growth before any shard state is touched.
    fn check_grow(&self, additional: usize) -> Result<(), AllocError>;
}

/// The default allocator: growth always proceeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct Global;

impl Allocator for Global {
    fn check_grow(&self, _additional: usize) -> Result<(), AllocError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_never_fails() {
        assert!(Global.check_grow(1 << 20).is_ok());
    }
}
