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

//! The key-equality functor. Mirrors the `Equal` template parameter of the
//! source library's `concurrent_map`/`concurrent_set`: a type the table
//! holds immutably and shares across every shard.

use core::borrow::Borrow;

/// Compares a stored key `K` against a lookup key `Q`. The blanket
/// implementation on [`EqualTo`] is what makes heterogeneous lookup
/// (`visit<Q>`, `contains<Q>`, ...) possible: any `Q` that `K` can
/// [`Borrow`] is comparable without constructing a `K`.
pub trait KeyEqual<K: ?Sized, Q: ?Sized = K>: Send + Sync {
    fn key_eq(&self, stored: &K, lookup: &Q) -> bool;
}

/// The default, transparent equality functor. Equivalent to the source
/// library's `equal_to<>` default.
#[derive(Debug, Default, Clone, Copy)]
pub struct EqualTo;

impl<K, Q> KeyEqual<K, Q> for EqualTo
where
    K: Borrow<Q>,
    Q: Eq + ?Sized,
{
    fn key_eq(&self, stored: &K, lookup: &Q) -> bool {
        stored.borrow() == lookup
    }
}
