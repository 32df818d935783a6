//! Persistent single-file key/value stores over a free-space-managed file:
//! [`Dict`] is an unordered dictionary indexed by linear hashing,
//! [`OrderedDict`] a B+ tree with bidirectional range scans. Keys and values
//! are arbitrary byte strings.
//!
//! Both stores are strictly single-writer (the backing file is locked
//! exclusively on open) and persist their state only through [`Dict::close`]
//! / [`OrderedDict::close`]; a handle that is dropped instead loses what was
//! written since open.

mod b_tree;
mod error;
mod hash_dict;
mod hash_slot;
mod inner_node;
mod leaf_node;
mod overflow;
mod space;
mod util;

#[cfg(test)]
mod tests;

pub use b_tree::{OrderedDict, OrderedDictStats, RangeIter, RangeKey};
pub use error::{Error, Result};
pub use hash_dict::{Dict, DictCursor, DictStats};
pub use space::SpaceStats;
