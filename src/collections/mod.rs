//! Live collections over the identity map.
//!
//! Three kinds of array stay current without being rebuilt:
//! - all records of a type ([`ArrayKind::All`])
//! - records of a type matching a predicate ([`ArrayKind::Filtered`])
//! - records returned by an adapter query ([`ArrayKind::Query`])
//!
//! Membership changes are reported as [`ArraySlot`] deltas through
//! [`StoreEvent::ArrayChanged`](crate::StoreEvent::ArrayChanged).

mod array;
mod manager;

pub(crate) use array::{ArrayChange, ArrayState};
pub use array::{ArrayId, ArrayKind, ArraySlot, FilterFn};
pub(crate) use manager::RecordArrayManager;
