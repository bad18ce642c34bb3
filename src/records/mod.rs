//! Records and the identity map that owns them.

mod identity;
mod record;

pub(crate) use identity::IdentityMap;
pub(crate) use record::{Layer, Members, Record, RelationshipState};
pub use record::RecordView;
