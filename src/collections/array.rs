//! Live record array state.

use crate::records::RecordView;
use crate::types::{ClientId, RecordId, TypeKey};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Membership predicate of a filtered array.
pub type FilterFn = Arc<dyn Fn(&RecordView<'_>) -> bool + Send + Sync>;

/// Store-assigned identifier of a live array.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArrayId(pub u64);

impl fmt::Display for ArrayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrayKind {
    /// Every loaded record of a type.
    All,
    /// Loaded records of a type matching a predicate.
    Filtered,
    /// Records returned by an adapter query.
    Query,
}

/// One position touched by an array change.
///
/// Removal indices are positions before the change; addition indices are
/// positions after it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArraySlot {
    pub index: usize,
    pub client_id: ClientId,
    pub id: Option<RecordId>,
}

/// A minimal membership delta for one array.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ArrayChange {
    pub array: ArrayId,
    pub type_key: TypeKey,
    pub removed: Vec<ArraySlot>,
    pub added: Vec<ArraySlot>,
}

pub(crate) struct ArrayState {
    pub id: ArrayId,
    pub type_key: TypeKey,
    pub kind: ArrayKind,
    pub members: IndexSet<ClientId>,
    pub filter: Option<FilterFn>,
    pub query: Option<Value>,
    pub meta: Option<Value>,
    pub is_loaded: bool,
    pub is_updating: bool,
}

impl ArrayState {
    pub fn new(id: ArrayId, type_key: TypeKey, kind: ArrayKind) -> Self {
        Self {
            id,
            type_key,
            kind,
            members: IndexSet::new(),
            filter: None,
            query: None,
            meta: None,
            is_loaded: false,
            is_updating: false,
        }
    }
}

impl fmt::Debug for ArrayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayState")
            .field("id", &self.id)
            .field("type_key", &self.type_key)
            .field("kind", &self.kind)
            .field("members", &self.members)
            .field("is_loaded", &self.is_loaded)
            .finish()
    }
}
