//! In-memory record representation.

use crate::error::Errors;
use crate::schema::{ModelDescriptor, RelationshipDescriptor, RelationshipKind};
use crate::state::{RecordFlags, RecordState};
use crate::types::{ClientId, RecordId, TypeKey};
use indexmap::{IndexMap, IndexSet};
use serde_json::{Map, Value};

/// Members of one relationship layer.
#[derive(Clone, Debug)]
pub(crate) enum Members {
    One(Option<ClientId>),
    /// Ordered, duplicate-free.
    Many(IndexSet<ClientId>),
}

/// Has-many layers are equal only with the same members in the same order.
impl PartialEq for Members {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Members::One(a), Members::One(b)) => a == b,
            (Members::Many(a), Members::Many(b)) => a.len() == b.len() && a.iter().eq(b.iter()),
            _ => false,
        }
    }
}

impl Eq for Members {}

impl Members {
    pub fn empty(kind: RelationshipKind) -> Self {
        match kind {
            RelationshipKind::BelongsTo => Members::One(None),
            RelationshipKind::HasMany => Members::Many(IndexSet::new()),
        }
    }

    pub fn contains(&self, client_id: ClientId) -> bool {
        match self {
            Members::One(member) => *member == Some(client_id),
            Members::Many(members) => members.contains(&client_id),
        }
    }

    pub fn to_vec(&self) -> Vec<ClientId> {
        match self {
            Members::One(member) => member.iter().copied().collect(),
            Members::Many(members) => members.iter().copied().collect(),
        }
    }

    /// Same members regardless of order.
    pub fn same_members(&self, other: &Members) -> bool {
        match (self, other) {
            (Members::Many(a), Members::Many(b)) => a.len() == b.len() && a.is_subset(b),
            _ => self == other,
        }
    }

    pub fn one(&self) -> Option<ClientId> {
        match self {
            Members::One(member) => *member,
            Members::Many(_) => None,
        }
    }
}

/// Which copy of a relationship an edit applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Layer {
    /// Last state confirmed by the server.
    Canonical,
    /// What the application currently sees.
    Current,
    Both,
}

impl Layer {
    pub fn touches_canonical(self) -> bool {
        matches!(self, Layer::Canonical | Layer::Both)
    }

    pub fn touches_current(self) -> bool {
        matches!(self, Layer::Current | Layer::Both)
    }
}

/// Edge state for one relationship of one record.
#[derive(Clone, Debug)]
pub(crate) struct RelationshipState {
    pub canonical: Members,
    pub current: Members,
    /// Current members captured when a save was issued.
    pub in_flight: Option<Members>,
    /// Opaque link to resolve the members lazily.
    pub link: Option<String>,
    /// Link value the members were last fetched for.
    pub link_loaded: Option<String>,
}

impl RelationshipState {
    pub fn new(kind: RelationshipKind) -> Self {
        Self {
            canonical: Members::empty(kind),
            current: Members::empty(kind),
            in_flight: None,
            link: None,
            link_loaded: None,
        }
    }

    /// The server-side baseline local changes are measured against.
    pub fn baseline(&self) -> &Members {
        self.in_flight.as_ref().unwrap_or(&self.canonical)
    }

    /// Local edits, reorders included.
    pub fn is_changed(&self) -> bool {
        &self.current != self.baseline()
    }

    /// Local edits that added or removed members.
    pub fn has_changed_members(&self) -> bool {
        !self.current.same_members(self.baseline())
    }

    /// Every record referenced from any layer.
    pub fn all_members(&self) -> IndexSet<ClientId> {
        let mut all: IndexSet<ClientId> = self.canonical.to_vec().into_iter().collect();
        all.extend(self.current.to_vec());
        if let Some(in_flight) = &self.in_flight {
            all.extend(in_flight.to_vec());
        }
        all
    }
}

/// A record held by the identity map.
#[derive(Clone, Debug)]
pub(crate) struct Record {
    pub client_id: ClientId,
    pub type_key: TypeKey,
    pub id: Option<RecordId>,
    pub state: RecordState,
    /// Canonical attribute values.
    pub data: Map<String, Value>,
    /// Local edits captured when the current save was issued.
    pub in_flight: Map<String, Value>,
    /// Local edits not yet sent.
    pub local: Map<String, Value>,
    pub errors: Errors,
    pub relationships: IndexMap<String, RelationshipState>,
    pub reloading: bool,
    /// False once the record has left the identity map.
    pub live: bool,
}

impl Record {
    pub fn new(
        client_id: ClientId,
        type_key: TypeKey,
        id: Option<RecordId>,
        state: RecordState,
    ) -> Self {
        Self {
            client_id,
            type_key,
            id,
            state,
            data: Map::new(),
            in_flight: Map::new(),
            local: Map::new(),
            errors: Errors::new(),
            relationships: IndexMap::new(),
            reloading: false,
            live: true,
        }
    }

    /// What is kept of a record once it leaves the identity map.
    pub fn retire(self) -> Self {
        let mut tombstone = Self::new(self.client_id, self.type_key, self.id, self.state);
        tombstone.live = false;
        tombstone
    }

    /// Value under local edits: in-flight edits over canonical data.
    pub fn underlying(&self, name: &str) -> Option<&Value> {
        self.in_flight.get(name).or_else(|| self.data.get(name))
    }

    pub fn attr<'a>(&'a self, model: &'a ModelDescriptor, name: &str) -> Option<&'a Value> {
        self.local
            .get(name)
            .or_else(|| self.underlying(name))
            .or_else(|| model.attributes.get(name).and_then(|a| a.default.as_ref()))
    }

    /// Every declared attribute with its effective value.
    pub fn effective_attributes(&self, model: &ModelDescriptor) -> Map<String, Value> {
        model
            .attributes
            .keys()
            .map(|name| {
                let value = self.attr(model, name).cloned().unwrap_or(Value::Null);
                (name.clone(), value)
            })
            .collect()
    }

    pub fn relationship(&self, name: &str) -> Option<&RelationshipState> {
        self.relationships.get(name)
    }

    pub fn relationship_mut(&mut self, descriptor: &RelationshipDescriptor) -> &mut RelationshipState {
        self.relationships
            .entry(descriptor.name.clone())
            .or_insert_with(|| RelationshipState::new(descriptor.kind))
    }

    /// Local attribute edits or owned relationship changes exist.
    pub fn has_local_changes(&self, model: &ModelDescriptor) -> bool {
        if !self.local.is_empty() {
            return true;
        }
        self.relationships.iter().any(|(name, state)| {
            model
                .relationships
                .get(name)
                .map(|descriptor| descriptor.is_owner() && state.is_changed())
                .unwrap_or(false)
        })
    }

    pub fn flags(&self) -> RecordFlags {
        self.state.flags()
    }

    pub fn describe(&self) -> String {
        match &self.id {
            Some(id) => format!("{}:{}", self.type_key, id),
            None => format!("{}:{}", self.type_key, self.client_id),
        }
    }
}

/// Read-only view of a record, handed to filter predicates.
pub struct RecordView<'a> {
    pub(crate) record: &'a Record,
    pub(crate) model: &'a ModelDescriptor,
}

impl<'a> RecordView<'a> {
    pub(crate) fn new(record: &'a Record, model: &'a ModelDescriptor) -> Self {
        Self { record, model }
    }

    pub fn client_id(&self) -> ClientId {
        self.record.client_id
    }

    pub fn id(&self) -> Option<&'a RecordId> {
        self.record.id.as_ref()
    }

    pub fn type_key(&self) -> &'a TypeKey {
        &self.record.type_key
    }

    /// Effective attribute value (local edit, canonical value, or default).
    pub fn get(&self, name: &str) -> Option<&'a Value> {
        self.record.attr(self.model, name)
    }

    pub fn str(&self, name: &str) -> Option<&'a str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn state(&self) -> RecordState {
        self.record.state
    }

    pub fn flags(&self) -> RecordFlags {
        self.record.flags()
    }
}
