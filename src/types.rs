//! Core types shared across the store.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Store-assigned key for a record instance.
///
/// Assigned when the record is materialized and never reused, so it stays
/// valid for records that have no server id yet.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Server-side identifier of a record. Always a string; numeric ids are
/// coerced on the way in.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        RecordId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Coerce a JSON scalar into an id. Only strings and numbers qualify.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(RecordId(s.clone())),
            Value::Number(n) => Some(RecordId(n.to_string())),
            _ => None,
        }
    }
}

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({:?})", self.0)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        RecordId(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        RecordId(s)
    }
}

impl From<&String> for RecordId {
    fn from(s: &String) -> Self {
        RecordId(s.clone())
    }
}

impl From<&RecordId> for RecordId {
    fn from(id: &RecordId) -> Self {
        id.clone()
    }
}

macro_rules! record_id_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for RecordId {
            fn from(n: $t) -> Self {
                RecordId(n.to_string())
            }
        })*
    };
}

record_id_from_int!(u32, u64, i32, i64, usize);

/// Name of a registered model type (e.g. `"person"`).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeKey(Arc<str>);

impl TypeKey {
    pub fn new(key: &str) -> Self {
        TypeKey(Arc::from(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeKey({})", &self.0)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TypeKey {
    fn from(s: &str) -> Self {
        TypeKey::new(s)
    }
}

impl From<String> for TypeKey {
    fn from(s: String) -> Self {
        TypeKey(Arc::from(s))
    }
}

impl From<&TypeKey> for TypeKey {
    fn from(t: &TypeKey) -> Self {
        t.clone()
    }
}

impl Serialize for TypeKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TypeKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(TypeKey::from(s))
    }
}

/// Non-owning handle to a record held by a store.
///
/// Two handles are equal exactly when they name the same record instance.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RecordRef {
    client_id: ClientId,
    type_key: TypeKey,
}

impl RecordRef {
    pub(crate) fn new(client_id: ClientId, type_key: TypeKey) -> Self {
        Self { client_id, type_key }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn type_key(&self) -> &TypeKey {
        &self.type_key
    }
}

impl fmt::Debug for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordRef({}:{})", self.type_key, self.client_id)
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.type_key, self.client_id)
    }
}

/// Reference to a related record inside normalized data.
///
/// `type_key` is required for polymorphic relationships and ignored
/// (defaulted to the declared target) otherwise.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub id: RecordId,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_key: Option<TypeKey>,
}

impl ResourceRef {
    pub fn new(id: impl Into<RecordId>) -> Self {
        Self {
            id: id.into(),
            type_key: None,
        }
    }

    pub fn typed(type_key: impl Into<TypeKey>, id: impl Into<RecordId>) -> Self {
        Self {
            id: id.into(),
            type_key: Some(type_key.into()),
        }
    }
}

/// Relationship value inside normalized data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RelationshipData {
    Many(Vec<ResourceRef>),
    One(Option<ResourceRef>),
}

/// One record as produced by the normalization boundary:
/// `{ id, attributes, relationships }` plus lazily resolvable links.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordData {
    pub id: RecordId,

    /// Concrete type, when it differs from the requested one (polymorphic
    /// results, sideloaded records).
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_key: Option<TypeKey>,

    #[serde(default)]
    pub attributes: Map<String, Value>,

    #[serde(default)]
    pub relationships: IndexMap<String, RelationshipData>,

    /// Relationship name to opaque link (e.g. a URL).
    #[serde(default)]
    pub links: IndexMap<String, String>,
}

impl RecordData {
    pub fn new(id: impl Into<RecordId>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Set the concrete type of this record.
    pub fn of_type(mut self, type_key: impl Into<TypeKey>) -> Self {
        self.type_key = Some(type_key.into());
        self
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn belongs_to(mut self, name: impl Into<String>, id: impl Into<RecordId>) -> Self {
        self.relationships.insert(
            name.into(),
            RelationshipData::One(Some(ResourceRef::new(id))),
        );
        self
    }

    /// Explicitly empty belongs-to.
    pub fn belongs_to_null(mut self, name: impl Into<String>) -> Self {
        self.relationships
            .insert(name.into(), RelationshipData::One(None));
        self
    }

    pub fn belongs_to_ref(mut self, name: impl Into<String>, target: Option<ResourceRef>) -> Self {
        self.relationships
            .insert(name.into(), RelationshipData::One(target));
        self
    }

    pub fn has_many<I, T>(mut self, name: impl Into<String>, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<RecordId>,
    {
        let refs = ids.into_iter().map(ResourceRef::new).collect();
        self.relationships
            .insert(name.into(), RelationshipData::Many(refs));
        self
    }

    pub fn has_many_refs(mut self, name: impl Into<String>, refs: Vec<ResourceRef>) -> Self {
        self.relationships
            .insert(name.into(), RelationshipData::Many(refs));
        self
    }

    pub fn link(mut self, name: impl Into<String>, link: impl Into<String>) -> Self {
        self.links.insert(name.into(), link.into());
        self
    }
}

/// Initial values for a locally created record.
#[derive(Clone, Debug, Default)]
pub struct Props {
    pub(crate) id: Option<RecordId>,
    pub(crate) attributes: Map<String, Value>,
    pub(crate) belongs_to: Vec<(String, Option<RecordRef>)>,
    pub(crate) has_many: Vec<(String, Vec<RecordRef>)>,
}

impl Props {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<RecordId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn belongs_to(mut self, name: impl Into<String>, target: Option<&RecordRef>) -> Self {
        self.belongs_to.push((name.into(), target.cloned()));
        self
    }

    pub fn has_many(mut self, name: impl Into<String>, members: &[RecordRef]) -> Self {
        self.has_many.push((name.into(), members.to_vec()));
        self
    }
}

/// Read-only copy of a record handed to adapter hooks.
#[derive(Clone, Debug)]
pub struct RecordSnapshot {
    pub record: RecordRef,
    pub type_key: TypeKey,
    pub id: Option<RecordId>,
    /// Effective attribute values (local edits over canonical data, defaults
    /// applied).
    pub attributes: Map<String, Value>,
    /// Members that have an id; records without one cannot be referenced.
    pub belongs_to: IndexMap<String, Option<ResourceRef>>,
    pub has_many: IndexMap<String, Vec<ResourceRef>>,
}

impl RecordSnapshot {
    pub fn attr(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Attribute as a string slice, if it is one.
    pub fn str_attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(Value::as_str)
    }

    /// The snapshot's attributes and id as normalized record data.
    pub fn to_record_data(&self) -> Option<RecordData> {
        let id = self.id.clone()?;
        let mut data = RecordData::new(id).of_type(self.type_key.clone());
        data.attributes = self.attributes.clone();
        for (name, target) in &self.belongs_to {
            data.relationships
                .insert(name.clone(), RelationshipData::One(target.clone()));
        }
        for (name, members) in &self.has_many {
            data.relationships
                .insert(name.clone(), RelationshipData::Many(members.clone()));
        }
        Some(data)
    }
}
