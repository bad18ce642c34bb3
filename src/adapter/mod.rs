//! The boundary the store fetches, persists and normalizes data through.
//!
//! An [`Adapter`] talks to a backend and answers in normalized
//! [`RecordData`]. A [`Normalizer`] turns raw JSON payloads into
//! [`RecordData`] and snapshots back into JSON. Both are trait objects owned
//! by the store; strategies such as embedded-record extraction are composed
//! as decorators ([`EmbeddedRecords`]) rather than subclasses.

mod fixture;
mod normalizer;

pub use fixture::FixtureAdapter;
pub use normalizer::{EmbeddedRecords, JsonNormalizer, Normalizer, RelatedLookup};

use crate::error::{AdapterError, AdapterResult};
use crate::schema::{ModelDescriptor, RelationshipDescriptor};
use crate::store::Store;
use crate::types::{RecordData, RecordId, RecordSnapshot};
use async_trait::async_trait;
use serde_json::Value;

/// Adapter response: primary data plus sideloaded records and metadata.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Document<T> {
    pub data: T,
    /// Related records pushed alongside the primary data.
    pub included: Vec<RecordData>,
    /// Opaque response metadata (pagination, `since` tokens, ...).
    pub meta: Option<Value>,
}

impl<T> Document<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            included: Vec::new(),
            meta: None,
        }
    }

    pub fn with_included(mut self, included: Vec<RecordData>) -> Self {
        self.included = included;
        self
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

impl<T> From<T> for Document<T> {
    fn from(data: T) -> Self {
        Document::new(data)
    }
}

/// Backend contract.
///
/// Every hook except `find` has a default: `find_many` falls back to one
/// `find` per id, `generate_id_for_record` assigns nothing, and the rest
/// report [`AdapterError::NotImplemented`].
#[async_trait]
pub trait Adapter: Send + Sync {
    async fn find(
        &self,
        store: &Store,
        model: &ModelDescriptor,
        id: &RecordId,
    ) -> AdapterResult<Document<RecordData>>;

    /// `since` is the token returned in the `meta.since` of the previous
    /// response for this type, if any.
    async fn find_all(
        &self,
        _store: &Store,
        _model: &ModelDescriptor,
        _since: Option<&str>,
    ) -> AdapterResult<Document<Vec<RecordData>>> {
        Err(AdapterError::NotImplemented("find_all"))
    }

    async fn find_query(
        &self,
        _store: &Store,
        _model: &ModelDescriptor,
        _query: &Value,
    ) -> AdapterResult<Document<Vec<RecordData>>> {
        Err(AdapterError::NotImplemented("find_query"))
    }

    /// Fetch several records of one type. `owner` is set when the fetch
    /// resolves a relationship.
    async fn find_many(
        &self,
        store: &Store,
        model: &ModelDescriptor,
        ids: &[RecordId],
        _owner: Option<&RecordSnapshot>,
    ) -> AdapterResult<Document<Vec<RecordData>>> {
        let mut document = Document::new(Vec::with_capacity(ids.len()));
        for id in ids {
            let found = self.find(store, model, id).await?;
            document.data.push(found.data);
            document.included.extend(found.included);
        }
        Ok(document)
    }

    async fn find_has_many(
        &self,
        _store: &Store,
        _owner: &RecordSnapshot,
        _link: &str,
        _relationship: &RelationshipDescriptor,
    ) -> AdapterResult<Document<Vec<RecordData>>> {
        Err(AdapterError::NotImplemented("find_has_many"))
    }

    async fn find_belongs_to(
        &self,
        _store: &Store,
        _owner: &RecordSnapshot,
        _link: &str,
        _relationship: &RelationshipDescriptor,
    ) -> AdapterResult<Document<Option<RecordData>>> {
        Err(AdapterError::NotImplemented("find_belongs_to"))
    }

    /// Persist a new record. `None` means the backend returned no data and
    /// the record must already carry an id.
    async fn create_record(
        &self,
        _store: &Store,
        _model: &ModelDescriptor,
        _record: &RecordSnapshot,
    ) -> AdapterResult<Option<Document<RecordData>>> {
        Err(AdapterError::NotImplemented("create_record"))
    }

    async fn update_record(
        &self,
        _store: &Store,
        _model: &ModelDescriptor,
        _record: &RecordSnapshot,
    ) -> AdapterResult<Option<Document<RecordData>>> {
        Err(AdapterError::NotImplemented("update_record"))
    }

    async fn delete_record(
        &self,
        _store: &Store,
        _model: &ModelDescriptor,
        _record: &RecordSnapshot,
    ) -> AdapterResult<()> {
        Err(AdapterError::NotImplemented("delete_record"))
    }

    /// Assign an id to a locally created record before it is saved.
    fn generate_id_for_record(
        &self,
        _model: &ModelDescriptor,
        _record: &RecordSnapshot,
    ) -> Option<RecordId> {
        None
    }
}
