//! In-memory adapter backed by raw JSON fixtures.

use super::{Adapter, Document, JsonNormalizer, Normalizer};
use crate::error::{AdapterError, AdapterResult};
use crate::schema::ModelDescriptor;
use crate::store::Store;
use crate::types::{RecordData, RecordId, RecordSnapshot, TypeKey};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Adapter that serves and persists raw fixture payloads held in memory.
///
/// Fixtures are stored per type in the shape the normalizer reads, so a
/// fixture adapter with an [`EmbeddedRecords`](super::EmbeddedRecords)
/// normalizer serves embedded payloads. Queries match fixtures whose fields
/// equal every entry of the query object.
pub struct FixtureAdapter {
    fixtures: Mutex<HashMap<TypeKey, Vec<Value>>>,
    normalizer: Arc<dyn Normalizer>,
    next_id: AtomicU64,
}

impl Default for FixtureAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl FixtureAdapter {
    pub fn new() -> Self {
        Self::with_normalizer(Arc::new(JsonNormalizer::new()))
    }

    pub fn with_normalizer(normalizer: Arc<dyn Normalizer>) -> Self {
        Self {
            fixtures: Mutex::new(HashMap::new()),
            normalizer,
            next_id: AtomicU64::new(1),
        }
    }

    /// Seed the fixtures of a type, replacing any already present.
    pub fn with_fixtures(self, type_key: impl Into<TypeKey>, fixtures: Vec<Value>) -> Self {
        self.fixtures.lock().insert(type_key.into(), fixtures);
        self
    }

    /// Current fixtures of a type.
    pub fn fixtures(&self, type_key: &str) -> Vec<Value> {
        self.fixtures
            .lock()
            .get(&TypeKey::from(type_key))
            .cloned()
            .unwrap_or_default()
    }

    fn primary_key_of(model: &ModelDescriptor, fixture: &Value) -> Option<RecordId> {
        fixture.get(&model.primary_key).and_then(RecordId::from_json)
    }

    fn lookup(&self, model: &ModelDescriptor, id: &RecordId) -> Option<Value> {
        let fixtures = self.fixtures.lock();
        fixtures.get(&model.type_key)?.iter().find_map(|fixture| {
            (Self::primary_key_of(model, fixture).as_ref() == Some(id)).then(|| fixture.clone())
        })
    }

    fn normalize_one(
        &self,
        store: &Store,
        model: &ModelDescriptor,
        raw: &Value,
    ) -> AdapterResult<Document<RecordData>> {
        let mut included = Vec::new();
        let data = self
            .normalizer
            .normalize(store.registry(), model, raw, &mut included)
            .map_err(|e| AdapterError::failure(e.to_string()))?;
        Ok(Document::new(data).with_included(included))
    }

    fn normalize_all(
        &self,
        store: &Store,
        model: &ModelDescriptor,
        raw: &[Value],
    ) -> AdapterResult<Document<Vec<RecordData>>> {
        let mut document = Document::new(Vec::with_capacity(raw.len()));
        for item in raw {
            let found = self.normalize_one(store, model, item)?;
            document.data.push(found.data);
            document.included.extend(found.included);
        }
        Ok(document)
    }

    fn serialize(&self, store: &Store, record: &RecordSnapshot) -> AdapterResult<Value> {
        let lookup = |member: &crate::types::ResourceRef| store.snapshot_of(member);
        self.normalizer
            .serialize(store.registry(), record, &lookup)
            .map_err(|e| AdapterError::failure(e.to_string()))
    }

    /// Insert or replace the fixture with the same primary key.
    fn upsert(&self, model: &ModelDescriptor, id: &RecordId, payload: Value) {
        let mut fixtures = self.fixtures.lock();
        let list = fixtures.entry(model.type_key.clone()).or_default();
        match list
            .iter_mut()
            .find(|fixture| Self::primary_key_of(model, fixture).as_ref() == Some(id))
        {
            Some(existing) => *existing = payload,
            None => list.push(payload),
        }
    }
}

#[async_trait]
impl Adapter for FixtureAdapter {
    async fn find(
        &self,
        store: &Store,
        model: &ModelDescriptor,
        id: &RecordId,
    ) -> AdapterResult<Document<RecordData>> {
        let fixture = self.lookup(model, id).ok_or_else(|| {
            AdapterError::Failure(format!("no {} fixture with id {}", model.type_key, id))
        })?;
        self.normalize_one(store, model, &fixture)
    }

    async fn find_many(
        &self,
        store: &Store,
        model: &ModelDescriptor,
        ids: &[RecordId],
        _owner: Option<&RecordSnapshot>,
    ) -> AdapterResult<Document<Vec<RecordData>>> {
        let found = ids
            .iter()
            .filter_map(|id| self.lookup(model, id))
            .collect::<Vec<_>>();
        self.normalize_all(store, model, &found)
    }

    async fn find_all(
        &self,
        store: &Store,
        model: &ModelDescriptor,
        _since: Option<&str>,
    ) -> AdapterResult<Document<Vec<RecordData>>> {
        let all = self.fixtures(model.type_key.as_str());
        self.normalize_all(store, model, &all)
    }

    async fn find_query(
        &self,
        store: &Store,
        model: &ModelDescriptor,
        query: &Value,
    ) -> AdapterResult<Document<Vec<RecordData>>> {
        let conditions = query.as_object().cloned().unwrap_or_default();
        let matching = self
            .fixtures(model.type_key.as_str())
            .into_iter()
            .filter(|fixture| {
                conditions
                    .iter()
                    .all(|(field, expected)| fixture.get(field) == Some(expected))
            })
            .collect::<Vec<_>>();
        self.normalize_all(store, model, &matching)
    }

    async fn create_record(
        &self,
        store: &Store,
        model: &ModelDescriptor,
        record: &RecordSnapshot,
    ) -> AdapterResult<Option<Document<RecordData>>> {
        let mut payload = self.serialize(store, record)?;
        let id = match &record.id {
            Some(id) => id.clone(),
            None => {
                let id = RecordId::from(format!(
                    "fixture-{}",
                    self.next_id.fetch_add(1, Ordering::SeqCst)
                ));
                if let Value::Object(object) = &mut payload {
                    object.insert(model.primary_key.clone(), Value::String(id.to_string()));
                }
                id
            }
        };
        debug!("Fixture created {}:{}", model.type_key, id);
        self.upsert(model, &id, payload.clone());
        self.normalize_one(store, model, &payload).map(Some)
    }

    async fn update_record(
        &self,
        store: &Store,
        model: &ModelDescriptor,
        record: &RecordSnapshot,
    ) -> AdapterResult<Option<Document<RecordData>>> {
        let id = record
            .id
            .clone()
            .ok_or_else(|| AdapterError::Failure("cannot update a record without an id".into()))?;
        let payload = self.serialize(store, record)?;
        self.upsert(model, &id, payload.clone());
        self.normalize_one(store, model, &payload).map(Some)
    }

    async fn delete_record(
        &self,
        _store: &Store,
        model: &ModelDescriptor,
        record: &RecordSnapshot,
    ) -> AdapterResult<()> {
        if let Some(id) = &record.id {
            let mut fixtures = self.fixtures.lock();
            if let Some(list) = fixtures.get_mut(&model.type_key) {
                list.retain(|fixture| Self::primary_key_of(model, fixture).as_ref() != Some(id));
            }
        }
        Ok(())
    }
}
