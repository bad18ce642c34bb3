//! Shared fixtures for integration tests: a schema and a scripted adapter
//! that records every call it receives.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tessera::{
    Adapter, AdapterError, AdapterResult, AttrKind, AttributeSchema, Document, ModelDescriptor,
    ModelSchema, RecordData, RecordId, RecordSnapshot, RelationshipDescriptor, RelationshipSchema,
    Store, StoreConfig, TypeRegistry,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// person <-> post (author / posts), post <-> comment (async), post -> tag
/// without inverse, person -> item polymorphic without inverse.
pub fn registry() -> TypeRegistry {
    TypeRegistry::builder()
        .model(
            ModelSchema::new("person")
                .attr("name", AttrKind::String)
                .attribute(AttributeSchema::new("age", AttrKind::Number).default_value(0))
                .has_many("posts", "post")
                .relationship(RelationshipSchema::has_many("favorites", "item").polymorphic()),
        )
        .model(
            ModelSchema::new("post")
                .attr("title", AttrKind::String)
                .belongs_to("author", "person")
                .relationship(RelationshipSchema::has_many("comments", "comment").asynchronous())
                .relationship(RelationshipSchema::has_many("tags", "tag").no_inverse()),
        )
        .model(
            ModelSchema::new("comment")
                .attr("body", AttrKind::String)
                .belongs_to("post", "post"),
        )
        .model(ModelSchema::new("tag").attr("label", AttrKind::String))
        .model(ModelSchema::new("item").attr("title", AttrKind::String))
        .model(
            ModelSchema::new("book")
                .extends("item")
                .attr("isbn", AttrKind::String),
        )
        .model(ModelSchema::new("film").extends("item"))
        .build()
        .expect("test schema is valid")
}

/// Adapter answering from in-memory records, with switchable failures.
#[derive(Default)]
pub struct ScriptedAdapter {
    records: Mutex<HashMap<String, Vec<RecordData>>>,
    links: Mutex<HashMap<String, Vec<RecordData>>>,
    calls: Mutex<Vec<String>>,
    save_error: Mutex<Option<AdapterError>>,
    find_error: Mutex<Option<AdapterError>>,
    /// Attributes the server adds to every save response.
    echo: Mutex<Option<Value>>,
    generated: AtomicU64,
    since: AtomicU64,
    pub generate_ids: bool,
}

impl ScriptedAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn generating_ids() -> Arc<Self> {
        Arc::new(Self {
            generate_ids: true,
            ..Default::default()
        })
    }

    pub fn seed(&self, type_key: &str, data: RecordData) {
        let mut records = self.records.lock();
        let list = records.entry(type_key.to_string()).or_default();
        list.retain(|existing| existing.id != data.id);
        list.push(data);
    }

    pub fn seed_link(&self, link: &str, data: Vec<RecordData>) {
        self.links.lock().insert(link.to_string(), data);
    }

    pub fn fail_saves(&self, error: Option<AdapterError>) {
        *self.save_error.lock() = error;
    }

    pub fn fail_finds(&self, error: Option<AdapterError>) {
        *self.find_error.lock() = error;
    }

    /// Attributes merged into every create/update response.
    pub fn echo(&self, attributes: Value) {
        *self.echo.lock() = Some(attributes);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    fn log(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn lookup(&self, model: &ModelDescriptor, id: &RecordId) -> Option<RecordData> {
        self.records
            .lock()
            .get(model.type_key.as_str())?
            .iter()
            .find(|data| &data.id == id)
            .cloned()
    }

    fn saved(&self, id: RecordId) -> AdapterResult<Option<Document<RecordData>>> {
        if let Some(error) = self.save_error.lock().clone() {
            return Err(error);
        }
        let mut data = RecordData::new(id);
        if let Some(Value::Object(echo)) = self.echo.lock().clone() {
            data.attributes = echo;
        }
        Ok(Some(Document::new(data)))
    }
}

#[async_trait]
impl Adapter for ScriptedAdapter {
    async fn find(
        &self,
        _store: &Store,
        model: &ModelDescriptor,
        id: &RecordId,
    ) -> AdapterResult<Document<RecordData>> {
        self.log(format!("find {} {}", model.type_key, id));
        if let Some(error) = self.find_error.lock().clone() {
            return Err(error);
        }
        self.lookup(model, id)
            .map(Document::new)
            .ok_or_else(|| AdapterError::failure(format!("{}:{} not found", model.type_key, id)))
    }

    async fn find_many(
        &self,
        _store: &Store,
        model: &ModelDescriptor,
        ids: &[RecordId],
        _owner: Option<&RecordSnapshot>,
    ) -> AdapterResult<Document<Vec<RecordData>>> {
        let joined: Vec<&str> = ids.iter().map(RecordId::as_str).collect();
        self.log(format!("find_many {} {}", model.type_key, joined.join(",")));
        if let Some(error) = self.find_error.lock().clone() {
            return Err(error);
        }
        Ok(Document::new(
            ids.iter().filter_map(|id| self.lookup(model, id)).collect(),
        ))
    }

    async fn find_all(
        &self,
        _store: &Store,
        model: &ModelDescriptor,
        since: Option<&str>,
    ) -> AdapterResult<Document<Vec<RecordData>>> {
        self.log(format!("find_all {} {}", model.type_key, since.unwrap_or("-")));
        let all = self
            .records
            .lock()
            .get(model.type_key.as_str())
            .cloned()
            .unwrap_or_default();
        let token = self.since.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Document::new(all).with_meta(json!({ "since": format!("t{}", token) })))
    }

    async fn find_query(
        &self,
        _store: &Store,
        model: &ModelDescriptor,
        query: &Value,
    ) -> AdapterResult<Document<Vec<RecordData>>> {
        self.log(format!("find_query {} {}", model.type_key, query));
        let conditions = query.as_object().cloned().unwrap_or_default();
        let matching: Vec<RecordData> = self
            .records
            .lock()
            .get(model.type_key.as_str())
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|data| {
                conditions
                    .iter()
                    .all(|(field, expected)| data.attributes.get(field) == Some(expected))
            })
            .collect();
        let total = matching.len();
        Ok(Document::new(matching).with_meta(json!({ "total": total })))
    }

    async fn find_has_many(
        &self,
        _store: &Store,
        _owner: &RecordSnapshot,
        link: &str,
        _relationship: &RelationshipDescriptor,
    ) -> AdapterResult<Document<Vec<RecordData>>> {
        self.log(format!("find_has_many {}", link));
        Ok(Document::new(
            self.links.lock().get(link).cloned().unwrap_or_default(),
        ))
    }

    async fn find_belongs_to(
        &self,
        _store: &Store,
        _owner: &RecordSnapshot,
        link: &str,
        _relationship: &RelationshipDescriptor,
    ) -> AdapterResult<Document<Option<RecordData>>> {
        self.log(format!("find_belongs_to {}", link));
        Ok(Document::new(
            self.links
                .lock()
                .get(link)
                .and_then(|found| found.first().cloned()),
        ))
    }

    async fn create_record(
        &self,
        _store: &Store,
        model: &ModelDescriptor,
        record: &RecordSnapshot,
    ) -> AdapterResult<Option<Document<RecordData>>> {
        self.log(format!("create {}", model.type_key));
        let id = record.id.clone().unwrap_or_else(|| {
            RecordId::from(self.generated.fetch_add(1, Ordering::SeqCst) + 1)
        });
        self.saved(id)
    }

    async fn update_record(
        &self,
        _store: &Store,
        model: &ModelDescriptor,
        record: &RecordSnapshot,
    ) -> AdapterResult<Option<Document<RecordData>>> {
        let id = record.id.clone().unwrap_or_else(|| RecordId::new(""));
        self.log(format!("update {} {}", model.type_key, id));
        self.saved(id)
    }

    async fn delete_record(
        &self,
        _store: &Store,
        model: &ModelDescriptor,
        record: &RecordSnapshot,
    ) -> AdapterResult<()> {
        self.log(format!(
            "delete {} {}",
            model.type_key,
            record.id.as_ref().map_or("", RecordId::as_str)
        ));
        match self.save_error.lock().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn generate_id_for_record(
        &self,
        model: &ModelDescriptor,
        _record: &RecordSnapshot,
    ) -> Option<RecordId> {
        self.generate_ids.then(|| {
            RecordId::from(format!(
                "{}-{}",
                model.type_key,
                self.generated.fetch_add(1, Ordering::SeqCst) + 1
            ))
        })
    }
}

pub fn store_with(adapter: &Arc<ScriptedAdapter>) -> Store {
    init_tracing();
    Store::builder(registry())
        .shared_adapter(adapter.clone())
        .build()
}

pub fn store_with_config(adapter: &Arc<ScriptedAdapter>, config: StoreConfig) -> Store {
    init_tracing();
    Store::builder(registry())
        .shared_adapter(adapter.clone())
        .config(config)
        .build()
}
