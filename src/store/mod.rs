//! The store: one handle over the identity map, relationship graph, live
//! arrays and the adapter boundary.
//!
//! All bookkeeping happens synchronously under one lock; adapter calls
//! happen in the futures returned by the finder and persistence methods.
//! Those futures are `'static` and must be polled to completion for the
//! fetch or save they start to settle.

mod arrays;
mod finders;
mod lifecycle;
mod relationships;
mod state;

pub use arrays::RecordArray;

use crate::adapter::{Adapter, FixtureAdapter, JsonNormalizer, Normalizer};
use crate::error::{Errors, Result, StoreError};
use crate::records::Layer;
use crate::schema::{ModelDescriptor, RelationshipKind, TypeRegistry};
use crate::state::{DirtyPhase, LifecycleEvent, RecordFlags, RecordState};
use crate::subscriptions::{
    StoreEvent, SubscriptionConfig, SubscriptionFilter, SubscriptionHandle, SubscriptionId,
    SubscriptionManager,
};
use crate::types::{Props, RecordData, RecordId, RecordRef, RecordSnapshot, ResourceRef, TypeKey};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use state::{expect_kind, StoreState};

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Largest number of ids passed to one `find_many` call.
    pub find_many_batch_size: usize,

    /// Records whose serialized attributes are at most this many bytes carry
    /// them inline in events.
    pub payload_threshold: usize,

    /// Buffer size of subscriptions created through [`Store::subscribe`].
    pub subscription_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            find_many_batch_size: 100,
            payload_threshold: 4096,
            subscription_buffer_size: 1000,
        }
    }
}

/// Builder for a [`Store`].
pub struct StoreBuilder {
    registry: TypeRegistry,
    adapter: Option<Arc<dyn Adapter>>,
    normalizer: Option<Arc<dyn Normalizer>>,
    config: StoreConfig,
}

impl StoreBuilder {
    pub fn adapter(mut self, adapter: impl Adapter + 'static) -> Self {
        self.adapter = Some(Arc::new(adapter));
        self
    }

    pub fn shared_adapter(mut self, adapter: Arc<dyn Adapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Normalizer used by [`Store::push_payload`] and [`Store::serialize`].
    pub fn normalizer(mut self, normalizer: impl Normalizer + 'static) -> Self {
        self.normalizer = Some(Arc::new(normalizer));
        self
    }

    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Without an adapter the store uses an empty [`FixtureAdapter`].
    pub fn build(self) -> Store {
        let registry = Arc::new(self.registry);
        let state = StoreState::new(Arc::clone(&registry), self.config.payload_threshold);
        Store {
            inner: Arc::new(StoreInner {
                config: self.config,
                registry,
                adapter: self
                    .adapter
                    .unwrap_or_else(|| Arc::new(FixtureAdapter::new())),
                normalizer: self
                    .normalizer
                    .unwrap_or_else(|| Arc::new(JsonNormalizer::new())),
                state: Mutex::new(state),
                subscriptions: SubscriptionManager::new(),
            }),
        }
    }
}

struct StoreInner {
    config: StoreConfig,
    registry: Arc<TypeRegistry>,
    adapter: Arc<dyn Adapter>,
    normalizer: Arc<dyn Normalizer>,
    /// Identity map, graph, arrays and pending fetches.
    state: Mutex<StoreState>,
    subscriptions: SubscriptionManager,
}

/// Client-side record store.
///
/// Cheap to clone; clones share the same records. Adapters and normalizers
/// receive the store by reference and must not call back into it from
/// synchronous hooks such as [`Adapter::generate_id_for_record`].
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Store")
            .field("records", &state.map.len())
            .field("arrays", &state.arrays.ids().len())
            .finish()
    }
}

impl Store {
    pub fn new(registry: TypeRegistry, adapter: impl Adapter + 'static) -> Self {
        Self::builder(registry).adapter(adapter).build()
    }

    pub fn builder(registry: TypeRegistry) -> StoreBuilder {
        StoreBuilder {
            registry,
            adapter: None,
            normalizer: None,
            config: StoreConfig::default(),
        }
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn normalizer(&self) -> &dyn Normalizer {
        self.inner.normalizer.as_ref()
    }

    /// Run `f` under the lock, settle dirtiness and arrays, then publish
    /// the resulting events once the lock is released. Work done before an
    /// error is kept and still published.
    pub(crate) fn mutate<T>(&self, f: impl FnOnce(&mut StoreState) -> Result<T>) -> Result<T> {
        let (result, events) = {
            let mut state = self.inner.state.lock();
            let result = f(&mut state);
            let events = state.flush();
            (result, events)
        };
        for event in events {
            self.inner.subscriptions.publish(event);
        }
        result
    }

    pub(crate) fn read<T>(&self, f: impl FnOnce(&StoreState) -> Result<T>) -> Result<T> {
        let state = self.inner.state.lock();
        f(&state)
    }

    pub(crate) fn model(&self, type_key: &TypeKey) -> Result<Arc<ModelDescriptor>> {
        self.inner.registry.model(type_key).cloned()
    }

    // --- Pushing data ---

    /// Push one normalized record, replacing its canonical attributes.
    pub fn push(&self, type_key: impl Into<TypeKey>, data: RecordData) -> Result<RecordRef> {
        let type_key = type_key.into();
        self.mutate(|state| {
            let client_id = state.push_data(&type_key, data, true)?;
            state.reference(client_id)
        })
    }

    /// Push a partial record: attributes are merged into the canonical data.
    pub fn update(&self, type_key: impl Into<TypeKey>, data: RecordData) -> Result<RecordRef> {
        let type_key = type_key.into();
        self.mutate(|state| {
            let client_id = state.push_data(&type_key, data, false)?;
            state.reference(client_id)
        })
    }

    pub fn push_many(
        &self,
        type_key: impl Into<TypeKey>,
        data: Vec<RecordData>,
    ) -> Result<Vec<RecordRef>> {
        let type_key = type_key.into();
        self.mutate(|state| {
            let mut pushed = Vec::with_capacity(data.len());
            for item in data {
                let client_id = state.push_data(&type_key, item, true)?;
                pushed.push(state.reference(client_id)?);
            }
            Ok(pushed)
        })
    }

    /// Normalize a raw JSON payload with the store's normalizer and push it.
    pub fn push_payload(
        &self,
        type_key: impl Into<TypeKey>,
        payload: &Value,
    ) -> Result<Vec<RecordRef>> {
        let model = self.model(&type_key.into())?;
        let document =
            self.inner
                .normalizer
                .normalize_payload(&self.inner.registry, &model, payload)?;
        self.mutate(|state| {
            let pushed = state.push_document(&model.type_key, document)?;
            pushed
                .into_iter()
                .map(|client_id| state.reference(client_id))
                .collect()
        })
    }

    /// Create a new, unsaved record.
    ///
    /// If `props` carries an id that is only known as an empty placeholder,
    /// the placeholder becomes the new record; any other existing record
    /// with that id is a [`StoreError::DuplicateId`].
    pub fn create_record(&self, type_key: impl Into<TypeKey>, props: Props) -> Result<RecordRef> {
        let type_key = type_key.into();
        let Props {
            id,
            attributes,
            belongs_to,
            has_many,
        } = props;
        let adapter = Arc::clone(&self.inner.adapter);

        self.mutate(|state| {
            let model = state.model(&type_key)?;
            for name in attributes.keys() {
                model.attribute(name)?;
            }
            let mut targets = Vec::with_capacity(belongs_to.len());
            for (name, target) in &belongs_to {
                let descriptor = model.relationship(name)?;
                expect_kind(descriptor, RelationshipKind::BelongsTo)?;
                let target = target
                    .as_ref()
                    .map(|target| state.check_member(descriptor, target))
                    .transpose()?;
                targets.push((descriptor.clone(), target));
            }
            let mut collections = Vec::with_capacity(has_many.len());
            for (name, members) in &has_many {
                let descriptor = model.relationship(name)?;
                expect_kind(descriptor, RelationshipKind::HasMany)?;
                let members = members
                    .iter()
                    .map(|member| state.check_member(descriptor, member))
                    .collect::<Result<Vec<_>>>()?;
                collections.push((descriptor.clone(), members));
            }

            let created = RecordState::Created(DirtyPhase::Uncommitted);
            let client_id = match &id {
                Some(id) => match state.map.lookup(&type_key, id) {
                    Some(existing) if state.map.get(existing)?.state == RecordState::Empty => {
                        state.set_state(existing, created)?;
                        existing
                    }
                    Some(_) => {
                        return Err(StoreError::DuplicateId {
                            type_key: type_key.clone(),
                            id: id.clone(),
                        })
                    }
                    None => state.map.materialize(&type_key, Some(id.clone()), created)?,
                },
                None => state.map.materialize(&type_key, None, created)?,
            };
            state.changed.insert(client_id);
            state.map.get_mut(client_id)?.local = attributes;

            for (descriptor, target) in targets {
                state
                    .graph()
                    .set_belongs_to(client_id, &descriptor, target, Layer::Current)?;
            }
            for (descriptor, members) in collections {
                state
                    .graph()
                    .replace_has_many(client_id, &descriptor, &members, Layer::Current)?;
            }

            if state.map.get(client_id)?.id.is_none() {
                let snapshot = state.snapshot(client_id)?;
                if let Some(id) = adapter.generate_id_for_record(&model, &snapshot) {
                    if let Err(e) = state.map.assign_id(client_id, id) {
                        state.dematerialize(client_id)?;
                        return Err(e);
                    }
                }
            }

            debug!("Created {}", state.map.get(client_id)?.describe());
            state.reference(client_id)
        })
    }

    // --- Identity lookups ---

    /// The record for `(type, id)` if it is loaded. Never fetches.
    pub fn peek(&self, type_key: impl Into<TypeKey>, id: impl Into<RecordId>) -> Option<RecordRef> {
        let type_key = type_key.into();
        let state = self.inner.state.lock();
        let client_id = state.map.lookup(&type_key, &id.into())?;
        let record = state.map.get(client_id).ok()?;
        record
            .flags()
            .is_loaded
            .then(|| RecordRef::new(client_id, record.type_key.clone()))
    }

    pub fn has_record_for_id(&self, type_key: impl Into<TypeKey>, id: impl Into<RecordId>) -> bool {
        self.peek(type_key, id).is_some()
    }

    /// The record for `(type, id)`, materializing an empty placeholder if it
    /// is unknown.
    pub fn record_for(
        &self,
        type_key: impl Into<TypeKey>,
        id: impl Into<RecordId>,
    ) -> Result<RecordRef> {
        let type_key = type_key.into();
        let id = id.into();
        self.mutate(|state| {
            state.model(&type_key)?;
            let client_id = state.map.record_for(&type_key, &id)?;
            state.reference(client_id)
        })
    }

    // --- Record reads ---

    pub fn state(&self, record: &RecordRef) -> Result<RecordState> {
        self.read(|state| Ok(state.map.get(record.client_id())?.state))
    }

    pub fn flags(&self, record: &RecordRef) -> Result<RecordFlags> {
        self.read(|state| Ok(state.map.get(record.client_id())?.flags()))
    }

    pub fn id(&self, record: &RecordRef) -> Result<Option<RecordId>> {
        self.read(|state| Ok(state.map.get(record.client_id())?.id.clone()))
    }

    pub fn is_reloading(&self, record: &RecordRef) -> Result<bool> {
        self.read(|state| Ok(state.map.get(record.client_id())?.reloading))
    }

    /// Effective value of an attribute: local edit, in-flight value,
    /// canonical value, then the declared default.
    pub fn attr(&self, record: &RecordRef, name: &str) -> Result<Value> {
        self.read(|state| {
            let record = state.live(record.client_id(), "get")?;
            let model = state.registry.model(&record.type_key)?;
            model.attribute(name)?;
            Ok(record.attr(model, name).cloned().unwrap_or(Value::Null))
        })
    }

    /// Validation errors reported by the last rejected save.
    pub fn errors(&self, record: &RecordRef) -> Result<Errors> {
        self.read(|state| Ok(state.map.get(record.client_id())?.errors.clone()))
    }

    /// Locally edited attributes as `(underlying, local)` pairs.
    pub fn changed_attributes(&self, record: &RecordRef) -> Result<IndexMap<String, (Value, Value)>> {
        self.read(|state| {
            let record = state.live(record.client_id(), "changedAttributes")?;
            Ok(record
                .local
                .iter()
                .map(|(name, value)| {
                    let before = record.underlying(name).cloned().unwrap_or(Value::Null);
                    (name.clone(), (before, value.clone()))
                })
                .collect())
        })
    }

    pub fn snapshot(&self, record: &RecordRef) -> Result<RecordSnapshot> {
        self.read(|state| state.snapshot(record.client_id()))
    }

    /// Snapshot of the live record a typed reference points at.
    pub fn snapshot_of(&self, reference: &ResourceRef) -> Option<RecordSnapshot> {
        let type_key = reference.type_key.as_ref()?;
        let state = self.inner.state.lock();
        let client_id = state.map.lookup(type_key, &reference.id)?;
        state.snapshot(client_id).ok()
    }

    /// Serialize the record's current view with the store's normalizer.
    pub fn serialize(&self, record: &RecordRef) -> Result<Value> {
        let snapshot = self.snapshot(record)?;
        let related = |reference: &ResourceRef| self.snapshot_of(reference);
        self.inner
            .normalizer
            .serialize(&self.inner.registry, &snapshot, &related)
    }

    // --- Local edits ---

    /// Set an attribute locally. Setting it back to its underlying value
    /// discards the edit; clearing the last validation error makes an
    /// invalid record valid again. Setting the value it already has is a
    /// no-op and publishes nothing.
    pub fn set_attr(&self, record: &RecordRef, name: &str, value: impl Into<Value>) -> Result<()> {
        let client_id = record.client_id();
        let value = value.into();
        self.mutate(|state| {
            let model = state.model_of(client_id)?;
            model.attribute(name)?;
            state.editable(client_id, "set")?;

            let record = state.map.get_mut(client_id)?;
            let current = record.local.get(name).or_else(|| record.underlying(name));
            if current == Some(&value) {
                return Ok(());
            }
            if record.underlying(name) == Some(&value) {
                record.local.remove(name);
            } else {
                record.local.insert(name.to_string(), value);
            }
            let cleared = record.errors.remove(name);
            let revalidate = cleared && record.errors.is_empty() && !record.flags().is_valid;
            state.changed.insert(client_id);

            if revalidate {
                state.transition(client_id, LifecycleEvent::BecameValid)?;
            }
            state.emit(client_id, |record| StoreEvent::RecordChanged {
                record,
                field: name.to_string(),
            })
        })
    }

    // --- Subscriptions ---

    pub fn subscribe(&self, filter: SubscriptionFilter) -> SubscriptionHandle {
        self.subscribe_with(SubscriptionConfig {
            buffer_size: self.inner.config.subscription_buffer_size,
            filter,
        })
    }

    pub fn subscribe_with(&self, config: SubscriptionConfig) -> SubscriptionHandle {
        self.inner.subscriptions.subscribe(config)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.subscriptions.unsubscribe(id);
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.subscription_count()
    }
}
