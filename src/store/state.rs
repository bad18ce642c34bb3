//! Mutable store internals, guarded by the store lock.

use crate::adapter::Document;
use crate::collections::{ArrayChange, RecordArrayManager};
use crate::error::{Result, StoreError};
use crate::records::{IdentityMap, Layer, Members, Record};
use crate::relationships::Graph;
use crate::schema::{ModelDescriptor, RelationshipDescriptor, RelationshipKind, TypeRegistry};
use crate::state::{DirtyPhase, LifecycleEvent, RecordState};
use crate::subscriptions::{RecordSummary, StoreEvent};
use crate::types::{
    ClientId, RecordData, RecordRef, RecordSnapshot, RelationshipData, ResourceRef, TypeKey,
};
use futures::future::{BoxFuture, Shared};
use indexmap::{IndexMap, IndexSet};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// A fetch of one record, shared by every caller waiting on it.
pub(crate) type SharedFind = Shared<BoxFuture<'static, Result<RecordRef>>>;

/// A fetch whose result is read back from the store once it settles.
pub(crate) type SharedLoad = Shared<BoxFuture<'static, Result<()>>>;

pub(crate) struct StoreState {
    pub registry: Arc<TypeRegistry>,
    pub payload_threshold: usize,
    pub map: IdentityMap,
    pub arrays: RecordArrayManager,
    /// Records touched since the last flush.
    pub changed: IndexSet<ClientId>,
    /// Events waiting to be published once the lock is released.
    pub events: Vec<StoreEvent>,
    pub pending_finds: HashMap<ClientId, SharedFind>,
    pub pending_links: HashMap<(ClientId, String), SharedLoad>,
    /// `since` token returned by the last `find_all` per type.
    pub since: HashMap<TypeKey, String>,
}

impl StoreState {
    pub fn new(registry: Arc<TypeRegistry>, payload_threshold: usize) -> Self {
        Self {
            registry,
            payload_threshold,
            map: IdentityMap::new(),
            arrays: RecordArrayManager::new(),
            changed: IndexSet::new(),
            events: Vec::new(),
            pending_finds: HashMap::new(),
            pending_links: HashMap::new(),
            since: HashMap::new(),
        }
    }

    pub fn model(&self, type_key: &TypeKey) -> Result<Arc<ModelDescriptor>> {
        self.registry.model(type_key).cloned()
    }

    pub fn model_of(&self, client_id: ClientId) -> Result<Arc<ModelDescriptor>> {
        let record = self.map.get(client_id)?;
        self.model(&record.type_key)
    }

    pub fn graph(&mut self) -> Graph<'_> {
        Graph::new(&self.registry, &mut self.map, &mut self.changed)
    }

    pub fn reference(&self, client_id: ClientId) -> Result<RecordRef> {
        let record = self.map.get(client_id)?;
        Ok(RecordRef::new(client_id, record.type_key.clone()))
    }

    /// The record, if it is still in the identity map.
    pub fn live(&self, client_id: ClientId, operation: &'static str) -> Result<&Record> {
        let record = self.map.get(client_id)?;
        if !record.live {
            return Err(invalid_state(record, operation));
        }
        Ok(record)
    }

    /// The record, if its attributes and relationships may be edited.
    pub fn editable(&self, client_id: ClientId, operation: &'static str) -> Result<&Record> {
        let record = self.live(client_id, operation)?;
        let flags = record.flags();
        if !flags.is_loaded || flags.is_deleted {
            return Err(invalid_state(record, operation));
        }
        Ok(record)
    }

    /// Validate a record handed in as a relationship member.
    pub fn check_member(
        &self,
        relationship: &RelationshipDescriptor,
        member: &RecordRef,
    ) -> Result<ClientId> {
        let record = self.map.get(member.client_id())?;
        if !record.live {
            return Err(StoreError::Assertion(format!(
                "{} is no longer in the store and cannot be added to {}.{}",
                record.describe(),
                relationship.owner,
                relationship.name
            )));
        }
        if !self.registry.accepts(relationship, &record.type_key) {
            return Err(StoreError::Assertion(format!(
                "You cannot add a record of type '{}' to the '{}.{}' relationship (only '{}' allowed)",
                record.type_key, relationship.owner, relationship.name, relationship.target
            )));
        }
        Ok(member.client_id())
    }

    pub fn summary(&self, client_id: ClientId) -> Result<RecordSummary> {
        let record = self.map.get(client_id)?;
        let model = self.registry.model(&record.type_key)?;
        Ok(RecordSummary::from_record(record, model, self.payload_threshold))
    }

    pub fn emit(
        &mut self,
        client_id: ClientId,
        build: impl FnOnce(RecordSummary) -> StoreEvent,
    ) -> Result<()> {
        let summary = self.summary(client_id)?;
        self.events.push(build(summary));
        Ok(())
    }

    /// Feed an event to the record's state machine.
    pub fn transition(&mut self, client_id: ClientId, event: LifecycleEvent) -> Result<RecordState> {
        let record = self.map.get(client_id)?;
        let from = record.state;
        let to = from.apply(event).map_err(|_| StoreError::InvalidState {
            record: record.describe(),
            state: from.name(),
            operation: event.name(),
        })?;
        self.set_state(client_id, to)?;
        Ok(to)
    }

    pub fn set_state(&mut self, client_id: ClientId, to: RecordState) -> Result<()> {
        let record = self.map.get_mut(client_id)?;
        let from = std::mem::replace(&mut record.state, to);
        if from == to {
            return Ok(());
        }
        trace!("{} {} -> {}", record.describe(), from.name(), to.name());
        self.changed.insert(client_id);
        self.emit(client_id, |record| StoreEvent::StateChanged {
            record,
            from: from.name().to_string(),
            to: to.name().to_string(),
        })
    }

    /// Upsert one normalized record. `replace` swaps the canonical
    /// attributes wholesale; otherwise they are merged.
    pub fn push_data(
        &mut self,
        default_type: &TypeKey,
        data: RecordData,
        replace: bool,
    ) -> Result<ClientId> {
        let type_key = data
            .type_key
            .clone()
            .unwrap_or_else(|| default_type.clone());
        let model = self.model(&type_key)?;
        let client_id = self.map.record_for(&type_key, &data.id)?;
        self.load_data(client_id, &model, data, replace)?;
        Ok(client_id)
    }

    /// Push sideloaded records; each must carry its type.
    pub fn push_included(&mut self, included: Vec<RecordData>) -> Result<()> {
        for data in included {
            let type_key = data.type_key.clone().ok_or_else(|| {
                StoreError::Serialization(format!("sideloaded record {} has no type", data.id))
            })?;
            self.push_data(&type_key, data, true)?;
        }
        Ok(())
    }

    /// Push a whole adapter response. Returns the primary records in order.
    pub fn push_document(
        &mut self,
        default_type: &TypeKey,
        document: Document<Vec<RecordData>>,
    ) -> Result<Vec<ClientId>> {
        self.push_included(document.included)?;
        document
            .data
            .into_iter()
            .map(|data| self.push_data(default_type, data, true))
            .collect()
    }

    pub fn load_data(
        &mut self,
        client_id: ClientId,
        model: &ModelDescriptor,
        data: RecordData,
        replace: bool,
    ) -> Result<()> {
        let RecordData {
            attributes,
            relationships,
            links,
            ..
        } = data;

        let record = self.map.get_mut(client_id)?;
        let was_loaded = record.flags().is_loaded;
        absorb(record, model, attributes, links, replace);
        self.changed.insert(client_id);

        self.transition(client_id, LifecycleEvent::PushedData)?;
        if !was_loaded {
            self.emit(client_id, |record| StoreEvent::RecordLoaded { record })?;
        }
        self.apply_relationships(client_id, model, relationships)
    }

    /// Apply server relationship data. Relationships without a local change
    /// take the value on both layers; changed ones only canonically.
    pub fn apply_relationships(
        &mut self,
        client_id: ClientId,
        model: &ModelDescriptor,
        relationships: IndexMap<String, RelationshipData>,
    ) -> Result<()> {
        for (name, value) in relationships {
            let Some(descriptor) = model.relationships.get(&name) else {
                trace!("Ignoring undeclared relationship {}.{}", model.type_key, name);
                continue;
            };
            let members = self.resolve_members(descriptor, value)?;
            self.assign_from_server(client_id, descriptor, &members)?;
        }
        Ok(())
    }

    pub fn assign_from_server(
        &mut self,
        client_id: ClientId,
        descriptor: &RelationshipDescriptor,
        members: &Members,
    ) -> Result<()> {
        // Owners keep a local reorder; the other side only tracks membership.
        let unchanged = self
            .map
            .get(client_id)?
            .relationship(&descriptor.name)
            .map_or(true, |state| {
                if descriptor.is_owner() {
                    !state.is_changed()
                } else {
                    !state.has_changed_members()
                }
            });
        let layer = if unchanged {
            Layer::Both
        } else {
            Layer::Canonical
        };
        self.graph().assign(client_id, descriptor, members, layer)
    }

    fn resolve_members(
        &mut self,
        descriptor: &RelationshipDescriptor,
        value: RelationshipData,
    ) -> Result<Members> {
        match (descriptor.kind, value) {
            (RelationshipKind::BelongsTo, RelationshipData::One(target)) => {
                let target = match target {
                    Some(reference) => Some(self.materialize_ref(descriptor, reference)?),
                    None => None,
                };
                Ok(Members::One(target))
            }
            (RelationshipKind::HasMany, RelationshipData::One(None)) => {
                Ok(Members::empty(RelationshipKind::HasMany))
            }
            (RelationshipKind::HasMany, RelationshipData::Many(references)) => references
                .into_iter()
                .map(|reference| self.materialize_ref(descriptor, reference))
                .collect::<Result<IndexSet<_>>>()
                .map(Members::Many),
            (kind, value) => Err(StoreError::Assertion(format!(
                "{}.{} is a {:?} relationship but received {:?}",
                descriptor.owner, descriptor.name, kind, value
            ))),
        }
    }

    /// Record behind a reference, materialized as an empty placeholder if
    /// unknown.
    fn materialize_ref(
        &mut self,
        descriptor: &RelationshipDescriptor,
        reference: ResourceRef,
    ) -> Result<ClientId> {
        let type_key = reference
            .type_key
            .unwrap_or_else(|| descriptor.target.clone());
        self.model(&type_key)?;
        if !self.registry.accepts(descriptor, &type_key) {
            return Err(StoreError::Assertion(format!(
                "'{}.{}' expects '{}' but the payload references '{}:{}'",
                descriptor.owner, descriptor.name, descriptor.target, type_key, reference.id
            )));
        }
        self.map.record_for(&type_key, &reference.id)
    }

    pub fn snapshot(&self, client_id: ClientId) -> Result<RecordSnapshot> {
        let record = self.live(client_id, "snapshot")?;
        let model = self.registry.model(&record.type_key)?;
        let mut snapshot = RecordSnapshot {
            record: RecordRef::new(client_id, record.type_key.clone()),
            type_key: record.type_key.clone(),
            id: record.id.clone(),
            attributes: record.effective_attributes(model),
            belongs_to: IndexMap::new(),
            has_many: IndexMap::new(),
        };

        for (name, descriptor) in &model.relationships {
            let current = record
                .relationship(name)
                .map(|state| state.current.clone())
                .unwrap_or_else(|| Members::empty(descriptor.kind));
            match current {
                Members::One(target) => {
                    let target = target.and_then(|target| self.resource_ref(target));
                    snapshot.belongs_to.insert(name.clone(), target);
                }
                Members::Many(members) => {
                    let members = members
                        .iter()
                        .filter_map(|member| self.resource_ref(*member))
                        .collect();
                    snapshot.has_many.insert(name.clone(), members);
                }
            }
        }
        Ok(snapshot)
    }

    fn resource_ref(&self, client_id: ClientId) -> Option<ResourceRef> {
        let record = self.map.get(client_id).ok()?;
        if !record.live {
            return None;
        }
        let id = record.id.clone()?;
        Some(ResourceRef::typed(record.type_key.clone(), id))
    }

    /// Take a record out of the store: sever its edges, drop it from the
    /// identity map (and so from every array), and repoint inverse-less
    /// references at an empty placeholder with the same id.
    pub fn dematerialize(&mut self, client_id: ClientId) -> Result<()> {
        self.dematerialize_all(&[client_id])
    }

    /// [`StoreState::dematerialize`] for a batch, scanning the remaining
    /// records once for references.
    pub fn dematerialize_all(&mut self, client_ids: &[ClientId]) -> Result<()> {
        let mut removed = Vec::with_capacity(client_ids.len());
        for &client_id in client_ids {
            let record = self.map.get(client_id)?;
            if !record.live {
                continue;
            }
            let (type_key, id, description) =
                (record.type_key.clone(), record.id.clone(), record.describe());

            self.graph().sever(client_id)?;
            self.map.remove(client_id)?;
            self.pending_finds.remove(&client_id);
            self.changed.insert(client_id);
            debug!("Dematerialized {}", description);
            removed.push((client_id, type_key, id));
        }
        if removed.is_empty() {
            return Ok(());
        }

        let gone: HashSet<ClientId> = removed.iter().map(|(client_id, ..)| *client_id).collect();
        self.pending_links.retain(|(owner, _), _| !gone.contains(owner));
        let referenced = self.referenced(&gone);

        let mut replacements = HashMap::with_capacity(removed.len());
        for (client_id, type_key, id) in removed {
            let placeholder = match id {
                Some(id) if referenced.contains(&client_id) => {
                    Some(self.map.record_for(&type_key, &id)?)
                }
                _ => None,
            };
            replacements.insert(client_id, placeholder);
        }
        self.graph().repoint(&replacements)
    }

    /// Members of `gone` still pointed at by a live record.
    fn referenced(&self, gone: &HashSet<ClientId>) -> HashSet<ClientId> {
        let mut found = HashSet::new();
        for record in self.map.live() {
            for state in record.relationships.values() {
                found.extend(
                    state
                        .all_members()
                        .into_iter()
                        .filter(|member| gone.contains(member)),
                );
            }
        }
        found
    }

    /// Move a clean record to dirty or a reverted one back to saved.
    fn reconcile(&mut self, client_id: ClientId) -> Result<()> {
        let record = self.map.get(client_id)?;
        if !record.live {
            return Ok(());
        }
        let model = self.registry.model(&record.type_key)?;
        let dirty = record.has_local_changes(model);
        let event = match record.state {
            RecordState::Saved | RecordState::Error if dirty => LifecycleEvent::BecomeDirty,
            RecordState::Updated(DirtyPhase::Uncommitted) if !dirty => {
                LifecycleEvent::PropertyWasReset
            }
            _ => return Ok(()),
        };
        self.transition(client_id, event).map(|_| ())
    }

    /// Settle the records touched by an operation: reconcile dirtiness,
    /// update arrays, and hand back the events to publish.
    pub fn flush(&mut self) -> Vec<StoreEvent> {
        let touched: Vec<ClientId> = self.changed.drain(..).collect();
        for client_id in &touched {
            if let Err(e) = self.reconcile(*client_id) {
                warn!("Could not reconcile {}: {}", client_id, e);
            }
        }

        let mut touched: IndexSet<ClientId> = touched.into_iter().collect();
        touched.extend(self.changed.drain(..));
        let touched: Vec<ClientId> = touched.into_iter().collect();

        let changes = self
            .arrays
            .records_changed(&touched, &self.map, &self.registry);
        self.events.extend(changes.into_iter().map(array_event));
        std::mem::take(&mut self.events)
    }
}

/// Write server attributes and links into a record. Undeclared attributes
/// are dropped; declared ones are coerced to their kind.
pub(crate) fn absorb(
    record: &mut Record,
    model: &ModelDescriptor,
    attributes: Map<String, Value>,
    links: IndexMap<String, String>,
    replace: bool,
) {
    let mut incoming = Map::new();
    for (name, value) in attributes {
        match model.attributes.get(&name) {
            Some(attribute) => {
                incoming.insert(name, attribute.kind.coerce(value));
            }
            None => trace!("Ignoring undeclared attribute {}.{}", model.type_key, name),
        }
    }
    if replace {
        record.data = incoming;
    } else {
        record.data.extend(incoming);
    }

    for (name, link) in links {
        if let Some(descriptor) = model.relationships.get(&name) {
            record.relationship_mut(descriptor).link = Some(link);
        }
    }
}

pub(crate) fn array_event(change: ArrayChange) -> StoreEvent {
    StoreEvent::ArrayChanged {
        array: change.array,
        record_type: change.type_key.to_string(),
        removed: change.removed,
        added: change.added,
    }
}

pub(crate) fn invalid_state(record: &Record, operation: &'static str) -> StoreError {
    StoreError::InvalidState {
        record: record.describe(),
        state: record.state.name(),
        operation,
    }
}

pub(crate) fn expect_kind(relationship: &RelationshipDescriptor, kind: RelationshipKind) -> Result<()> {
    if relationship.kind == kind {
        return Ok(());
    }
    let expected = match kind {
        RelationshipKind::BelongsTo => "belongs-to",
        RelationshipKind::HasMany => "has-many",
    };
    Err(StoreError::Assertion(format!(
        "{}.{} is not a {} relationship",
        relationship.owner, relationship.name, expected
    )))
}
