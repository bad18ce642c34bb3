//! Saving, deleting, reverting, reloading and unloading records.

use super::state::{absorb, invalid_state, StoreState};
use super::Store;
use crate::adapter::Document;
use crate::error::{AdapterError, Result, StoreError};
use crate::records::{Layer, Members};
use crate::schema::{ModelDescriptor, RelationshipDescriptor};
use crate::state::{DeletedPhase, DirtyPhase, LifecycleEvent, RecordState};
use crate::subscriptions::StoreEvent;
use crate::types::{ClientId, RecordData, RecordRef, RecordSnapshot, TypeKey};
use futures::future::{join_all, ready, BoxFuture, FutureExt};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Operation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        })
    }
}

pub(crate) enum Commit {
    /// Nothing to persist.
    Done,
    Pending {
        model: Arc<ModelDescriptor>,
        snapshot: RecordSnapshot,
        operation: Operation,
    },
}

impl Store {
    /// Persist a record through the adapter.
    ///
    /// New records are created, deleted ones deleted and everything else
    /// updated. Edits made while the save is in flight stay local and keep
    /// the record dirty afterwards. Saving a record whose deletion is
    /// already committed resolves immediately.
    pub fn save(&self, record: &RecordRef) -> BoxFuture<'static, Result<RecordRef>> {
        let client_id = record.client_id();
        let handle = record.clone();
        let prepared = self.mutate(|state| state.will_commit(client_id));
        let store = self.clone();
        async move {
            let (model, snapshot, operation) = match prepared? {
                Commit::Done => return Ok(handle),
                Commit::Pending {
                    model,
                    snapshot,
                    operation,
                } => (model, snapshot, operation),
            };

            debug!(
                "{} {}:{}",
                operation,
                model.type_key,
                snapshot.id.as_ref().map_or("<new>", |id| id.as_str())
            );
            let adapter = &store.inner.adapter;
            let result = match operation {
                Operation::Create => adapter.create_record(&store, &model, &snapshot).await,
                Operation::Update => adapter.update_record(&store, &model, &snapshot).await,
                Operation::Delete => adapter
                    .delete_record(&store, &model, &snapshot)
                    .await
                    .map(|()| None),
            };

            store.mutate(|state| match result {
                Ok(document) => state.did_commit(client_id, &model, operation, document),
                Err(error) => Err(state.reject(client_id, error)),
            })?;
            Ok(handle)
        }
        .boxed()
    }

    /// Save several records concurrently. Every save runs to completion;
    /// the first failure is returned.
    pub fn save_all(&self, records: Vec<RecordRef>) -> BoxFuture<'static, Result<Vec<RecordRef>>> {
        let saves: Vec<_> = records.iter().map(|record| self.save(record)).collect();
        async move { join_all(saves).await.into_iter().collect() }.boxed()
    }

    /// Mark a record deleted. A record that was never saved leaves the store
    /// right away.
    pub fn delete_record(&self, record: &RecordRef) -> Result<()> {
        let client_id = record.client_id();
        self.mutate(|state| {
            let record = state.map.get(client_id)?;
            if !record.live {
                if record.state == RecordState::Deleted(DeletedPhase::Saved) {
                    return Ok(());
                }
                return Err(invalid_state(record, "deleteRecord"));
            }
            let to = state.transition(client_id, LifecycleEvent::DeleteRecord)?;
            if to == RecordState::Deleted(DeletedPhase::Saved) {
                state.dematerialize(client_id)?;
            }
            Ok(())
        })
    }

    /// Delete a record and persist the deletion.
    pub fn destroy_record(&self, record: &RecordRef) -> BoxFuture<'static, Result<RecordRef>> {
        match self.delete_record(record) {
            Ok(()) => self.save(record),
            Err(e) => ready(Err(e)).boxed(),
        }
    }

    /// Discard local edits.
    ///
    /// While a save is in flight only edits made after it started are
    /// discarded. A new record that was never saved leaves the store.
    pub fn rollback(&self, record: &RecordRef) -> Result<()> {
        self.mutate(|state| state.rollback(record.client_id()))
    }

    /// Refetch a loaded record, replacing its canonical data.
    pub fn reload(&self, record: &RecordRef) -> BoxFuture<'static, Result<RecordRef>> {
        let client_id = record.client_id();
        let handle = record.clone();
        let prepared = self.mutate(|state| {
            let record = state.live(client_id, "reload")?;
            let reloadable = matches!(
                record.state,
                RecordState::Saved
                    | RecordState::Error
                    | RecordState::Updated(DirtyPhase::Uncommitted)
                    | RecordState::Updated(DirtyPhase::Error)
            );
            if !reloadable || record.reloading {
                return Err(invalid_state(record, "reload"));
            }
            let id = record
                .id
                .clone()
                .ok_or_else(|| invalid_state(record, "reload"))?;
            let model = state.model(&record.type_key)?;
            state.map.get_mut(client_id)?.reloading = true;
            state.changed.insert(client_id);
            Ok((model, id))
        });
        let store = self.clone();
        async move {
            let (model, id) = prepared?;
            debug!("reload {}:{}", model.type_key, id);
            let result = store.inner.adapter.find(&store, &model, &id).await;
            store.mutate(|state| {
                let record = state.map.get_mut(client_id)?;
                record.reloading = false;
                let current = record.state;
                state.changed.insert(client_id);
                match result {
                    Ok(document) => {
                        state.push_included(document.included)?;
                        state.load_data(client_id, &model, document.data, true)?;
                        if current.apply(LifecycleEvent::Reloaded).is_ok() {
                            state.transition(client_id, LifecycleEvent::Reloaded)?;
                        }
                        Ok(())
                    }
                    Err(error) => {
                        let message = error.to_string();
                        warn!("Reload of {}:{} failed: {}", model.type_key, id, message);
                        if current.apply(LifecycleEvent::BecameError).is_ok() {
                            state.transition(client_id, LifecycleEvent::BecameError)?;
                            state.emit(client_id, |record| StoreEvent::RecordBecameError {
                                record,
                                message: message.clone(),
                            })?;
                        }
                        Err(error.into())
                    }
                }
            })?;
            Ok(handle)
        }
        .boxed()
    }

    /// Drop a clean record from the store. References to it through
    /// relationships without an inverse fall back to an empty placeholder.
    pub fn unload(&self, record: &RecordRef) -> Result<()> {
        self.mutate(|state| state.unload(record.client_id()))
    }

    /// Unload every record of a type. Fails without unloading anything if
    /// one of them cannot be unloaded.
    pub fn unload_all(&self, type_key: impl Into<TypeKey>) -> Result<()> {
        let type_key = type_key.into();
        self.mutate(|state| {
            state.model(&type_key)?;
            let records = state.map.of_type(&type_key);
            for client_id in &records {
                state.check_unloadable(*client_id)?;
            }
            for client_id in &records {
                state.prepare_unload(*client_id)?;
            }
            state.dematerialize_all(&records)?;
            state.since.remove(&type_key);
            Ok(())
        })
    }
}

impl StoreState {
    /// Move a record into flight: local edits and owned relationship values
    /// become the in-flight snapshot handed to the adapter.
    pub fn will_commit(&mut self, client_id: ClientId) -> Result<Commit> {
        let record = self.map.get(client_id)?;
        if record.state == RecordState::Deleted(DeletedPhase::Saved) {
            return Ok(Commit::Done);
        }
        if !record.live || record.reloading {
            return Err(invalid_state(record, "save"));
        }
        record
            .state
            .apply(LifecycleEvent::WillCommit)
            .map_err(|_| invalid_state(record, "save"))?;
        let operation = match record.state {
            RecordState::Created(_) => Operation::Create,
            RecordState::Deleted(_) => Operation::Delete,
            _ => Operation::Update,
        };
        let model = self.model(&record.type_key)?;

        self.transition(client_id, LifecycleEvent::WillCommit)?;
        let record = self.map.get_mut(client_id)?;
        let local = std::mem::take(&mut record.local);
        record.in_flight.extend(local);
        for (name, relationship) in record.relationships.iter_mut() {
            if model
                .relationships
                .get(name)
                .map_or(false, RelationshipDescriptor::is_owner)
            {
                relationship.in_flight = Some(relationship.current.clone());
            }
        }

        let snapshot = self.snapshot(client_id)?;
        Ok(Commit::Pending {
            model,
            snapshot,
            operation,
        })
    }

    /// Fold an acknowledged save into canonical state.
    pub fn did_commit(
        &mut self,
        client_id: ClientId,
        model: &ModelDescriptor,
        operation: Operation,
        document: Option<Document<RecordData>>,
    ) -> Result<()> {
        let data = match document {
            Some(document) => {
                self.push_included(document.included)?;
                Some(document.data)
            }
            None => None,
        };

        if let Some(data) = &data {
            if self.map.get(client_id)?.id.is_none() {
                if let Err(error) = self.map.assign_id(client_id, data.id.clone()) {
                    warn!("Cannot commit {}: {}", client_id, error);
                    self.reject(client_id, AdapterError::failure(error.to_string()));
                    return Err(error);
                }
            }
        }
        if operation != Operation::Delete && self.map.get(client_id)?.id.is_none() {
            return Err(self.reject(
                client_id,
                AdapterError::failure("the adapter returned no id for a new record"),
            ));
        }

        let record = self.map.get_mut(client_id)?;
        let in_flight = std::mem::take(&mut record.in_flight);
        record.data.extend(in_flight);
        record.errors.clear();
        let committed: Vec<(String, Members)> = record
            .relationships
            .iter_mut()
            .filter_map(|(name, state)| state.in_flight.take().map(|members| (name.clone(), members)))
            .collect();
        self.changed.insert(client_id);

        for (name, members) in committed {
            let descriptor = model.relationship(&name)?;
            self.graph()
                .assign(client_id, descriptor, &members, Layer::Canonical)?;
        }

        if let Some(data) = data {
            let RecordData {
                attributes,
                relationships,
                links,
                ..
            } = data;
            absorb(self.map.get_mut(client_id)?, model, attributes, links, false);
            self.apply_relationships(client_id, model, relationships)?;
        }

        let dirty = self.map.get(client_id)?.has_local_changes(model);
        self.transition(client_id, LifecycleEvent::DidCommit { dirty })?;

        match operation {
            Operation::Create => {
                self.emit(client_id, |record| StoreEvent::RecordCreated { record })
            }
            Operation::Update => {
                self.emit(client_id, |record| StoreEvent::RecordUpdated { record })
            }
            Operation::Delete => {
                self.emit(client_id, |record| StoreEvent::RecordDeleted { record })?;
                self.dematerialize(client_id)
            }
        }
    }

    /// Restore a rejected save and record why it failed. Returns the error
    /// to hand back to the caller.
    pub fn reject(&mut self, client_id: ClientId, error: AdapterError) -> StoreError {
        match self.try_reject(client_id, error) {
            Ok(error) | Err(error) => error,
        }
    }

    fn try_reject(&mut self, client_id: ClientId, error: AdapterError) -> Result<StoreError> {
        let record = self.map.get_mut(client_id)?;
        let in_flight = std::mem::take(&mut record.in_flight);
        let newer = std::mem::replace(&mut record.local, in_flight);
        record.local.extend(newer);
        for relationship in record.relationships.values_mut() {
            relationship.in_flight = None;
        }
        self.changed.insert(client_id);

        match error {
            AdapterError::Invalid(errors) => {
                debug!("{} rejected as invalid: {}", client_id, errors);
                self.map.get_mut(client_id)?.errors = errors.clone();
                self.transition(client_id, LifecycleEvent::BecameInvalid)?;
                self.emit(client_id, |record| StoreEvent::RecordBecameInvalid {
                    record,
                    errors: errors.clone(),
                })?;
                Ok(StoreError::Validation(errors))
            }
            other => {
                let message = other.to_string();
                warn!("Save of {} failed: {}", client_id, message);
                self.transition(client_id, LifecycleEvent::BecameError)?;
                self.emit(client_id, |record| StoreEvent::RecordBecameError {
                    record,
                    message: message.clone(),
                })?;
                Ok(StoreError::Adapter(message))
            }
        }
    }

    pub fn rollback(&mut self, client_id: ClientId) -> Result<()> {
        let record = self.map.get(client_id)?;
        let from = record.state;
        let to = from
            .apply(LifecycleEvent::Rollback)
            .map_err(|_| invalid_state(record, "rollback"))?;
        let model = self.model(&record.type_key)?;

        let record = self.map.get_mut(client_id)?;
        record.local.clear();
        if !from.is_in_flight() {
            record.errors.clear();
        }
        let resets: Vec<(RelationshipDescriptor, Members)> = model
            .relationships
            .values()
            .filter(|descriptor| descriptor.is_owner())
            .filter_map(|descriptor| {
                let state = record.relationship(&descriptor.name)?;
                let baseline = state.baseline();
                (state.current != *baseline).then(|| (descriptor.clone(), baseline.clone()))
            })
            .collect();
        self.changed.insert(client_id);

        for (descriptor, members) in resets {
            self.graph()
                .assign(client_id, &descriptor, &members, Layer::Current)?;
        }
        self.transition(client_id, LifecycleEvent::Rollback)?;

        let abandoned = matches!(from, RecordState::Created(_))
            && to == RecordState::Deleted(DeletedPhase::Saved);
        if abandoned {
            self.dematerialize(client_id)?;
        }
        Ok(())
    }

    pub fn check_unloadable(&self, client_id: ClientId) -> Result<()> {
        let record = self.map.get(client_id)?;
        if !record.live {
            return Ok(());
        }
        let unloadable = matches!(
            record.state,
            RecordState::Empty
                | RecordState::Saved
                | RecordState::Error
                | RecordState::Deleted(DeletedPhase::Saved)
        );
        if !unloadable || record.reloading || self.pending_finds.contains_key(&client_id) {
            return Err(invalid_state(record, "unload"));
        }
        Ok(())
    }

    pub fn unload(&mut self, client_id: ClientId) -> Result<()> {
        if self.prepare_unload(client_id)? {
            self.dematerialize(client_id)?;
        }
        Ok(())
    }

    /// Move a record to unloaded and announce it, leaving it in the map.
    /// False if it already left the store.
    fn prepare_unload(&mut self, client_id: ClientId) -> Result<bool> {
        self.check_unloadable(client_id)?;
        let record = self.map.get(client_id)?;
        if !record.live {
            return Ok(false);
        }
        debug!("Unloading {}", record.describe());
        self.transition(client_id, LifecycleEvent::Unload)?;
        self.emit(client_id, |record| StoreEvent::RecordUnloaded { record })?;
        Ok(true)
    }
}
