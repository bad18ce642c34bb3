//! Identity map: at most one record per (type, id).

use super::record::Record;
use crate::error::{Result, StoreError};
use crate::state::RecordState;
use crate::types::{ClientId, RecordId, TypeKey};
use indexmap::{IndexMap, IndexSet};
use std::collections::HashMap;
use tracing::trace;

/// Arena of records keyed by [`ClientId`], plus per-type id indexes.
///
/// Records that leave the map (unloaded, or deleted and committed) are
/// stripped down to a tombstone with their identity and final state, so
/// outstanding handles keep reporting it. Tombstones are not reachable by id
/// and cannot be edited.
#[derive(Default)]
pub(crate) struct IdentityMap {
    /// Live records only.
    records: HashMap<ClientId, Record>,
    retired: HashMap<ClientId, Record>,
    by_id: HashMap<TypeKey, IndexMap<RecordId, ClientId>>,
    /// Live records per type in materialization order.
    by_type: HashMap<TypeKey, IndexSet<ClientId>>,
    next_client_id: u64,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self {
            next_client_id: 1,
            ..Default::default()
        }
    }

    pub fn get(&self, client_id: ClientId) -> Result<&Record> {
        self.records
            .get(&client_id)
            .or_else(|| self.retired.get(&client_id))
            .ok_or(StoreError::UnknownRecord(client_id))
    }

    pub fn get_mut(&mut self, client_id: ClientId) -> Result<&mut Record> {
        self.records
            .get_mut(&client_id)
            .ok_or(StoreError::UnknownRecord(client_id))
    }

    pub fn lookup(&self, type_key: &TypeKey, id: &RecordId) -> Option<ClientId> {
        self.by_id.get(type_key)?.get(id).copied()
    }

    /// Add a new record to the map.
    pub fn materialize(
        &mut self,
        type_key: &TypeKey,
        id: Option<RecordId>,
        state: RecordState,
    ) -> Result<ClientId> {
        if let Some(id) = &id {
            if self.lookup(type_key, id).is_some() {
                return Err(StoreError::DuplicateId {
                    type_key: type_key.clone(),
                    id: id.clone(),
                });
            }
        }

        let client_id = ClientId(self.next_client_id);
        self.next_client_id += 1;

        if let Some(id) = &id {
            self.by_id
                .entry(type_key.clone())
                .or_default()
                .insert(id.clone(), client_id);
        }
        self.by_type
            .entry(type_key.clone())
            .or_default()
            .insert(client_id);
        self.records
            .insert(client_id, Record::new(client_id, type_key.clone(), id, state));

        trace!("Materialized {}:{} ({:?})", type_key, client_id, state);
        Ok(client_id)
    }

    /// Existing record for `(type, id)` or a fresh empty placeholder.
    pub fn record_for(&mut self, type_key: &TypeKey, id: &RecordId) -> Result<ClientId> {
        match self.lookup(type_key, id) {
            Some(client_id) => Ok(client_id),
            None => self.materialize(type_key, Some(id.clone()), RecordState::Empty),
        }
    }

    /// Give a record its server id. The record stays the same instance; it
    /// just becomes reachable by id as well.
    pub fn assign_id(&mut self, client_id: ClientId, id: RecordId) -> Result<()> {
        let (type_key, current) = {
            let record = self.get(client_id)?;
            (record.type_key.clone(), record.id.clone())
        };
        match (&current, self.lookup(&type_key, &id)) {
            (Some(existing), _) if existing == &id => return Ok(()),
            (_, Some(other)) if other != client_id => {
                return Err(StoreError::DuplicateId { type_key, id });
            }
            _ => {}
        }

        let index = self.by_id.entry(type_key.clone()).or_default();
        if let Some(previous) = &current {
            index.shift_remove(previous);
        }
        index.insert(id.clone(), client_id);
        trace!("Promoted {}:{} to id {}", type_key, client_id, id);
        self.get_mut(client_id)?.id = Some(id);
        Ok(())
    }

    /// Take a record out of the indexes, leaving a tombstone.
    pub fn remove(&mut self, client_id: ClientId) -> Result<()> {
        let record = self
            .records
            .remove(&client_id)
            .ok_or(StoreError::UnknownRecord(client_id))?;
        let tombstone = record.retire();
        let type_key = tombstone.type_key.clone();
        let id = tombstone.id.clone();
        self.retired.insert(client_id, tombstone);

        if let Some(id) = id {
            if let Some(index) = self.by_id.get_mut(&type_key) {
                if index.get(&id) == Some(&client_id) {
                    index.shift_remove(&id);
                }
            }
        }
        if let Some(order) = self.by_type.get_mut(&type_key) {
            order.shift_remove(&client_id);
        }
        Ok(())
    }

    /// Live records of a type, in materialization order.
    pub fn of_type(&self, type_key: &TypeKey) -> Vec<ClientId> {
        self.by_type
            .get(type_key)
            .map(|order| order.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn live(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    pub fn live_mut(&mut self) -> impl Iterator<Item = &mut Record> {
        self.records.values_mut()
    }

    pub fn len(&self) -> usize {
        self.by_type.values().map(IndexSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
