//! Keeps live arrays in step with the identity map.

use super::array::{ArrayChange, ArrayId, ArrayKind, ArraySlot, ArrayState, FilterFn};
use crate::error::{Result, StoreError};
use crate::records::{IdentityMap, Record, RecordView};
use crate::schema::TypeRegistry;
use crate::types::{ClientId, TypeKey};
use indexmap::{IndexMap, IndexSet};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::trace;

/// Owns every live array of a store.
///
/// Arrays are updated from the set of records touched by an operation;
/// only those records are re-evaluated and each array gets at most one
/// delta per operation.
pub(crate) struct RecordArrayManager {
    arrays: IndexMap<ArrayId, ArrayState>,
    all: HashMap<TypeKey, ArrayId>,
    next_id: u64,
}

impl RecordArrayManager {
    pub fn new() -> Self {
        Self {
            arrays: IndexMap::new(),
            all: HashMap::new(),
            next_id: 1,
        }
    }

    fn allocate(&mut self) -> ArrayId {
        let id = ArrayId(self.next_id);
        self.next_id += 1;
        id
    }

    /// The all-of-type array, created on first use.
    pub fn all_array(
        &mut self,
        type_key: &TypeKey,
        map: &IdentityMap,
        registry: &TypeRegistry,
    ) -> ArrayId {
        if let Some(id) = self.all.get(type_key) {
            return *id;
        }
        let id = self.allocate();
        let mut state = ArrayState::new(id, type_key.clone(), ArrayKind::All);
        state.members = scan(&state, map, registry);
        self.arrays.insert(id, state);
        self.all.insert(type_key.clone(), id);
        id
    }

    pub fn create_filtered(
        &mut self,
        type_key: &TypeKey,
        filter: FilterFn,
        map: &IdentityMap,
        registry: &TypeRegistry,
    ) -> ArrayId {
        let id = self.allocate();
        let mut state = ArrayState::new(id, type_key.clone(), ArrayKind::Filtered);
        state.filter = Some(filter);
        state.is_loaded = true;
        state.members = scan(&state, map, registry);
        self.arrays.insert(id, state);
        id
    }

    pub fn create_query(&mut self, type_key: &TypeKey, query: Value) -> ArrayId {
        let id = self.allocate();
        let mut state = ArrayState::new(id, type_key.clone(), ArrayKind::Query);
        state.query = Some(query);
        self.arrays.insert(id, state);
        id
    }

    pub fn get(&self, id: ArrayId) -> Result<&ArrayState> {
        self.arrays.get(&id).ok_or(StoreError::ArrayNotFound(id.0))
    }

    pub fn get_mut(&mut self, id: ArrayId) -> Result<&mut ArrayState> {
        self.arrays.get_mut(&id).ok_or(StoreError::ArrayNotFound(id.0))
    }

    pub fn destroy(&mut self, id: ArrayId) -> Result<()> {
        let state = self
            .arrays
            .shift_remove(&id)
            .ok_or(StoreError::ArrayNotFound(id.0))?;
        if state.kind == ArrayKind::All {
            self.all.remove(&state.type_key);
        }
        Ok(())
    }

    /// Replace the predicate and rescan the whole type once.
    pub fn set_filter(
        &mut self,
        id: ArrayId,
        filter: FilterFn,
        map: &IdentityMap,
        registry: &TypeRegistry,
    ) -> Result<Option<ArrayChange>> {
        let state = self.get_mut(id)?;
        if state.kind != ArrayKind::Filtered {
            return Err(StoreError::Assertion(format!(
                "array {} is not a filtered array",
                id
            )));
        }
        state.filter = Some(filter);
        let desired = scan(state, map, registry);
        let removed: Vec<ClientId> = state
            .members
            .iter()
            .filter(|member| !desired.contains(*member))
            .copied()
            .collect();
        let added: Vec<ClientId> = desired
            .iter()
            .filter(|candidate| !state.members.contains(*candidate))
            .copied()
            .collect();
        Ok(apply_delta(state, removed, added, map))
    }

    /// Install the members returned by a query, in server order.
    pub fn set_query_results(
        &mut self,
        id: ArrayId,
        members: Vec<ClientId>,
        meta: Option<Value>,
        map: &IdentityMap,
    ) -> Result<Option<ArrayChange>> {
        let state = self.get_mut(id)?;
        state.meta = meta;
        state.is_loaded = true;
        state.is_updating = false;

        let incoming: IndexSet<ClientId> = members.into_iter().collect();
        let removed: Vec<ClientId> = state
            .members
            .iter()
            .filter(|member| !incoming.contains(*member))
            .copied()
            .collect();
        let added: Vec<ClientId> = incoming
            .iter()
            .filter(|member| !state.members.contains(*member))
            .copied()
            .collect();

        let mut change = apply_delta(state, removed, Vec::new(), map);
        state.members = incoming;
        let added: Vec<ArraySlot> = added
            .into_iter()
            .filter_map(|client_id| {
                let index = state.members.get_index_of(&client_id)?;
                Some(slot(index, client_id, map))
            })
            .collect();
        if !added.is_empty() {
            let change = change.get_or_insert_with(|| ArrayChange {
                array: state.id,
                type_key: state.type_key.clone(),
                removed: Vec::new(),
                added: Vec::new(),
            });
            change.added = added;
        }
        Ok(change)
    }

    /// Re-evaluate `changed` records against every array.
    pub fn records_changed(
        &mut self,
        changed: &[ClientId],
        map: &IdentityMap,
        registry: &TypeRegistry,
    ) -> Vec<ArrayChange> {
        let mut changes = Vec::new();
        for state in self.arrays.values_mut() {
            let mut removed = Vec::new();
            let mut added = Vec::new();
            for client_id in changed {
                let member = state.members.contains(client_id);
                let Ok(record) = map.get(*client_id) else {
                    if member {
                        removed.push(*client_id);
                    }
                    continue;
                };
                let belongs = match state.kind {
                    ArrayKind::Query => member && survives_query(record),
                    ArrayKind::All | ArrayKind::Filtered => admits(state, record, registry),
                };
                if member && !belongs {
                    removed.push(*client_id);
                } else if !member && belongs {
                    added.push(*client_id);
                }
            }
            if let Some(change) = apply_delta(state, removed, added, map) {
                trace!(
                    "Array {} changed: -{} +{}",
                    change.array,
                    change.removed.len(),
                    change.added.len()
                );
                changes.push(change);
            }
        }
        changes
    }

    pub fn ids(&self) -> Vec<ArrayId> {
        self.arrays.keys().copied().collect()
    }
}

impl Default for RecordArrayManager {
    fn default() -> Self {
        Self::new()
    }
}

fn admits(state: &ArrayState, record: &Record, registry: &TypeRegistry) -> bool {
    if !record.live || record.type_key != state.type_key {
        return false;
    }
    let flags = record.flags();
    if !flags.is_loaded || flags.is_deleted {
        return false;
    }
    match &state.filter {
        Some(filter) => match registry.model(&record.type_key) {
            Ok(model) => filter(&RecordView::new(record, model)),
            Err(_) => false,
        },
        None => true,
    }
}

fn survives_query(record: &Record) -> bool {
    record.live && !record.flags().is_deleted
}

/// Every admitted record of the array's type, in materialization order.
fn scan(state: &ArrayState, map: &IdentityMap, registry: &TypeRegistry) -> IndexSet<ClientId> {
    map.of_type(&state.type_key)
        .into_iter()
        .filter(|client_id| {
            map.get(*client_id)
                .map(|record| admits(state, record, registry))
                .unwrap_or(false)
        })
        .collect()
}

fn slot(index: usize, client_id: ClientId, map: &IdentityMap) -> ArraySlot {
    ArraySlot {
        index,
        client_id,
        id: map.get(client_id).ok().and_then(|record| record.id.clone()),
    }
}

/// Remove then append, reporting indices.
fn apply_delta(
    state: &mut ArrayState,
    removed: Vec<ClientId>,
    added: Vec<ClientId>,
    map: &IdentityMap,
) -> Option<ArrayChange> {
    if removed.is_empty() && added.is_empty() {
        return None;
    }

    let mut removed_slots: Vec<ArraySlot> = removed
        .iter()
        .filter_map(|client_id| {
            let index = state.members.get_index_of(client_id)?;
            Some(slot(index, *client_id, map))
        })
        .collect();
    removed_slots.sort_by_key(|slot| slot.index);
    let gone: HashSet<ClientId> = removed.into_iter().collect();
    state.members.retain(|member| !gone.contains(member));

    let mut added_slots = Vec::new();
    for client_id in added {
        if state.members.insert(client_id) {
            added_slots.push(slot(state.members.len() - 1, client_id, map));
        }
    }

    Some(ArrayChange {
        array: state.id,
        type_key: state.type_key.clone(),
        removed: removed_slots,
        added: added_slots,
    })
}
