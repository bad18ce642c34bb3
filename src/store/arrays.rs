//! Handle to a live record array.

use super::state::array_event;
use super::Store;
use crate::collections::{ArrayId, ArrayKind, ArrayState, FilterFn};
use crate::error::Result;
use crate::records::{IdentityMap, RecordView};
use crate::types::{ClientId, RecordRef, TypeKey};
use futures::future::BoxFuture;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// A live, ordered collection of records of one type.
///
/// Reads always reflect the store's current contents. A destroyed array
/// reads as empty.
#[derive(Clone)]
pub struct RecordArray {
    id: ArrayId,
    kind: ArrayKind,
    type_key: TypeKey,
    store: Store,
}

impl RecordArray {
    pub(crate) fn new(id: ArrayId, kind: ArrayKind, type_key: TypeKey, store: Store) -> Self {
        Self {
            id,
            kind,
            type_key,
            store,
        }
    }

    pub fn id(&self) -> ArrayId {
        self.id
    }

    pub fn kind(&self) -> ArrayKind {
        self.kind
    }

    pub fn type_key(&self) -> &TypeKey {
        &self.type_key
    }

    fn with<T: Default>(&self, f: impl FnOnce(&ArrayState, &IdentityMap) -> T) -> T {
        let state = self.store.inner.state.lock();
        match state.arrays.get(self.id) {
            Ok(array) => f(array, &state.map),
            Err(_) => T::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.with(|array, _| array.members.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<RecordRef> {
        self.with(|array, map| {
            array
                .members
                .get_index(index)
                .and_then(|member| reference(map, *member))
        })
    }

    pub fn first(&self) -> Option<RecordRef> {
        self.get(0)
    }

    pub fn last(&self) -> Option<RecordRef> {
        self.with(|array, map| {
            array
                .members
                .last()
                .and_then(|member| reference(map, *member))
        })
    }

    pub fn contains(&self, record: &RecordRef) -> bool {
        self.with(|array, _| array.members.contains(&record.client_id()))
    }

    /// Members at this moment.
    pub fn to_vec(&self) -> Vec<RecordRef> {
        self.with(|array, map| {
            array
                .members
                .iter()
                .filter_map(|member| reference(map, *member))
                .collect()
        })
    }

    /// Iterate over a snapshot of the members.
    pub fn iter(&self) -> std::vec::IntoIter<RecordRef> {
        self.to_vec().into_iter()
    }

    /// True once the adapter has answered at least once. Filtered arrays
    /// are loaded from the start.
    pub fn is_loaded(&self) -> bool {
        self.with(|array, _| array.is_loaded)
    }

    pub fn is_updating(&self) -> bool {
        self.with(|array, _| array.is_updating)
    }

    /// Metadata of the last adapter response.
    pub fn meta(&self) -> Option<Value> {
        self.with(|array, _| array.meta.clone())
    }

    /// The query a query array was created from.
    pub fn query(&self) -> Option<Value> {
        self.with(|array, _| array.query.clone())
    }

    /// Replace the predicate of a filtered array. Like the predicate given to
    /// [`Store::filter`], it runs under the store's lock and must not call
    /// back into the store.
    pub fn set_filter<F>(&self, filter: F) -> Result<()>
    where
        F: Fn(&RecordView<'_>) -> bool + Send + Sync + 'static,
    {
        let filter: FilterFn = Arc::new(filter);
        self.store.mutate(|state| {
            if let Some(change) =
                state
                    .arrays
                    .set_filter(self.id, filter, &state.map, &state.registry)?
            {
                state.events.push(array_event(change));
            }
            Ok(())
        })
    }

    /// Refetch from the adapter.
    pub fn update(&self) -> BoxFuture<'static, Result<RecordArray>> {
        self.store.update_array(self.id)
    }

    /// Save every member.
    pub fn save(&self) -> BoxFuture<'static, Result<Vec<RecordRef>>> {
        self.store.save_all(self.to_vec())
    }

    /// Stop tracking the array. Its members are untouched.
    pub fn destroy(&self) -> Result<()> {
        self.store.mutate(|state| state.arrays.destroy(self.id))
    }
}

fn reference(map: &IdentityMap, client_id: ClientId) -> Option<RecordRef> {
    let record = map.get(client_id).ok()?;
    Some(RecordRef::new(client_id, record.type_key.clone()))
}

impl<'a> IntoIterator for &'a RecordArray {
    type Item = RecordRef;
    type IntoIter = std::vec::IntoIter<RecordRef>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Debug for RecordArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordArray")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("type", &self.type_key)
            .field("len", &self.len())
            .finish()
    }
}
