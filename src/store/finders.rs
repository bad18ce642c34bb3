//! Fetching records and collections through the adapter.

use super::state::{array_event, SharedFind, SharedLoad, StoreState};
use super::{RecordArray, Store};
use crate::collections::{ArrayId, ArrayKind};
use crate::error::{Result, StoreError};
use crate::records::RecordView;
use crate::schema::ModelDescriptor;
use crate::state::{LifecycleEvent, RecordState};
use crate::types::{ClientId, RecordId, RecordRef, RecordSnapshot, TypeKey};
use futures::future::{join_all, ready, BoxFuture, FutureExt};
use indexmap::IndexMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, trace};

/// How a request for one record is satisfied.
pub(crate) enum Lookup {
    Ready(RecordRef),
    Pending(SharedFind),
}

impl Store {
    /// Find a record by type and id.
    ///
    /// A loaded record resolves without calling the adapter. Concurrent
    /// finds for the same record share one adapter call.
    pub fn find(
        &self,
        type_key: impl Into<TypeKey>,
        id: impl Into<RecordId>,
    ) -> BoxFuture<'static, Result<RecordRef>> {
        let type_key = type_key.into();
        let id = id.into();
        let lookup = self.mutate(|state| {
            state.model(&type_key)?;
            let client_id = state.map.record_for(&type_key, &id)?;
            self.begin_find(state, client_id)
        });
        async move {
            match lookup? {
                Lookup::Ready(record) => Ok(record),
                Lookup::Pending(fetch) => fetch.await,
            }
        }
        .boxed()
    }

    /// Find several records of one type. Unloaded ones are fetched in
    /// `find_many` batches; the result keeps the order of `ids`.
    pub fn find_by_ids<I, T>(
        &self,
        type_key: impl Into<TypeKey>,
        ids: I,
    ) -> BoxFuture<'static, Result<Vec<RecordRef>>>
    where
        I: IntoIterator<Item = T>,
        T: Into<RecordId>,
    {
        let type_key = type_key.into();
        let ids: Vec<RecordId> = ids.into_iter().map(Into::into).collect();
        let waits = self.mutate(|state| {
            state.model(&type_key)?;
            let members = ids
                .iter()
                .map(|id| state.map.record_for(&type_key, id))
                .collect::<Result<Vec<_>>>()?;
            self.begin_find_many(state, &members, None)
        });
        async move { join_all(waits?).await.into_iter().collect() }.boxed()
    }

    /// Fetch every record of a type and return the live all-of-type array.
    pub fn find_all(&self, type_key: impl Into<TypeKey>) -> BoxFuture<'static, Result<RecordArray>> {
        let type_key = type_key.into();
        let prepared = self.mutate(|state| {
            let model = state.model(&type_key)?;
            let array = state
                .arrays
                .all_array(&type_key, &state.map, &state.registry);
            state.arrays.get_mut(array)?.is_updating = true;
            Ok((model, array, state.since.get(&type_key).cloned()))
        });
        let store = self.clone();
        async move {
            let (model, array, since) = prepared?;
            store.refresh_all(model, array, since).await
        }
        .boxed()
    }

    /// Run an adapter query into a new query array.
    pub fn find_query(
        &self,
        type_key: impl Into<TypeKey>,
        query: Value,
    ) -> BoxFuture<'static, Result<RecordArray>> {
        let type_key = type_key.into();
        let prepared = self.mutate(|state| {
            let model = state.model(&type_key)?;
            let array = state.arrays.create_query(&type_key, query.clone());
            state.arrays.get_mut(array)?.is_updating = true;
            Ok((model, array))
        });
        let store = self.clone();
        async move {
            let (model, array) = prepared?;
            store.run_query(model, array, query).await
        }
        .boxed()
    }

    /// Filtered array whose membership is decided locally, after pushing the
    /// results of `query` into the store. The predicate follows the rules of
    /// [`Store::filter`].
    pub fn filter_query<F>(
        &self,
        type_key: impl Into<TypeKey>,
        query: Value,
        filter: F,
    ) -> BoxFuture<'static, Result<RecordArray>>
    where
        F: Fn(&RecordView<'_>) -> bool + Send + Sync + 'static,
    {
        let type_key = type_key.into();
        let filtered = self.filter(type_key.clone(), filter);
        let model = self.model(&type_key);
        let store = self.clone();
        async move {
            let array = filtered?;
            let model = model?;
            debug!("filter_query {} {}", model.type_key, query);
            let result = store.inner.adapter.find_query(&store, &model, &query).await;
            store.mutate(|state| {
                state.push_document(&model.type_key, result?)?;
                Ok(())
            })?;
            Ok(array)
        }
        .boxed()
    }

    /// Live array of every loaded record of a type. Never fetches.
    pub fn all(&self, type_key: impl Into<TypeKey>) -> Result<RecordArray> {
        let type_key = type_key.into();
        let array = self.mutate(|state| {
            state.model(&type_key)?;
            Ok(state
                .arrays
                .all_array(&type_key, &state.map, &state.registry))
        })?;
        self.array(array)
    }

    /// Live array of loaded records of a type matching `filter`. Never
    /// fetches.
    ///
    /// The predicate runs under the store's lock whenever a record of the
    /// type changes. It must only read the [`RecordView`] it is given; calling
    /// back into the store from it deadlocks.
    pub fn filter<F>(&self, type_key: impl Into<TypeKey>, filter: F) -> Result<RecordArray>
    where
        F: Fn(&RecordView<'_>) -> bool + Send + Sync + 'static,
    {
        let type_key = type_key.into();
        let array = self.mutate(|state| {
            state.model(&type_key)?;
            Ok(state.arrays.create_filtered(
                &type_key,
                Arc::new(filter),
                &state.map,
                &state.registry,
            ))
        })?;
        self.array(array)
    }

    pub(crate) fn array(&self, id: ArrayId) -> Result<RecordArray> {
        self.read(|state| {
            let array = state.arrays.get(id)?;
            Ok(RecordArray::new(
                id,
                array.kind,
                array.type_key.clone(),
                self.clone(),
            ))
        })
    }

    /// Refetch the contents of an array: the type's records for all-of-type
    /// and filtered arrays, the original query for query arrays.
    pub(crate) fn update_array(&self, id: ArrayId) -> BoxFuture<'static, Result<RecordArray>> {
        let prepared = self.mutate(|state| {
            let array = state.arrays.get_mut(id)?;
            array.is_updating = true;
            let (kind, type_key, query) = (array.kind, array.type_key.clone(), array.query.clone());
            let model = state.model(&type_key)?;
            let since = state.since.get(&type_key).cloned();
            Ok((kind, model, query, since))
        });
        let store = self.clone();
        async move {
            let (kind, model, query, since) = prepared?;
            match kind {
                ArrayKind::Query => {
                    store
                        .run_query(model, id, query.unwrap_or(Value::Null))
                        .await
                }
                ArrayKind::All | ArrayKind::Filtered => store.refresh_all(model, id, since).await,
            }
        }
        .boxed()
    }

    async fn refresh_all(
        &self,
        model: Arc<ModelDescriptor>,
        array: ArrayId,
        since: Option<String>,
    ) -> Result<RecordArray> {
        debug!("find_all {} since {:?}", model.type_key, since);
        let result = self
            .inner
            .adapter
            .find_all(self, &model, since.as_deref())
            .await;
        self.mutate(|state| {
            if let Ok(array) = state.arrays.get_mut(array) {
                array.is_updating = false;
            }
            let document = result?;
            let meta = document.meta.clone();
            state.push_document(&model.type_key, document)?;

            match meta.as_ref().and_then(|meta| meta.get("since")) {
                None | Some(Value::Null) => {}
                Some(Value::String(token)) => {
                    state.since.insert(model.type_key.clone(), token.clone());
                }
                Some(token) => {
                    state.since.insert(model.type_key.clone(), token.to_string());
                }
            }

            let array = state.arrays.get_mut(array)?;
            array.is_loaded = true;
            array.meta = meta;
            Ok(())
        })?;
        self.array(array)
    }

    async fn run_query(
        &self,
        model: Arc<ModelDescriptor>,
        array: ArrayId,
        query: Value,
    ) -> Result<RecordArray> {
        debug!("find_query {} {}", model.type_key, query);
        let result = self.inner.adapter.find_query(self, &model, &query).await;
        self.mutate(|state| {
            if let Ok(array) = state.arrays.get_mut(array) {
                array.is_updating = false;
            }
            let document = result?;
            let meta = document.meta.clone();
            let members = state.push_document(&model.type_key, document)?;
            if let Some(change) = state
                .arrays
                .set_query_results(array, members, meta, &state.map)?
            {
                state.events.push(array_event(change));
            }
            Ok(())
        })?;
        self.array(array)
    }

    /// Start, or join, the fetch for one record. Records that are not empty
    /// are ready as they are.
    pub(crate) fn begin_find(&self, state: &mut StoreState, client_id: ClientId) -> Result<Lookup> {
        if let Some(pending) = state.pending_finds.get(&client_id) {
            trace!("Joining in-flight fetch for {}", client_id);
            return Ok(Lookup::Pending(pending.clone()));
        }
        let record = state.map.get(client_id)?;
        if record.state != RecordState::Empty {
            return Ok(Lookup::Ready(RecordRef::new(client_id, record.type_key.clone())));
        }
        let id = record.id.clone().ok_or_else(|| {
            StoreError::Assertion(format!("{} has no id to fetch", record.describe()))
        })?;
        let model = state.model(&record.type_key)?;

        state.transition(client_id, LifecycleEvent::LoadingData)?;
        let fetch = self.fetch_one(model, client_id, id).shared();
        state.pending_finds.insert(client_id, fetch.clone());
        Ok(Lookup::Pending(fetch))
    }

    fn fetch_one(
        &self,
        model: Arc<ModelDescriptor>,
        client_id: ClientId,
        id: RecordId,
    ) -> BoxFuture<'static, Result<RecordRef>> {
        let store = self.clone();
        async move {
            debug!("find {}:{}", model.type_key, id);
            let result = store.inner.adapter.find(&store, &model, &id).await;
            store.mutate(|state| {
                state.pending_finds.remove(&client_id);
                let outcome = match result {
                    Ok(document) => state
                        .push_included(document.included)
                        .and_then(|()| state.push_data(&model.type_key, document.data, true))
                        .and_then(|found| state.reference(found)),
                    Err(e) => {
                        debug!("find {}:{} failed: {}", model.type_key, id, e);
                        Err(e.into())
                    }
                };
                not_found_unless_loaded(state, client_id)?;
                outcome
            })
        }
        .boxed()
    }

    /// Fetch the empty records among `members` in `find_many` batches per
    /// type. Returns one future per member, in order.
    pub(crate) fn begin_find_many(
        &self,
        state: &mut StoreState,
        members: &[ClientId],
        owner: Option<RecordSnapshot>,
    ) -> Result<Vec<SharedFind>> {
        let mut batches: IndexMap<_, IndexMap<ClientId, RecordId>> = IndexMap::new();
        for client_id in members {
            if state.pending_finds.contains_key(client_id) {
                continue;
            }
            let record = state.map.get(*client_id)?;
            if record.state != RecordState::Empty {
                continue;
            }
            if let Some(id) = &record.id {
                batches
                    .entry(record.type_key.clone())
                    .or_default()
                    .insert(*client_id, id.clone());
            }
        }

        let batch_size = self.inner.config.find_many_batch_size.max(1);
        for (type_key, pending) in batches {
            let model = state.model(&type_key)?;
            let pending: Vec<(ClientId, RecordId)> = pending.into_iter().collect();
            for chunk in pending.chunks(batch_size) {
                for (client_id, _) in chunk {
                    state.transition(*client_id, LifecycleEvent::LoadingData)?;
                }
                let batch = self.fetch_batch(Arc::clone(&model), chunk.to_vec(), owner.clone());
                for (client_id, _) in chunk {
                    let client_id = *client_id;
                    let store = self.clone();
                    let batch = batch.clone();
                    let wait = async move {
                        batch.await?;
                        store.loaded(client_id)
                    }
                    .boxed()
                    .shared();
                    state.pending_finds.insert(client_id, wait);
                }
            }
        }

        members
            .iter()
            .map(|client_id| match state.pending_finds.get(client_id) {
                Some(pending) => Ok(pending.clone()),
                None => {
                    let record = state.reference(*client_id)?;
                    Ok(ready(Ok(record)).boxed().shared())
                }
            })
            .collect()
    }

    fn fetch_batch(
        &self,
        model: Arc<ModelDescriptor>,
        members: Vec<(ClientId, RecordId)>,
        owner: Option<RecordSnapshot>,
    ) -> SharedLoad {
        let store = self.clone();
        async move {
            let ids: Vec<RecordId> = members.iter().map(|(_, id)| id.clone()).collect();
            debug!("find_many {} ({} ids)", model.type_key, ids.len());
            let result = store
                .inner
                .adapter
                .find_many(&store, &model, &ids, owner.as_ref())
                .await;
            store.mutate(|state| {
                for (client_id, _) in &members {
                    state.pending_finds.remove(client_id);
                }
                let outcome = match result {
                    Ok(document) => state.push_document(&model.type_key, document).map(|_| ()),
                    Err(e) => Err(e.into()),
                };
                for (client_id, _) in &members {
                    not_found_unless_loaded(state, *client_id)?;
                }
                outcome
            })
        }
        .boxed()
        .shared()
    }

    /// The record, provided a fetch actually loaded it.
    fn loaded(&self, client_id: ClientId) -> Result<RecordRef> {
        self.read(|state| {
            let record = state.map.get(client_id)?;
            if record.live && record.flags().is_loaded {
                return Ok(RecordRef::new(client_id, record.type_key.clone()));
            }
            Err(StoreError::RecordNotFound {
                type_key: record.type_key.clone(),
                id: record.id.clone().unwrap_or_else(|| RecordId::new("")),
            })
        })
    }
}

/// A placeholder still loading after its fetch settled was not found.
fn not_found_unless_loaded(state: &mut StoreState, client_id: ClientId) -> Result<()> {
    if state.map.get(client_id)?.state == RecordState::Loading {
        state.transition(client_id, LifecycleEvent::NotFound)?;
    }
    Ok(())
}
