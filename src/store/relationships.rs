//! Reading and editing relationships through the store.

use super::finders::Lookup;
use super::state::{expect_kind, SharedFind, SharedLoad, StoreState};
use super::Store;
use crate::adapter::Document;
use crate::error::{Result, StoreError};
use crate::records::{Layer, Members};
use crate::relationships::PromiseProxy;
use crate::schema::{RelationshipDescriptor, RelationshipKind};
use crate::subscriptions::StoreEvent;
use crate::types::{ClientId, RecordRef, RecordSnapshot};
use futures::future::{join_all, BoxFuture, FutureExt};
use tracing::debug;

/// What has to happen before a relationship can be read.
enum Fetch {
    Ready,
    Link(SharedLoad),
    Members(Vec<SharedFind>),
}

impl Store {
    pub fn set_belongs_to(
        &self,
        record: &RecordRef,
        name: &str,
        target: Option<&RecordRef>,
    ) -> Result<()> {
        self.edit(record, name, RelationshipKind::BelongsTo, |state, owner, descriptor| {
            let target = target
                .map(|target| state.check_member(descriptor, target))
                .transpose()?;
            state
                .graph()
                .set_belongs_to(owner, descriptor, target, Layer::Current)
        })
    }

    pub fn add_to_has_many(&self, record: &RecordRef, name: &str, member: &RecordRef) -> Result<()> {
        self.edit(record, name, RelationshipKind::HasMany, |state, owner, descriptor| {
            let member = state.check_member(descriptor, member)?;
            state
                .graph()
                .add_has_many(owner, descriptor, member, Layer::Current)
        })
    }

    pub fn remove_from_has_many(
        &self,
        record: &RecordRef,
        name: &str,
        member: &RecordRef,
    ) -> Result<()> {
        self.edit(record, name, RelationshipKind::HasMany, |state, owner, descriptor| {
            state
                .graph()
                .remove_has_many(owner, descriptor, member.client_id(), Layer::Current)
        })
    }

    /// Replace a has-many with `members`, in that order.
    pub fn replace_has_many(
        &self,
        record: &RecordRef,
        name: &str,
        members: &[RecordRef],
    ) -> Result<()> {
        self.edit(record, name, RelationshipKind::HasMany, |state, owner, descriptor| {
            let members = members
                .iter()
                .map(|member| state.check_member(descriptor, member))
                .collect::<Result<Vec<_>>>()?;
            state
                .graph()
                .replace_has_many(owner, descriptor, &members, Layer::Current)
        })
    }

    fn edit(
        &self,
        record: &RecordRef,
        name: &str,
        kind: RelationshipKind,
        apply: impl FnOnce(&mut StoreState, ClientId, &RelationshipDescriptor) -> Result<()>,
    ) -> Result<()> {
        let owner = record.client_id();
        self.mutate(|state| {
            let model = state.model_of(owner)?;
            let descriptor = model.relationship(name)?;
            expect_kind(descriptor, kind)?;
            state.editable(owner, "set")?;
            apply(state, owner, descriptor)?;
            state.emit(owner, |record| StoreEvent::RecordChanged {
                record,
                field: name.to_string(),
            })
        })
    }

    /// Current members of a has-many, skipping deleted ones.
    ///
    /// Members that are not loaded yet make a synchronous relationship fail
    /// with an assertion; an async one only yields the loaded members.
    pub fn has_many(&self, record: &RecordRef, name: &str) -> Result<Vec<RecordRef>> {
        self.read(|state| {
            let owner = state.map.get(record.client_id())?;
            let model = state.registry.model(&owner.type_key)?;
            let descriptor = model.relationship(name)?;
            expect_kind(descriptor, RelationshipKind::HasMany)?;

            let members = owner
                .relationship(name)
                .map(|relationship| relationship.current.to_vec())
                .unwrap_or_default();
            let mut loaded = Vec::with_capacity(members.len());
            let mut missing = 0;
            for member in members {
                let member = state.map.get(member)?;
                let flags = member.flags();
                if !member.live || flags.is_deleted {
                    continue;
                }
                if !flags.is_loaded {
                    missing += 1;
                    continue;
                }
                loaded.push(RecordRef::new(member.client_id, member.type_key.clone()));
            }

            if missing > 0 && !descriptor.is_async {
                return Err(StoreError::Assertion(format!(
                    "You looked up the '{}' relationship on {} but {} of the associated records \
                     were not loaded. Load them together with the parent record, or declare \
                     the relationship async",
                    name,
                    owner.describe(),
                    missing
                )));
            }
            Ok(loaded)
        })
    }

    /// Current target of a belongs-to.
    ///
    /// An unloaded target is an assertion on a synchronous relationship and
    /// `None` on an async one.
    pub fn belongs_to(&self, record: &RecordRef, name: &str) -> Result<Option<RecordRef>> {
        self.read(|state| {
            let owner = state.map.get(record.client_id())?;
            let model = state.registry.model(&owner.type_key)?;
            let descriptor = model.relationship(name)?;
            expect_kind(descriptor, RelationshipKind::BelongsTo)?;

            let Some(target) = owner
                .relationship(name)
                .and_then(|relationship| relationship.current.one())
            else {
                return Ok(None);
            };
            let target = state.map.get(target)?;
            if !target.live {
                return Ok(None);
            }
            if !target.flags().is_loaded {
                if descriptor.is_async {
                    return Ok(None);
                }
                return Err(StoreError::Assertion(format!(
                    "You looked up the '{}' relationship on {} but {} was not loaded. Load it \
                     together with the parent record, or declare the relationship async",
                    name,
                    owner.describe(),
                    target.describe()
                )));
            }
            Ok(Some(RecordRef::new(target.client_id, target.type_key.clone())))
        })
    }

    /// Load a has-many and resolve to its members.
    ///
    /// A relationship link that has not been followed yet is fetched through
    /// `find_has_many`; otherwise unloaded members are fetched by id in
    /// `find_many` batches.
    pub fn fetch_has_many(&self, record: &RecordRef, name: &str) -> PromiseProxy<Vec<RecordRef>> {
        let owner = record.client_id();
        let prepared = self.mutate(|state| {
            let descriptor = state.model_of(owner)?.relationship(name)?.clone();
            expect_kind(&descriptor, RelationshipKind::HasMany)?;
            if let Some(load) = self.begin_link_fetch(state, owner, &descriptor)? {
                return Ok(Fetch::Link(load));
            }

            let members: Vec<ClientId> = state
                .map
                .get(owner)?
                .relationship(name)
                .map(|relationship| relationship.current.to_vec())
                .unwrap_or_default()
                .into_iter()
                .filter(|member| {
                    state
                        .map
                        .get(*member)
                        .map_or(false, |record| record.live && !record.flags().is_deleted)
                })
                .collect();
            let unloaded = members.iter().any(|member| {
                state
                    .map
                    .get(*member)
                    .map_or(false, |record| !record.flags().is_loaded)
            });
            if !unloaded {
                return Ok(Fetch::Ready);
            }
            let snapshot = state.snapshot(owner)?;
            self.begin_find_many(state, &members, Some(snapshot))
                .map(Fetch::Members)
        });
        self.settle(prepared, record, name, Store::has_many)
    }

    /// Load a belongs-to and resolve to its target.
    pub fn fetch_belongs_to(
        &self,
        record: &RecordRef,
        name: &str,
    ) -> PromiseProxy<Option<RecordRef>> {
        let owner = record.client_id();
        let prepared = self.mutate(|state| {
            let descriptor = state.model_of(owner)?.relationship(name)?.clone();
            expect_kind(&descriptor, RelationshipKind::BelongsTo)?;
            if let Some(load) = self.begin_link_fetch(state, owner, &descriptor)? {
                return Ok(Fetch::Link(load));
            }

            let target = state
                .map
                .get(owner)?
                .relationship(name)
                .and_then(|relationship| relationship.current.one());
            let Some(target) = target else {
                return Ok(Fetch::Ready);
            };
            let loaded = {
                let target = state.map.get(target)?;
                !target.live || target.flags().is_loaded
            };
            if loaded {
                return Ok(Fetch::Ready);
            }
            match self.begin_find(state, target)? {
                Lookup::Ready(_) => Ok(Fetch::Ready),
                Lookup::Pending(fetch) => Ok(Fetch::Members(vec![fetch])),
            }
        });
        self.settle(prepared, record, name, Store::belongs_to)
    }

    /// Wrap a prepared fetch in a proxy that re-reads the relationship once
    /// the fetch settles.
    fn settle<T>(
        &self,
        prepared: Result<Fetch>,
        record: &RecordRef,
        name: &str,
        read: fn(&Store, &RecordRef, &str) -> Result<T>,
    ) -> PromiseProxy<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let wait: BoxFuture<'static, Result<()>> = match prepared {
            Err(e) => return PromiseProxy::rejected(e),
            Ok(Fetch::Ready) => {
                return match read(self, record, name) {
                    Ok(value) => PromiseProxy::resolved(value),
                    Err(e) => PromiseProxy::rejected(e),
                }
            }
            Ok(Fetch::Link(load)) => load.boxed(),
            Ok(Fetch::Members(fetches)) => async move {
                join_all(fetches)
                    .await
                    .into_iter()
                    .collect::<Result<Vec<_>>>()
                    .map(|_| ())
            }
            .boxed(),
        };

        let store = self.clone();
        let record = record.clone();
        let name = name.to_string();
        PromiseProxy::new(
            async move {
                wait.await?;
                read(&store, &record, &name)
            }
            .boxed(),
        )
    }

    /// Start, or join, the link fetch of a relationship whose link has not
    /// been followed yet.
    fn begin_link_fetch(
        &self,
        state: &mut StoreState,
        owner: ClientId,
        descriptor: &RelationshipDescriptor,
    ) -> Result<Option<SharedLoad>> {
        let key = (owner, descriptor.name.clone());
        if let Some(pending) = state.pending_links.get(&key) {
            return Ok(Some(pending.clone()));
        }
        let link = match state.map.get(owner)?.relationship(&descriptor.name) {
            Some(relationship) => match &relationship.link {
                Some(link) if relationship.link_loaded.as_ref() != Some(link) => link.clone(),
                _ => return Ok(None),
            },
            None => return Ok(None),
        };

        let snapshot = state.snapshot(owner)?;
        let load = self
            .fetch_link(snapshot, descriptor.clone(), link)
            .shared();
        state.pending_links.insert(key, load.clone());
        Ok(Some(load))
    }

    fn fetch_link(
        &self,
        owner: RecordSnapshot,
        descriptor: RelationshipDescriptor,
        link: String,
    ) -> BoxFuture<'static, Result<()>> {
        let store = self.clone();
        async move {
            let client_id = owner.record.client_id();
            debug!("Following {}.{} through {}", owner.type_key, descriptor.name, link);
            let adapter = &store.inner.adapter;
            let result = match descriptor.kind {
                RelationshipKind::HasMany => {
                    adapter
                        .find_has_many(&store, &owner, &link, &descriptor)
                        .await
                }
                RelationshipKind::BelongsTo => adapter
                    .find_belongs_to(&store, &owner, &link, &descriptor)
                    .await
                    .map(|document| Document {
                        data: document.data.into_iter().collect(),
                        included: document.included,
                        meta: document.meta,
                    }),
            };

            store.mutate(|state| {
                state
                    .pending_links
                    .remove(&(client_id, descriptor.name.clone()));
                let pushed = state.push_document(&descriptor.target, result?)?;
                if !state.map.get(client_id)?.live {
                    return Ok(());
                }
                for member in &pushed {
                    let member = state.reference(*member)?;
                    state.check_member(&descriptor, &member)?;
                }
                let members = match descriptor.kind {
                    RelationshipKind::HasMany => Members::Many(pushed.into_iter().collect()),
                    RelationshipKind::BelongsTo => Members::One(pushed.first().copied()),
                };
                state.assign_from_server(client_id, &descriptor, &members)?;
                state
                    .map
                    .get_mut(client_id)?
                    .relationship_mut(&descriptor)
                    .link_loaded = Some(link.clone());
                Ok(())
            })
        }
        .boxed()
    }
}
