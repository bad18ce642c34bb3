//! Bidirectional relationship edges over the identity map.

use crate::error::Result;
use crate::records::{IdentityMap, Layer, Members};
use crate::schema::{RelationshipDescriptor, RelationshipKind, TypeRegistry};
use crate::types::ClientId;
use indexmap::IndexSet;
use std::collections::HashMap;

/// Edge editor. Every public operation updates the declared inverse on the
/// other record before returning, so no half-linked state is observable.
pub(crate) struct Graph<'a> {
    registry: &'a TypeRegistry,
    map: &'a mut IdentityMap,
    changed: &'a mut IndexSet<ClientId>,
}

impl<'a> Graph<'a> {
    pub fn new(
        registry: &'a TypeRegistry,
        map: &'a mut IdentityMap,
        changed: &'a mut IndexSet<ClientId>,
    ) -> Self {
        Self {
            registry,
            map,
            changed,
        }
    }

    pub fn set_belongs_to(
        &mut self,
        owner: ClientId,
        relationship: &RelationshipDescriptor,
        target: Option<ClientId>,
        layer: Layer,
    ) -> Result<()> {
        let previous = self.write_one(owner, relationship, target, layer)?;
        if previous == target {
            return Ok(());
        }
        if let Some(previous) = previous {
            self.unlink_inverse(owner, relationship, previous, layer)?;
        }
        if let Some(target) = target {
            self.link_inverse(owner, relationship, target, layer)?;
        }
        Ok(())
    }

    pub fn add_has_many(
        &mut self,
        owner: ClientId,
        relationship: &RelationshipDescriptor,
        member: ClientId,
        layer: Layer,
    ) -> Result<()> {
        if self.insert_many(owner, relationship, member, layer)? {
            self.link_inverse(owner, relationship, member, layer)?;
        }
        Ok(())
    }

    pub fn remove_has_many(
        &mut self,
        owner: ClientId,
        relationship: &RelationshipDescriptor,
        member: ClientId,
        layer: Layer,
    ) -> Result<()> {
        if self.remove_many(owner, relationship, member, layer)? {
            self.unlink_inverse(owner, relationship, member, layer)?;
        }
        Ok(())
    }

    /// Make a has-many hold exactly `members`, in that order.
    pub fn replace_has_many(
        &mut self,
        owner: ClientId,
        relationship: &RelationshipDescriptor,
        members: &[ClientId],
        layer: Layer,
    ) -> Result<()> {
        let existing = self.read(owner, relationship, layer)?.to_vec();
        for member in existing {
            if !members.contains(&member) {
                self.remove_has_many(owner, relationship, member, layer)?;
            }
        }
        for member in members {
            self.add_has_many(owner, relationship, *member, layer)?;
        }

        let record = self.map.get_mut(owner)?;
        let state = record.relationship_mut(relationship);
        let ordered: IndexSet<ClientId> = members.iter().copied().collect();
        if layer.touches_canonical() {
            state.canonical = Members::Many(ordered.clone());
        }
        if layer.touches_current() {
            state.current = Members::Many(ordered);
        }
        self.changed.insert(owner);
        Ok(())
    }

    /// Set one layer of a relationship to `members`, propagating to inverses.
    pub fn assign(
        &mut self,
        owner: ClientId,
        relationship: &RelationshipDescriptor,
        members: &Members,
        layer: Layer,
    ) -> Result<()> {
        match members {
            Members::One(target) => self.set_belongs_to(owner, relationship, *target, layer),
            Members::Many(members) => {
                let members: Vec<ClientId> = members.iter().copied().collect();
                self.replace_has_many(owner, relationship, &members, layer)
            }
        }
    }

    /// Cut every inverse edge pointing at `owner` and clear its own edges.
    pub fn sever(&mut self, owner: ClientId) -> Result<()> {
        let registry = self.registry;
        let record = self.map.get(owner)?;
        let model = registry.model(&record.type_key)?;
        let edges: Vec<(String, IndexSet<ClientId>)> = record
            .relationships
            .iter()
            .map(|(name, state)| (name.clone(), state.all_members()))
            .collect();

        for (name, members) in edges {
            let Some(relationship) = model.relationships.get(&name) else {
                continue;
            };
            for member in members {
                let member_type = self.map.get(member)?.type_key.clone();
                if let Some(inverse) = registry.inverse_of(relationship, &member_type) {
                    self.detach(member, inverse, owner)?;
                }
            }
        }

        self.map.get_mut(owner)?.relationships.clear();
        self.changed.insert(owner);
        Ok(())
    }

    /// Swap records for their replacements (or drop them, for `None`) in
    /// every relationship that has no inverse. Relationships with an inverse
    /// are kept consistent by [`Graph::sever`].
    pub fn repoint(&mut self, replacements: &HashMap<ClientId, Option<ClientId>>) -> Result<()> {
        let registry = self.registry;
        let mut touched = Vec::new();
        for record in self.map.live_mut() {
            let Ok(model) = registry.model(&record.type_key) else {
                continue;
            };
            let client_id = record.client_id;
            for (name, state) in record.relationships.iter_mut() {
                let inverse_less = model
                    .relationships
                    .get(name)
                    .map(|relationship| relationship.inverse.is_none())
                    .unwrap_or(false);
                if !inverse_less {
                    continue;
                }
                let replace = |member: ClientId| replacements.get(&member).copied();
                let mut hit = replace_members(&mut state.canonical, replace);
                hit |= replace_members(&mut state.current, replace);
                if let Some(in_flight) = state.in_flight.as_mut() {
                    hit |= replace_members(in_flight, replace);
                }
                if hit {
                    touched.push(client_id);
                }
            }
        }
        self.changed.extend(touched);
        Ok(())
    }

    fn read(
        &self,
        owner: ClientId,
        relationship: &RelationshipDescriptor,
        layer: Layer,
    ) -> Result<Members> {
        let record = self.map.get(owner)?;
        Ok(match record.relationship(&relationship.name) {
            Some(state) if layer.touches_current() => state.current.clone(),
            Some(state) => state.canonical.clone(),
            None => Members::empty(relationship.kind),
        })
    }

    /// Overwrite a belongs-to. Returns the previous target of the layer read
    /// for propagation (current, unless only canonical is touched).
    fn write_one(
        &mut self,
        owner: ClientId,
        relationship: &RelationshipDescriptor,
        target: Option<ClientId>,
        layer: Layer,
    ) -> Result<Option<ClientId>> {
        let state = self.map.get_mut(owner)?.relationship_mut(relationship);
        let previous = if layer.touches_current() {
            state.current.one()
        } else {
            state.canonical.one()
        };
        if layer.touches_canonical() {
            state.canonical = Members::One(target);
        }
        if layer.touches_current() {
            state.current = Members::One(target);
        }
        self.changed.insert(owner);
        Ok(previous)
    }

    fn insert_many(
        &mut self,
        owner: ClientId,
        relationship: &RelationshipDescriptor,
        member: ClientId,
        layer: Layer,
    ) -> Result<bool> {
        let state = self.map.get_mut(owner)?.relationship_mut(relationship);
        let mut inserted = false;
        if layer.touches_canonical() {
            if let Members::Many(members) = &mut state.canonical {
                inserted |= members.insert(member);
            }
        }
        if layer.touches_current() {
            if let Members::Many(members) = &mut state.current {
                inserted |= members.insert(member);
            }
        }
        if inserted {
            self.changed.insert(owner);
        }
        Ok(inserted)
    }

    fn remove_many(
        &mut self,
        owner: ClientId,
        relationship: &RelationshipDescriptor,
        member: ClientId,
        layer: Layer,
    ) -> Result<bool> {
        let state = self.map.get_mut(owner)?.relationship_mut(relationship);
        let mut removed = false;
        if layer.touches_canonical() {
            if let Members::Many(members) = &mut state.canonical {
                removed |= members.shift_remove(&member);
            }
        }
        if layer.touches_current() {
            if let Members::Many(members) = &mut state.current {
                removed |= members.shift_remove(&member);
            }
        }
        if removed {
            self.changed.insert(owner);
        }
        Ok(removed)
    }

    /// `owner` now points at `member` through `relationship`; make the
    /// inverse on `member` point back.
    fn link_inverse(
        &mut self,
        owner: ClientId,
        relationship: &RelationshipDescriptor,
        member: ClientId,
        layer: Layer,
    ) -> Result<()> {
        let registry = self.registry;
        let member_type = self.map.get(member)?.type_key.clone();
        let Some(inverse) = registry.inverse_of(relationship, &member_type) else {
            return Ok(());
        };

        match inverse.kind {
            RelationshipKind::HasMany => {
                self.insert_many(member, inverse, owner, layer)?;
            }
            RelationshipKind::BelongsTo => {
                let previous = self.write_one(member, inverse, Some(owner), layer)?;
                // `member` moved away from its previous owner.
                if let Some(previous) = previous.filter(|previous| *previous != owner) {
                    let previous_type = self.map.get(previous)?.type_key.clone();
                    let Ok(reverse) = registry.relationship(&previous_type, &relationship.name)
                    else {
                        return Ok(());
                    };
                    match reverse.kind {
                        RelationshipKind::HasMany => {
                            self.remove_many(previous, reverse, member, layer)?;
                        }
                        RelationshipKind::BelongsTo => {
                            if self.read(previous, reverse, layer)?.one() == Some(member) {
                                self.write_one(previous, reverse, None, layer)?;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// `owner` no longer points at `member`; drop the inverse edge.
    fn unlink_inverse(
        &mut self,
        owner: ClientId,
        relationship: &RelationshipDescriptor,
        member: ClientId,
        layer: Layer,
    ) -> Result<()> {
        let registry = self.registry;
        let member_type = self.map.get(member)?.type_key.clone();
        let Some(inverse) = registry.inverse_of(relationship, &member_type) else {
            return Ok(());
        };

        match inverse.kind {
            RelationshipKind::HasMany => {
                self.remove_many(member, inverse, owner, layer)?;
            }
            RelationshipKind::BelongsTo => {
                if self.read(member, inverse, layer)?.one() == Some(owner) {
                    self.write_one(member, inverse, None, layer)?;
                }
            }
        }
        Ok(())
    }

    /// Remove `gone` from every layer of `member`'s relationship.
    fn detach(
        &mut self,
        member: ClientId,
        relationship: &RelationshipDescriptor,
        gone: ClientId,
    ) -> Result<()> {
        let record = self.map.get_mut(member)?;
        if let Some(state) = record.relationships.get_mut(&relationship.name) {
            let drop_gone = |member: ClientId| (member == gone).then_some(None);
            replace_members(&mut state.canonical, drop_gone);
            replace_members(&mut state.current, drop_gone);
            if let Some(in_flight) = state.in_flight.as_mut() {
                replace_members(in_flight, drop_gone);
            }
            self.changed.insert(member);
        }
        Ok(())
    }
}

/// Swap one member for another (or drop it), keeping its position.
/// Rewrite members that `replace` maps to `Some(replacement)`; a `None`
/// replacement drops the member. Returns whether anything was rewritten.
fn replace_members(
    members: &mut Members,
    replace: impl Fn(ClientId) -> Option<Option<ClientId>>,
) -> bool {
    match members {
        Members::One(target) => match target.and_then(&replace) {
            Some(replacement) => {
                *target = replacement;
                true
            }
            None => false,
        },
        Members::Many(set) if set.iter().any(|member| replace(*member).is_some()) => {
            *set = set
                .iter()
                .filter_map(|member| replace(*member).unwrap_or(Some(*member)))
                .collect();
            true
        }
        Members::Many(_) => false,
    }
}
