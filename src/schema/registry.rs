//! Type registry: model schemas resolved into typed descriptors.

use super::model::{AttributeSchema, InverseSpec, ModelSchema, RelationshipKind, RelationshipSchema};
use crate::error::{Result, StoreError};
use crate::types::TypeKey;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

/// A relationship after inheritance and inverse resolution.
#[derive(Clone, Debug, PartialEq)]
pub struct RelationshipDescriptor {
    pub name: String,
    pub kind: RelationshipKind,
    /// Type the relationship is read from (the concrete model).
    pub owner: TypeKey,
    pub target: TypeKey,
    pub is_async: bool,
    pub polymorphic: bool,
    /// Name of the inverse relationship on the target type.
    pub inverse: Option<String>,
    pub inverse_kind: Option<RelationshipKind>,
    pub key: String,
    /// Whether the declaration carried `inverse: null`.
    pub(crate) inverse_disabled: bool,
    pub(crate) inverse_named: Option<String>,
}

impl RelationshipDescriptor {
    pub fn is_belongs_to(&self) -> bool {
        self.kind == RelationshipKind::BelongsTo
    }

    pub fn is_has_many(&self) -> bool {
        self.kind == RelationshipKind::HasMany
    }

    /// The side whose changes make its record dirty: every belongs-to, and
    /// a has-many whose inverse is not a belongs-to.
    pub fn is_owner(&self) -> bool {
        self.is_belongs_to() || self.inverse_kind != Some(RelationshipKind::BelongsTo)
    }
}

/// A model type with inherited members flattened in.
#[derive(Clone, Debug)]
pub struct ModelDescriptor {
    pub type_key: TypeKey,
    /// This type first, then its parents up to the root.
    pub lineage: Vec<TypeKey>,
    pub primary_key: String,
    pub attributes: IndexMap<String, AttributeSchema>,
    pub relationships: IndexMap<String, RelationshipDescriptor>,
}

impl ModelDescriptor {
    pub fn attribute(&self, name: &str) -> Result<&AttributeSchema> {
        self.attributes
            .get(name)
            .ok_or_else(|| StoreError::UnknownAttribute {
                type_key: self.type_key.clone(),
                name: name.to_string(),
            })
    }

    pub fn relationship(&self, name: &str) -> Result<&RelationshipDescriptor> {
        self.relationships
            .get(name)
            .ok_or_else(|| StoreError::UnknownRelationship {
                type_key: self.type_key.clone(),
                name: name.to_string(),
            })
    }

    /// True if this type is `base` or inherits from it.
    pub fn is_a(&self, base: &TypeKey) -> bool {
        self.lineage.contains(base)
    }
}

/// Per-store mapping from type name to descriptor.
#[derive(Clone, Debug, Default)]
pub struct TypeRegistry {
    models: IndexMap<TypeKey, Arc<ModelDescriptor>>,
}

impl TypeRegistry {
    pub fn builder() -> TypeRegistryBuilder {
        TypeRegistryBuilder::default()
    }

    pub fn model(&self, type_key: &TypeKey) -> Result<&Arc<ModelDescriptor>> {
        self.models
            .get(type_key)
            .ok_or_else(|| StoreError::UnknownType(type_key.clone()))
    }

    pub fn get(&self, type_key: &str) -> Option<&Arc<ModelDescriptor>> {
        self.models.get(&TypeKey::new(type_key))
    }

    pub fn relationship(&self, type_key: &TypeKey, name: &str) -> Result<&RelationshipDescriptor> {
        self.model(type_key)?.relationship(name)
    }

    /// The inverse descriptor of `relationship`, read on `member_type`.
    pub fn inverse_of(
        &self,
        relationship: &RelationshipDescriptor,
        member_type: &TypeKey,
    ) -> Option<&RelationshipDescriptor> {
        let inverse = relationship.inverse.as_deref()?;
        self.models.get(member_type)?.relationships.get(inverse)
    }

    pub fn is_a(&self, type_key: &TypeKey, base: &TypeKey) -> bool {
        self.models
            .get(type_key)
            .map(|model| model.is_a(base))
            .unwrap_or(false)
    }

    /// Whether a record of `member_type` may be stored in `relationship`.
    pub fn accepts(&self, relationship: &RelationshipDescriptor, member_type: &TypeKey) -> bool {
        if relationship.polymorphic {
            self.is_a(member_type, &relationship.target)
        } else {
            member_type == &relationship.target
        }
    }

    pub fn types(&self) -> impl Iterator<Item = &TypeKey> {
        self.models.keys()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// Collects schemas; `build` validates them and resolves inverses once.
#[derive(Default)]
pub struct TypeRegistryBuilder {
    schemas: IndexMap<TypeKey, ModelSchema>,
}

impl TypeRegistryBuilder {
    pub fn model(mut self, schema: ModelSchema) -> Self {
        self.schemas.insert(schema.type_key.clone(), schema);
        self
    }

    pub fn build(self) -> Result<TypeRegistry> {
        let mut flattened: IndexMap<TypeKey, ModelDescriptor> = IndexMap::new();
        for type_key in self.schemas.keys() {
            let descriptor = self.flatten(type_key)?;
            flattened.insert(type_key.clone(), descriptor);
        }

        for model in flattened.values() {
            for relationship in model.relationships.values() {
                if !flattened.contains_key(&relationship.target) {
                    return Err(StoreError::Schema(format!(
                        "{}.{} targets unknown type {}",
                        model.type_key, relationship.name, relationship.target
                    )));
                }
            }
        }

        let mut resolved = Vec::new();
        for (type_key, model) in &flattened {
            for relationship in model.relationships.values() {
                let inverse = resolve_inverse(&flattened, model, relationship)?;
                resolved.push((type_key.clone(), relationship.name.clone(), inverse));
            }
        }

        // Keep only pairs that agree from both sides.
        let lookup: HashMap<(TypeKey, String), Option<String>> = resolved
            .iter()
            .map(|(type_key, name, inverse)| ((type_key.clone(), name.clone()), inverse.clone()))
            .collect();
        for (type_key, name, inverse) in resolved.iter_mut() {
            if let Some(inverse_name) = inverse.clone() {
                let target = flattened[&*type_key].relationships[&*name].target.clone();
                let back = lookup.get(&(target, inverse_name)).cloned().flatten();
                if back.as_deref() != Some(name.as_str()) {
                    debug!(
                        "Dropping one-sided inverse {}.{} -> {}",
                        type_key,
                        name,
                        inverse.as_deref().unwrap_or_default()
                    );
                    *inverse = None;
                }
            }
        }

        for (type_key, name, inverse) in resolved {
            let inverse_kind = inverse.as_ref().and_then(|inverse| {
                let target = &flattened[&type_key].relationships[&name].target;
                flattened[target].relationships.get(inverse).map(|r| r.kind)
            });
            if let Some(model) = flattened.get_mut(&type_key) {
                if let Some(relationship) = model.relationships.get_mut(&name) {
                    relationship.inverse = inverse;
                    relationship.inverse_kind = inverse_kind;
                }
            }
        }

        Ok(TypeRegistry {
            models: flattened
                .into_iter()
                .map(|(key, model)| (key, Arc::new(model)))
                .collect(),
        })
    }

    fn lineage(&self, type_key: &TypeKey) -> Result<Vec<&ModelSchema>> {
        let mut lineage = Vec::new();
        let mut seen = HashSet::new();
        let mut next = Some(type_key.clone());
        while let Some(key) = next {
            if !seen.insert(key.clone()) {
                return Err(StoreError::Schema(format!(
                    "inheritance cycle through {}",
                    key
                )));
            }
            let schema = self.schemas.get(&key).ok_or_else(|| {
                StoreError::Schema(format!("{} extends unknown type {}", type_key, key))
            })?;
            next = schema.parent.clone();
            lineage.push(schema);
        }
        Ok(lineage)
    }

    fn flatten(&self, type_key: &TypeKey) -> Result<ModelDescriptor> {
        let lineage = self.lineage(type_key)?;
        let mut attributes = IndexMap::new();
        let mut relationships = IndexMap::new();
        let mut primary_key = None;

        // Root first so subtypes can override inherited members.
        for schema in lineage.iter().rev() {
            for attribute in &schema.attributes {
                attributes.insert(attribute.name.clone(), attribute.clone());
            }
            for relationship in &schema.relationships {
                relationships.insert(
                    relationship.name.clone(),
                    descriptor_for(type_key, relationship),
                );
            }
            if schema.primary_key.is_some() {
                primary_key = schema.primary_key.clone();
            }
        }

        Ok(ModelDescriptor {
            type_key: type_key.clone(),
            lineage: lineage.iter().map(|s| s.type_key.clone()).collect(),
            primary_key: primary_key.unwrap_or_else(|| "id".to_string()),
            attributes,
            relationships,
        })
    }
}

fn descriptor_for(owner: &TypeKey, schema: &RelationshipSchema) -> RelationshipDescriptor {
    let (inverse_disabled, inverse_named) = match &schema.inverse {
        InverseSpec::Auto => (false, None),
        InverseSpec::Named(name) => (false, Some(name.clone())),
        InverseSpec::None => (true, None),
    };
    RelationshipDescriptor {
        name: schema.name.clone(),
        kind: schema.kind,
        owner: owner.clone(),
        target: schema.target.clone(),
        is_async: schema.is_async,
        polymorphic: schema.polymorphic,
        inverse: None,
        inverse_kind: None,
        key: schema.key.clone().unwrap_or_else(|| schema.name.clone()),
        inverse_disabled,
        inverse_named,
    }
}

/// Find the relationship on the target type that mirrors `relationship`.
///
/// An explicit name always wins. Otherwise exactly one candidate on the
/// target must point back at this type (or one of its parents); zero or
/// several candidates leave the relationship without an inverse.
fn resolve_inverse(
    models: &IndexMap<TypeKey, ModelDescriptor>,
    model: &ModelDescriptor,
    relationship: &RelationshipDescriptor,
) -> Result<Option<String>> {
    if relationship.inverse_disabled {
        return Ok(None);
    }
    let target = &models[&relationship.target];

    if let Some(name) = &relationship.inverse_named {
        return match target.relationships.get(name) {
            Some(_) => Ok(Some(name.clone())),
            None => Err(StoreError::Schema(format!(
                "{}.{} names inverse {}.{} which does not exist",
                model.type_key, relationship.name, target.type_key, name
            ))),
        };
    }

    let candidates: Vec<&RelationshipDescriptor> = target
        .relationships
        .values()
        .filter(|candidate| !candidate.inverse_disabled)
        .filter(|candidate| model.is_a(&candidate.target))
        .filter(|candidate| {
            !(target.type_key == model.type_key && candidate.name == relationship.name)
        })
        .filter(|candidate| match &candidate.inverse_named {
            Some(name) => name == &relationship.name,
            None => true,
        })
        .collect();

    let explicit: Vec<&&RelationshipDescriptor> = candidates
        .iter()
        .filter(|candidate| candidate.inverse_named.is_some())
        .collect();
    if explicit.len() == 1 {
        return Ok(Some(explicit[0].name.clone()));
    }

    match candidates.as_slice() {
        [only] => {
            trace!(
                "Resolved inverse {}.{} <-> {}.{}",
                model.type_key,
                relationship.name,
                target.type_key,
                only.name
            );
            Ok(Some(only.name.clone()))
        }
        [] => Ok(None),
        _ => {
            debug!(
                "Ambiguous inverse for {}.{}: {} candidates on {}",
                model.type_key,
                relationship.name,
                candidates.len(),
                target.type_key
            );
            Ok(None)
        }
    }
}
