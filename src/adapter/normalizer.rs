//! Raw JSON <-> normalized record data.

use super::Document;
use crate::error::{Result, StoreError};
use crate::schema::{ModelDescriptor, RelationshipDescriptor, RelationshipKind, TypeRegistry};
use crate::types::{RecordData, RecordId, RecordSnapshot, RelationshipData, ResourceRef, TypeKey};
use serde_json::{json, Map, Value};
use std::collections::HashSet;

/// Resolves a related record to its snapshot while serializing.
pub type RelatedLookup<'a> = &'a dyn Fn(&ResourceRef) -> Option<RecordSnapshot>;

/// Normalization boundary.
pub trait Normalizer: Send + Sync {
    /// Normalize one raw record of `model`. Records discovered inside it
    /// (embedded children) are appended to `included`.
    fn normalize(
        &self,
        registry: &TypeRegistry,
        model: &ModelDescriptor,
        raw: &Value,
        included: &mut Vec<RecordData>,
    ) -> Result<RecordData>;

    /// Serialize a snapshot into a raw payload.
    fn serialize(
        &self,
        registry: &TypeRegistry,
        record: &RecordSnapshot,
        related: RelatedLookup<'_>,
    ) -> Result<Value>;

    /// Normalize a whole payload: a record, an array of records, or an
    /// envelope `{ "data": .., "included": [..], "meta": .. }` whose included
    /// records carry a `"type"`.
    fn normalize_payload(
        &self,
        registry: &TypeRegistry,
        model: &ModelDescriptor,
        raw: &Value,
    ) -> Result<Document<Vec<RecordData>>> {
        let mut included = Vec::new();
        let (data, sideloads, meta) = match raw {
            Value::Object(object) if object.contains_key("data") => (
                &object["data"],
                object.get("included"),
                object.get("meta").cloned(),
            ),
            other => (other, None, None),
        };

        let data = match data {
            Value::Array(items) => items
                .iter()
                .map(|item| self.normalize(registry, model, item, &mut included))
                .collect::<Result<Vec<_>>>()?,
            Value::Null => Vec::new(),
            item => vec![self.normalize(registry, model, item, &mut included)?],
        };

        if let Some(Value::Array(sideloads)) = sideloads {
            for item in sideloads {
                let type_key = item
                    .get("type")
                    .and_then(Value::as_str)
                    .map(TypeKey::from)
                    .ok_or_else(|| {
                        StoreError::Serialization("included record without a type".to_string())
                    })?;
                let sideload_model = registry.model(&type_key)?;
                let mut record = self.normalize(registry, sideload_model, item, &mut included)?;
                record.type_key = Some(type_key);
                included.push(record);
            }
        }

        Ok(Document {
            data,
            included,
            meta,
        })
    }
}

/// Plain JSON objects keyed by attribute and relationship payload keys.
///
/// - the id is read from the model's primary key
/// - belongs-to values are an id, `null`, or `{ "id", "type" }`; a
///   `<key>Type` sibling types a polymorphic id
/// - has-many values are arrays of the same
/// - a `links` object maps relationship keys to links
#[derive(Clone, Debug, Default)]
pub struct JsonNormalizer;

impl JsonNormalizer {
    pub fn new() -> Self {
        JsonNormalizer
    }

    fn reference(
        &self,
        registry: &TypeRegistry,
        relationship: &RelationshipDescriptor,
        value: &Value,
        type_hint: Option<&str>,
    ) -> Result<ResourceRef> {
        let (id, type_key) = match value {
            Value::Object(object) => {
                let id = object.get("id").and_then(RecordId::from_json);
                let type_key = object.get("type").and_then(Value::as_str);
                (id, type_key.or(type_hint))
            }
            scalar => (RecordId::from_json(scalar), type_hint),
        };
        let id = id.ok_or_else(|| {
            StoreError::Serialization(format!(
                "{}.{}: expected an id, got {}",
                relationship.owner, relationship.name, value
            ))
        })?;
        let type_key = match type_key {
            Some(type_key) => {
                let type_key = TypeKey::from(type_key);
                registry.model(&type_key)?;
                Some(type_key)
            }
            None => None,
        };
        Ok(ResourceRef { id, type_key })
    }
}

impl Normalizer for JsonNormalizer {
    fn normalize(
        &self,
        registry: &TypeRegistry,
        model: &ModelDescriptor,
        raw: &Value,
        _included: &mut Vec<RecordData>,
    ) -> Result<RecordData> {
        let object = raw.as_object().ok_or_else(|| {
            StoreError::Serialization(format!("{} payload is not an object: {}", model.type_key, raw))
        })?;
        let id = object
            .get(&model.primary_key)
            .and_then(RecordId::from_json)
            .ok_or_else(|| {
                StoreError::Serialization(format!(
                    "{} payload has no `{}`",
                    model.type_key, model.primary_key
                ))
            })?;

        let mut data = RecordData::new(id);
        if let Some(type_key) = object.get("type").and_then(Value::as_str) {
            if type_key != model.type_key.as_str() && registry.get(type_key).is_some() {
                data.type_key = Some(TypeKey::from(type_key));
            }
        }

        for attribute in model.attributes.values() {
            if let Some(value) = object.get(attribute.payload_key()) {
                data.attributes
                    .insert(attribute.name.clone(), attribute.kind.coerce(value.clone()));
            }
        }

        for relationship in model.relationships.values() {
            let Some(value) = object.get(&relationship.key) else {
                continue;
            };
            let type_hint = object
                .get(&format!("{}Type", relationship.key))
                .and_then(Value::as_str);
            let relationship_data = match (relationship.kind, value) {
                (RelationshipKind::BelongsTo, Value::Null) => RelationshipData::One(None),
                (RelationshipKind::BelongsTo, value) => RelationshipData::One(Some(
                    self.reference(registry, relationship, value, type_hint)?,
                )),
                (RelationshipKind::HasMany, Value::Null) => RelationshipData::Many(Vec::new()),
                (RelationshipKind::HasMany, Value::Array(items)) => RelationshipData::Many(
                    items
                        .iter()
                        .map(|item| self.reference(registry, relationship, item, None))
                        .collect::<Result<Vec<_>>>()?,
                ),
                (RelationshipKind::HasMany, other) => {
                    return Err(StoreError::Serialization(format!(
                        "{}.{}: expected an array, got {}",
                        model.type_key, relationship.name, other
                    )))
                }
            };
            data.relationships
                .insert(relationship.name.clone(), relationship_data);
        }

        if let Some(Value::Object(links)) = object.get("links") {
            for relationship in model.relationships.values() {
                if let Some(link) = links.get(&relationship.key).and_then(Value::as_str) {
                    data.links.insert(relationship.name.clone(), link.to_string());
                }
            }
        }

        Ok(data)
    }

    fn serialize(
        &self,
        registry: &TypeRegistry,
        record: &RecordSnapshot,
        _related: RelatedLookup<'_>,
    ) -> Result<Value> {
        let model = registry.model(&record.type_key)?;
        let mut object = Map::new();

        if let Some(id) = &record.id {
            object.insert(model.primary_key.clone(), Value::String(id.to_string()));
        }

        for attribute in model.attributes.values() {
            let value = record
                .attributes
                .get(&attribute.name)
                .cloned()
                .unwrap_or(Value::Null);
            object.insert(attribute.payload_key().to_string(), value);
        }

        for relationship in model.relationships.values() {
            match relationship.kind {
                RelationshipKind::BelongsTo => {
                    let target = record.belongs_to.get(&relationship.name).cloned().flatten();
                    object.insert(
                        relationship.key.clone(),
                        target
                            .as_ref()
                            .map(|target| Value::String(target.id.to_string()))
                            .unwrap_or(Value::Null),
                    );
                    if relationship.polymorphic {
                        let type_key = target
                            .and_then(|target| target.type_key)
                            .map(|type_key| Value::String(type_key.to_string()))
                            .unwrap_or(Value::Null);
                        object.insert(format!("{}Type", relationship.key), type_key);
                    }
                }
                // The belongs-to side carries one-to-many edges.
                RelationshipKind::HasMany if relationship.is_owner() => {
                    let members = record
                        .has_many
                        .get(&relationship.name)
                        .cloned()
                        .unwrap_or_default();
                    let members = members
                        .into_iter()
                        .map(|member| match (relationship.polymorphic, member.type_key) {
                            (true, Some(type_key)) => json!({
                                "id": member.id.to_string(),
                                "type": type_key.to_string(),
                            }),
                            _ => Value::String(member.id.to_string()),
                        })
                        .collect();
                    object.insert(relationship.key.clone(), Value::Array(members));
                }
                RelationshipKind::HasMany => {}
            }
        }

        Ok(Value::Object(object))
    }
}

/// Decorator that reads and writes selected relationships as embedded
/// objects instead of ids.
///
/// On normalize, embedded children are normalized with the target model,
/// appended to the sideloaded records and replaced by their ids. On
/// serialize, ids are replaced by the children's full payloads.
pub struct EmbeddedRecords<N> {
    inner: N,
    embedded: HashSet<(TypeKey, String)>,
}

impl<N: Normalizer> EmbeddedRecords<N> {
    pub fn new(inner: N) -> Self {
        Self {
            inner,
            embedded: HashSet::new(),
        }
    }

    /// Embed `relationship` of `type_key` (and of its subtypes).
    pub fn embed(mut self, type_key: impl Into<TypeKey>, relationship: impl Into<String>) -> Self {
        self.embedded.insert((type_key.into(), relationship.into()));
        self
    }

    fn is_embedded(&self, model: &ModelDescriptor, relationship: &str) -> bool {
        model
            .lineage
            .iter()
            .any(|type_key| self.embedded.contains(&(type_key.clone(), relationship.to_string())))
    }

    fn extract(
        &self,
        registry: &TypeRegistry,
        relationship: &RelationshipDescriptor,
        item: &Value,
        included: &mut Vec<RecordData>,
    ) -> Result<Value> {
        if !item.is_object() {
            return Ok(item.clone());
        }
        let type_key = item
            .get("type")
            .and_then(Value::as_str)
            .filter(|type_key| registry.get(type_key).is_some())
            .map(TypeKey::from)
            .unwrap_or_else(|| relationship.target.clone());
        let model = registry.model(&type_key)?;

        let mut child = self.normalize(registry, model, item, included)?;
        let reference = if relationship.polymorphic {
            json!({ "id": child.id.to_string(), "type": type_key.to_string() })
        } else {
            Value::String(child.id.to_string())
        };
        child.type_key = Some(type_key);
        included.push(child);
        Ok(reference)
    }
}

impl<N: Normalizer> Normalizer for EmbeddedRecords<N> {
    fn normalize(
        &self,
        registry: &TypeRegistry,
        model: &ModelDescriptor,
        raw: &Value,
        included: &mut Vec<RecordData>,
    ) -> Result<RecordData> {
        let Value::Object(object) = raw else {
            return self.inner.normalize(registry, model, raw, included);
        };
        let mut object = object.clone();

        for relationship in model.relationships.values() {
            if !self.is_embedded(model, &relationship.name) {
                continue;
            }
            let Some(value) = object.get(&relationship.key).cloned() else {
                continue;
            };
            let replaced = match value {
                Value::Array(items) => Value::Array(
                    items
                        .iter()
                        .map(|item| self.extract(registry, relationship, item, included))
                        .collect::<Result<Vec<_>>>()?,
                ),
                Value::Object(_) => self.extract(registry, relationship, &value, included)?,
                other => other,
            };
            object.insert(relationship.key.clone(), replaced);
        }

        self.inner
            .normalize(registry, model, &Value::Object(object), included)
    }

    fn serialize(
        &self,
        registry: &TypeRegistry,
        record: &RecordSnapshot,
        related: RelatedLookup<'_>,
    ) -> Result<Value> {
        let mut value = self.inner.serialize(registry, record, related)?;
        let model = registry.model(&record.type_key)?;

        if let Value::Object(object) = &mut value {
            for relationship in model.relationships.values() {
                if !self.is_embedded(model, &relationship.name) {
                    continue;
                }
                let members: Vec<ResourceRef> = match relationship.kind {
                    RelationshipKind::BelongsTo => record
                        .belongs_to
                        .get(&relationship.name)
                        .cloned()
                        .flatten()
                        .into_iter()
                        .collect(),
                    RelationshipKind::HasMany => record
                        .has_many
                        .get(&relationship.name)
                        .cloned()
                        .unwrap_or_default(),
                };
                let children = members
                    .iter()
                    .filter_map(|member| related(member))
                    .map(|child| self.serialize(registry, &child, related))
                    .collect::<Result<Vec<_>>>()?;
                let embedded = match relationship.kind {
                    RelationshipKind::BelongsTo => {
                        children.into_iter().next().unwrap_or(Value::Null)
                    }
                    RelationshipKind::HasMany => Value::Array(children),
                };
                object.insert(relationship.key.clone(), embedded);
            }
        }

        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AttrKind, AttributeSchema, ModelSchema, RelationshipSchema};
    use crate::types::RecordRef;
    use crate::types::ClientId;
    use indexmap::IndexMap;

    fn registry() -> TypeRegistry {
        TypeRegistry::builder()
            .model(
                ModelSchema::new("person")
                    .primary_key("_id")
                    .attribute(AttributeSchema::new("first_name", AttrKind::String).key("firstName"))
                    .attr("age", AttrKind::Number)
                    .belongs_to("group", "group")
                    .has_many("tags", "tag")
                    .relationship(RelationshipSchema::belongs_to("favorite", "message").polymorphic()),
            )
            .model(ModelSchema::new("group").has_many("people", "person"))
            .model(ModelSchema::new("tag"))
            .model(ModelSchema::new("message").relationship(
                RelationshipSchema::has_many("fans", "person").no_inverse(),
            ))
            .model(ModelSchema::new("post").extends("message"))
            .model(
                ModelSchema::new("post_with_comments")
                    .attr("title", AttrKind::String)
                    .has_many("comments", "comment"),
            )
            .model(
                ModelSchema::new("comment")
                    .attr("body", AttrKind::String)
                    .belongs_to("post", "post_with_comments"),
            )
            .build()
            .unwrap()
    }

    fn snapshot(type_key: &str, id: &str) -> RecordSnapshot {
        RecordSnapshot {
            record: RecordRef::new(ClientId(1), type_key.into()),
            type_key: type_key.into(),
            id: Some(id.into()),
            attributes: Map::new(),
            belongs_to: IndexMap::new(),
            has_many: IndexMap::new(),
        }
    }

    #[test]
    fn test_normalize_keys_and_relationships() {
        let registry = registry();
        let model = registry.get("person").unwrap();
        let raw = json!({
            "_id": 1,
            "firstName": "Tom",
            "age": "30",
            "group": 5,
            "tags": [1, "2"],
            "favorite": 3,
            "favoriteType": "post",
            "links": { "tags": "/people/1/tags" }
        });

        let data = JsonNormalizer::new()
            .normalize(&registry, model, &raw, &mut Vec::new())
            .unwrap();

        assert_eq!(data.id.as_str(), "1");
        assert_eq!(data.attributes["first_name"], json!("Tom"));
        assert_eq!(data.attributes["age"], json!(30.0));
        assert_eq!(
            data.relationships["group"],
            RelationshipData::One(Some(ResourceRef::new("5")))
        );
        assert_eq!(
            data.relationships["tags"],
            RelationshipData::Many(vec![ResourceRef::new("1"), ResourceRef::new("2")])
        );
        assert_eq!(
            data.relationships["favorite"],
            RelationshipData::One(Some(ResourceRef::typed("post", "3")))
        );
        assert_eq!(data.links["tags"], "/people/1/tags");
    }

    #[test]
    fn test_missing_primary_key_is_an_error() {
        let registry = registry();
        let model = registry.get("person").unwrap();
        let result = JsonNormalizer::new().normalize(&registry, model, &json!({"id": 1}), &mut Vec::new());
        assert!(matches!(result, Err(StoreError::Serialization(_))));
    }

    #[test]
    fn test_normalize_payload_envelope() {
        let registry = registry();
        let model = registry.get("person").unwrap();
        let raw = json!({
            "data": [{ "_id": "1", "firstName": "Tom" }],
            "included": [{ "type": "group", "id": "5" }],
            "meta": { "total": 1 }
        });

        let document = JsonNormalizer::new()
            .normalize_payload(&registry, model, &raw)
            .unwrap();
        assert_eq!(document.data.len(), 1);
        assert_eq!(document.included.len(), 1);
        assert_eq!(document.included[0].type_key, Some(TypeKey::from("group")));
        assert_eq!(document.meta, Some(json!({"total": 1})));
    }

    #[test]
    fn test_serialize() {
        let registry = registry();
        let mut record = snapshot("person", "1");
        record.attributes.insert("first_name".into(), json!("Tom"));
        record.belongs_to.insert("group".into(), Some(ResourceRef::typed("group", "5")));
        record.belongs_to.insert("favorite".into(), Some(ResourceRef::typed("post", "3")));
        record.has_many.insert("tags".into(), vec![ResourceRef::typed("tag", "1")]);

        let value = JsonNormalizer::new()
            .serialize(&registry, &record, &|_| None)
            .unwrap();
        assert_eq!(value["_id"], json!("1"));
        assert_eq!(value["firstName"], json!("Tom"));
        assert_eq!(value["age"], Value::Null);
        assert_eq!(value["group"], json!("5"));
        assert_eq!(value["favorite"], json!("3"));
        assert_eq!(value["favoriteType"], json!("post"));
        assert_eq!(value["tags"], json!(["1"]));
    }

    #[test]
    fn test_serialize_skips_has_many_with_belongs_to_inverse() {
        let registry = registry();
        let mut record = snapshot("group", "5");
        record.has_many.insert("people".into(), vec![ResourceRef::typed("person", "1")]);
        let value = JsonNormalizer::new()
            .serialize(&registry, &record, &|_| None)
            .unwrap();
        assert!(value.get("people").is_none());
    }

    #[test]
    fn test_embedded_records_extract_and_embed() {
        let registry = registry();
        let normalizer = EmbeddedRecords::new(JsonNormalizer::new()).embed("post_with_comments", "comments");
        let model = registry.get("post_with_comments").unwrap();
        let raw = json!({
            "id": "1",
            "title": "Embedded",
            "comments": [
                { "id": "10", "body": "first" },
                { "id": "11", "body": "second" }
            ]
        });

        let mut included = Vec::new();
        let data = normalizer
            .normalize(&registry, model, &raw, &mut included)
            .unwrap();
        assert_eq!(
            data.relationships["comments"],
            RelationshipData::Many(vec![ResourceRef::new("10"), ResourceRef::new("11")])
        );
        assert_eq!(included.len(), 2);
        assert_eq!(included[0].type_key, Some(TypeKey::from("comment")));
        assert_eq!(included[1].attributes["body"], json!("second"));

        let mut post = snapshot("post_with_comments", "1");
        post.has_many.insert(
            "comments".into(),
            vec![ResourceRef::typed("comment", "10")],
        );
        let lookup = |member: &ResourceRef| {
            let mut child = snapshot("comment", member.id.as_str());
            child.attributes.insert("body".into(), json!("first"));
            Some(child)
        };
        let value = normalizer.serialize(&registry, &post, &lookup).unwrap();
        assert_eq!(value["comments"][0]["body"], json!("first"));
        assert_eq!(value["comments"][0]["id"], json!("10"));
    }
}
