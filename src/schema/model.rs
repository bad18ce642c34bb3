//! Declarative model definitions.

use crate::types::TypeKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declared scalar kind of an attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrKind {
    String,
    Number,
    Boolean,
    /// ISO-8601 string; stored as-is.
    Date,
    /// No coercion.
    Any,
}

impl AttrKind {
    /// Coerce a raw payload value into this kind. `null` always stays `null`;
    /// values that cannot be coerced are passed through unchanged.
    pub fn coerce(self, value: Value) -> Value {
        match (self, value) {
            (_, Value::Null) => Value::Null,
            (AttrKind::String, Value::Number(n)) => Value::String(n.to_string()),
            (AttrKind::String, Value::Bool(b)) => Value::String(b.to_string()),
            (AttrKind::Number, Value::String(s)) => match s.trim().parse::<f64>() {
                Ok(n) => serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::String(s)),
                Err(_) => Value::String(s),
            },
            (AttrKind::Boolean, Value::String(s)) => match s.as_str() {
                "true" | "1" => Value::Bool(true),
                "false" | "0" | "" => Value::Bool(false),
                _ => Value::String(s),
            },
            (AttrKind::Boolean, Value::Number(n)) => Value::Bool(n.as_f64() != Some(0.0)),
            (_, value) => value,
        }
    }
}

/// One attribute declaration.
#[derive(Clone, Debug, PartialEq)]
pub struct AttributeSchema {
    pub name: String,
    pub kind: AttrKind,
    /// Value read when neither canonical data nor a local edit exists.
    pub default: Option<Value>,
    /// Payload key, when it differs from `name`.
    pub key: Option<String>,
}

impl AttributeSchema {
    pub fn new(name: impl Into<String>, kind: AttrKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
            key: None,
        }
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Key used in raw payloads.
    pub fn payload_key(&self) -> &str {
        self.key.as_deref().unwrap_or(&self.name)
    }
}

/// Relationship cardinality.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    BelongsTo,
    HasMany,
}

/// How the inverse of a relationship is found.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum InverseSpec {
    /// Discover it on the target type.
    #[default]
    Auto,
    /// Use this relationship on the target type.
    Named(String),
    /// Never maintain an inverse.
    None,
}

/// One relationship declaration.
#[derive(Clone, Debug, PartialEq)]
pub struct RelationshipSchema {
    pub name: String,
    pub kind: RelationshipKind,
    pub target: TypeKey,
    /// Members are loaded on demand through the adapter.
    pub is_async: bool,
    /// Members may be any subtype of `target`.
    pub polymorphic: bool,
    pub inverse: InverseSpec,
    /// Payload key, when it differs from `name`.
    pub key: Option<String>,
}

impl RelationshipSchema {
    pub fn belongs_to(name: impl Into<String>, target: impl Into<TypeKey>) -> Self {
        Self::new(name, RelationshipKind::BelongsTo, target)
    }

    pub fn has_many(name: impl Into<String>, target: impl Into<TypeKey>) -> Self {
        Self::new(name, RelationshipKind::HasMany, target)
    }

    fn new(name: impl Into<String>, kind: RelationshipKind, target: impl Into<TypeKey>) -> Self {
        Self {
            name: name.into(),
            kind,
            target: target.into(),
            is_async: false,
            polymorphic: false,
            inverse: InverseSpec::Auto,
            key: None,
        }
    }

    pub fn asynchronous(mut self) -> Self {
        self.is_async = true;
        self
    }

    pub fn polymorphic(mut self) -> Self {
        self.polymorphic = true;
        self
    }

    pub fn inverse(mut self, name: impl Into<String>) -> Self {
        self.inverse = InverseSpec::Named(name.into());
        self
    }

    /// Disable inverse maintenance (`inverse: null`).
    pub fn no_inverse(mut self) -> Self {
        self.inverse = InverseSpec::None;
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// A model type as declared by the application.
///
/// ```ignore
/// let post = ModelSchema::new("post")
///     .attr("title", AttrKind::String)
///     .has_many("comments", "comment");
/// let comment = ModelSchema::new("comment")
///     .attr("body", AttrKind::String)
///     .belongs_to("post", "post");
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct ModelSchema {
    pub type_key: TypeKey,
    pub parent: Option<TypeKey>,
    pub primary_key: Option<String>,
    pub attributes: Vec<AttributeSchema>,
    pub relationships: Vec<RelationshipSchema>,
}

impl ModelSchema {
    pub fn new(type_key: impl Into<TypeKey>) -> Self {
        Self {
            type_key: type_key.into(),
            parent: None,
            primary_key: None,
            attributes: Vec::new(),
            relationships: Vec::new(),
        }
    }

    /// Inherit every attribute and relationship of `parent`.
    pub fn extends(mut self, parent: impl Into<TypeKey>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Payload field holding the id. Defaults to `"id"`.
    pub fn primary_key(mut self, key: impl Into<String>) -> Self {
        self.primary_key = Some(key.into());
        self
    }

    pub fn attr(self, name: impl Into<String>, kind: AttrKind) -> Self {
        self.attribute(AttributeSchema::new(name, kind))
    }

    pub fn attribute(mut self, attribute: AttributeSchema) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn belongs_to(self, name: impl Into<String>, target: impl Into<TypeKey>) -> Self {
        self.relationship(RelationshipSchema::belongs_to(name, target))
    }

    pub fn has_many(self, name: impl Into<String>, target: impl Into<TypeKey>) -> Self {
        self.relationship(RelationshipSchema::has_many(name, target))
    }

    pub fn relationship(mut self, relationship: RelationshipSchema) -> Self {
        self.relationships.push(relationship);
        self
    }
}
