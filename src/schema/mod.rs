//! Model schemas and the per-store type registry.
//!
//! Applications declare models with [`ModelSchema`]; [`TypeRegistry::builder`]
//! flattens inheritance, validates relationship targets and resolves every
//! inverse once, producing the [`ModelDescriptor`]s the store works from.

mod model;
mod registry;

pub use model::{
    AttrKind, AttributeSchema, InverseSpec, ModelSchema, RelationshipKind, RelationshipSchema,
};
pub use registry::{ModelDescriptor, RelationshipDescriptor, TypeRegistry, TypeRegistryBuilder};
