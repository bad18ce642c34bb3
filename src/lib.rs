//! # Tessera
//!
//! A client-side identity map and relationship graph with live record
//! collections.
//!
//! ## Core Concepts
//!
//! - **Identity map**: at most one record per `(type, id)`; every lookup
//!   returns the same instance
//! - **Lifecycle**: each record moves through an explicit state machine
//!   (empty, loading, saved, created/updated/deleted with in-flight,
//!   invalid and error phases)
//! - **Relationships**: belongs-to and has-many edges with resolved
//!   inverses, kept consistent on both sides
//! - **Live arrays**: all-of-type, filtered and query arrays that update as
//!   records change
//! - **Adapter**: the async boundary to a backend, plus a normalizer that
//!   maps raw JSON to normalized record data
//!
//! ## Example
//!
//! ```ignore
//! use tessera::{AttrKind, FixtureAdapter, ModelSchema, Props, Store, TypeRegistry};
//! use serde_json::json;
//!
//! let registry = TypeRegistry::builder()
//!     .model(ModelSchema::new("person").attr("name", AttrKind::String).has_many("posts", "post"))
//!     .model(ModelSchema::new("post").attr("title", AttrKind::String).belongs_to("author", "person"))
//!     .build()?;
//!
//! let adapter = FixtureAdapter::new()
//!     .with_fixtures("person", vec![json!({"id": "1", "name": "Tom"})]);
//! let store = Store::new(registry, adapter);
//!
//! let tom = store.find("person", "1").await?;
//! let post = store.create_record("post", Props::new().attr("title", "Hello").belongs_to("author", Some(&tom)))?;
//! assert_eq!(store.has_many(&tom, "posts")?, vec![post.clone()]);
//! store.save(&post).await?;
//! ```

pub mod adapter;
pub mod collections;
pub mod error;
pub mod records;
pub mod relationships;
pub mod schema;
pub mod state;
pub mod store;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use adapter::{
    Adapter, Document, EmbeddedRecords, FixtureAdapter, JsonNormalizer, Normalizer, RelatedLookup,
};
pub use collections::{ArrayId, ArrayKind, ArraySlot, FilterFn};
pub use error::{AdapterError, AdapterResult, Errors, Result, StoreError};
pub use records::RecordView;
pub use relationships::{PromiseProxy, PromiseState};
pub use schema::{
    AttrKind, AttributeSchema, InverseSpec, ModelDescriptor, ModelSchema, RelationshipDescriptor,
    RelationshipKind, RelationshipSchema, TypeRegistry, TypeRegistryBuilder,
};
pub use state::{DeletedPhase, DirtyPhase, LifecycleEvent, RecordFlags, RecordState};
pub use store::{RecordArray, Store, StoreBuilder, StoreConfig};
pub use subscriptions::{
    DropReason, RecordSummary, StoreEvent, SubscriptionConfig, SubscriptionFilter,
    SubscriptionHandle, SubscriptionId,
};
pub use types::*;
