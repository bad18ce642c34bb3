//! Subscription system for store change notification.
//!
//! This module provides in-process subscriptions to store events:
//! - Record lifecycle (loaded, committed, invalid, error, unloaded)
//! - Local attribute and relationship edits
//! - Live array membership deltas
//!
//! Subscriptions support:
//! - Filtering by record type, array id and event family
//! - Bounded buffers with slow-subscriber dropping
//!
//! # Example
//!
//! ```ignore
//! let handle = store.subscribe(SubscriptionConfig {
//!     filter: SubscriptionFilter::arrays(vec![people.id()]),
//!     ..Default::default()
//! });
//!
//! for event in handle.drain() {
//!     if let StoreEvent::ArrayChanged { added, removed, .. } = event {
//!         println!("+{} -{}", added.len(), removed.len());
//!     }
//! }
//! ```

mod manager;
mod types;

pub use manager::SubscriptionManager;
pub use types::{
    DropReason, RecordSummary, StoreEvent, SubscriptionConfig, SubscriptionFilter,
    SubscriptionHandle, SubscriptionId,
};
