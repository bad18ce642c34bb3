//! Subscription types for store change notification.

use crate::collections::{ArrayId, ArraySlot};
use crate::error::Errors;
use crate::records::Record;
use crate::schema::ModelDescriptor;
use crate::types::{ClientId, RecordId};
use serde::{Deserialize, Serialize};

/// Configuration for a subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Max buffered events before dropping subscriber.
    /// Default: 1000
    pub buffer_size: usize,

    /// Filter criteria.
    pub filter: SubscriptionFilter,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            filter: SubscriptionFilter::all(),
        }
    }
}

/// Filter criteria for subscriptions.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionFilter {
    /// Filter record events by type (None = all types).
    pub record_types: Option<Vec<String>>,

    /// Filter array events by array (None = all arrays).
    pub arrays: Option<Vec<ArrayId>>,

    /// Include lifecycle events (loaded, created, state changes, ...).
    pub include_lifecycle: bool,

    /// Include attribute and relationship change events.
    pub include_changes: bool,

    /// Include array membership deltas.
    pub include_arrays: bool,
}

impl SubscriptionFilter {
    /// Lifecycle events for every record.
    pub fn lifecycle() -> Self {
        Self {
            include_lifecycle: true,
            ..Default::default()
        }
    }

    /// Lifecycle and change events for specific record types.
    pub fn record_types(types: Vec<String>) -> Self {
        Self {
            record_types: Some(types),
            include_lifecycle: true,
            include_changes: true,
            ..Default::default()
        }
    }

    /// Deltas for specific arrays.
    pub fn arrays(ids: Vec<ArrayId>) -> Self {
        Self {
            arrays: Some(ids),
            include_arrays: true,
            ..Default::default()
        }
    }

    /// Subscribe to everything.
    pub fn all() -> Self {
        Self {
            include_lifecycle: true,
            include_changes: true,
            include_arrays: true,
            ..Default::default()
        }
    }
}

/// Events emitted by the store.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    // --- Lifecycle Events ---
    /// Canonical data arrived for a record that had none.
    RecordLoaded { record: RecordSummary },

    /// A new record was committed.
    RecordCreated { record: RecordSummary },

    /// An update was committed.
    RecordUpdated { record: RecordSummary },

    /// A delete was committed.
    RecordDeleted { record: RecordSummary },

    /// The adapter rejected a save with validation messages.
    RecordBecameInvalid {
        record: RecordSummary,
        errors: Errors,
    },

    /// The adapter failed a save or reload.
    RecordBecameError {
        record: RecordSummary,
        message: String,
    },

    /// The record left the identity map.
    RecordUnloaded { record: RecordSummary },

    /// The record moved to another lifecycle state.
    StateChanged {
        record: RecordSummary,
        from: String,
        to: String,
    },

    // --- Change Events ---
    /// An attribute or relationship was edited locally.
    RecordChanged { record: RecordSummary, field: String },

    // --- Array Events ---
    /// Array membership changed.
    ArrayChanged {
        array: ArrayId,
        record_type: String,
        removed: Vec<ArraySlot>,
        added: Vec<ArraySlot>,
    },

    /// Subscription was dropped.
    Dropped { reason: DropReason },
}

impl StoreEvent {
    /// Record this event is about, if any.
    pub fn record(&self) -> Option<&RecordSummary> {
        match self {
            StoreEvent::RecordLoaded { record }
            | StoreEvent::RecordCreated { record }
            | StoreEvent::RecordUpdated { record }
            | StoreEvent::RecordDeleted { record }
            | StoreEvent::RecordBecameInvalid { record, .. }
            | StoreEvent::RecordBecameError { record, .. }
            | StoreEvent::RecordUnloaded { record }
            | StoreEvent::StateChanged { record, .. }
            | StoreEvent::RecordChanged { record, .. } => Some(record),
            StoreEvent::ArrayChanged { .. } | StoreEvent::Dropped { .. } => None,
        }
    }
}

/// Why a subscription was dropped.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
}

/// Summary of a record (for events, avoids sending every attribute).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordSummary {
    pub client_id: ClientId,
    pub record_type: String,
    pub id: Option<RecordId>,
    /// Dotted lifecycle state name.
    pub state: String,
    /// Serialized size of the effective attributes in bytes.
    pub payload_size: usize,
    /// The attributes themselves (if small enough, otherwise None).
    pub attributes: Option<serde_json::Value>,
}

impl RecordSummary {
    pub(crate) fn from_record(
        record: &Record,
        model: &ModelDescriptor,
        include_payload_threshold: usize,
    ) -> Self {
        let attributes = serde_json::Value::Object(record.effective_attributes(model));
        let payload_size = serde_json::to_vec(&attributes)
            .map(|bytes| bytes.len())
            .unwrap_or(0);

        let attributes = if payload_size <= include_payload_threshold {
            Some(attributes)
        } else {
            None
        };

        Self {
            client_id: record.client_id,
            record_type: record.type_key.to_string(),
            id: record.id.clone(),
            state: record.state.name().to_string(),
            payload_size,
            attributes,
        }
    }
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Handle to manage a subscription.
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    /// Channel to receive events.
    pub receiver: crossbeam_channel::Receiver<StoreEvent>,
}

impl SubscriptionHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<StoreEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<StoreEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<StoreEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Every event currently buffered.
    pub fn drain(&self) -> Vec<StoreEvent> {
        self.receiver.try_iter().collect()
    }
}
