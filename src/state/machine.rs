//! Per-record lifecycle state machine.

use serde::{Deserialize, Serialize};

/// Sub-state of a record with uncommitted local changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirtyPhase {
    Uncommitted,
    InFlight,
    /// The adapter rejected the record with validation messages.
    Invalid,
    /// The adapter rejected the last save or reload.
    Error,
}

/// Sub-state of a locally deleted record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletedPhase {
    Uncommitted,
    InFlight,
    Error,
    /// Terminal: the delete is persisted (or the record was unloaded).
    Saved,
}

/// Lifecycle state of a record.
///
/// ```text
/// empty -> loading -> saved <-> updated.* -> updated.inFlight -> saved
///                       |                         |-> updated.invalid / updated.error
///                       '-> deleted.uncommitted -> deleted.inFlight -> deleted.saved
/// created.uncommitted -> created.inFlight -> saved
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "phase", rename_all = "snake_case")]
pub enum RecordState {
    Empty,
    Loading,
    Saved,
    /// Loaded and clean, but the last reload failed.
    Error,
    Created(DirtyPhase),
    Updated(DirtyPhase),
    Deleted(DeletedPhase),
}

/// Input to the state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A fetch for an empty record was issued.
    LoadingData,
    /// Canonical data arrived (push, fetch result, reload result).
    PushedData,
    /// A fetch finished without data for the record.
    NotFound,
    /// A local attribute or relationship change.
    BecomeDirty,
    /// The last local change was reverted by hand.
    PropertyWasReset,
    WillCommit,
    /// The adapter acknowledged a save. `dirty` is true when local edits
    /// made while the save was in flight remain.
    DidCommit { dirty: bool },
    BecameInvalid,
    BecameValid,
    BecameError,
    /// A reload completed.
    Reloaded,
    DeleteRecord,
    Rollback,
    Unload,
}

impl LifecycleEvent {
    pub fn name(self) -> &'static str {
        match self {
            LifecycleEvent::LoadingData => "loadingData",
            LifecycleEvent::PushedData => "pushedData",
            LifecycleEvent::NotFound => "notFound",
            LifecycleEvent::BecomeDirty => "becomeDirty",
            LifecycleEvent::PropertyWasReset => "propertyWasReset",
            LifecycleEvent::WillCommit => "willCommit",
            LifecycleEvent::DidCommit { .. } => "didCommit",
            LifecycleEvent::BecameInvalid => "becameInvalid",
            LifecycleEvent::BecameValid => "becameValid",
            LifecycleEvent::BecameError => "becameError",
            LifecycleEvent::Reloaded => "reloaded",
            LifecycleEvent::DeleteRecord => "deleteRecord",
            LifecycleEvent::Rollback => "rollback",
            LifecycleEvent::Unload => "unloadRecord",
        }
    }
}

/// Rejected transition: `event` is not handled in `from`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: RecordState,
    pub event: LifecycleEvent,
}

/// Boolean projections of a state. Never stored; always derived.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFlags {
    pub is_empty: bool,
    pub is_loading: bool,
    pub is_loaded: bool,
    pub is_dirty: bool,
    pub is_saving: bool,
    pub is_deleted: bool,
    pub is_new: bool,
    pub is_valid: bool,
    pub is_error: bool,
}

impl Default for RecordState {
    fn default() -> Self {
        RecordState::Empty
    }
}

impl RecordState {
    /// Dotted state path, e.g. `root.loaded.updated.inFlight`.
    pub fn name(self) -> &'static str {
        use DeletedPhase as D;
        use DirtyPhase as P;
        match self {
            RecordState::Empty => "root.empty",
            RecordState::Loading => "root.loading",
            RecordState::Saved => "root.loaded.saved",
            RecordState::Error => "root.loaded.saved.error",
            RecordState::Created(P::Uncommitted) => "root.loaded.created.uncommitted",
            RecordState::Created(P::InFlight) => "root.loaded.created.inFlight",
            RecordState::Created(P::Invalid) => "root.loaded.created.invalid",
            RecordState::Created(P::Error) => "root.loaded.created.error",
            RecordState::Updated(P::Uncommitted) => "root.loaded.updated.uncommitted",
            RecordState::Updated(P::InFlight) => "root.loaded.updated.inFlight",
            RecordState::Updated(P::Invalid) => "root.loaded.updated.invalid",
            RecordState::Updated(P::Error) => "root.loaded.updated.error",
            RecordState::Deleted(D::Uncommitted) => "root.deleted.uncommitted",
            RecordState::Deleted(D::InFlight) => "root.deleted.inFlight",
            RecordState::Deleted(D::Error) => "root.deleted.error",
            RecordState::Deleted(D::Saved) => "root.deleted.saved",
        }
    }

    pub fn flags(self) -> RecordFlags {
        use DeletedPhase as D;
        use DirtyPhase as P;
        let mut flags = RecordFlags {
            is_valid: true,
            ..Default::default()
        };
        match self {
            RecordState::Empty => flags.is_empty = true,
            RecordState::Loading => flags.is_loading = true,
            RecordState::Saved => flags.is_loaded = true,
            RecordState::Error => {
                flags.is_loaded = true;
                flags.is_error = true;
            }
            RecordState::Created(phase) | RecordState::Updated(phase) => {
                flags.is_loaded = true;
                flags.is_dirty = true;
                flags.is_new = matches!(self, RecordState::Created(_));
                flags.is_saving = phase == P::InFlight;
                flags.is_valid = phase != P::Invalid;
                flags.is_error = phase == P::Error;
            }
            RecordState::Deleted(phase) => {
                flags.is_loaded = true;
                flags.is_deleted = true;
                flags.is_dirty = phase != D::Saved;
                flags.is_saving = phase == D::InFlight;
                flags.is_error = phase == D::Error;
            }
        }
        flags
    }

    pub fn is_in_flight(self) -> bool {
        self.flags().is_saving
    }

    /// Loaded, not deleted, and holding no uncommitted changes.
    pub fn is_clean(self) -> bool {
        matches!(self, RecordState::Saved | RecordState::Error)
    }

    /// Compute the next state for `event`.
    pub fn apply(self, event: LifecycleEvent) -> Result<RecordState, InvalidTransition> {
        use DeletedPhase as D;
        use DirtyPhase as P;
        use LifecycleEvent as E;
        use RecordState as S;

        let next = match (self, event) {
            (S::Empty, E::LoadingData) => S::Loading,
            (S::Empty | S::Loading, E::PushedData) => S::Saved,
            (S::Empty | S::Loading, E::NotFound) => S::Empty,
            (S::Empty, E::Unload) => S::Deleted(D::Saved),

            (S::Saved, E::PushedData | E::Reloaded | E::Rollback) => S::Saved,
            (S::Saved, E::BecomeDirty) => S::Updated(P::Uncommitted),
            // A record without changes can still be saved.
            (S::Saved, E::WillCommit) => S::Updated(P::InFlight),
            (S::Saved | S::Error, E::DeleteRecord) => S::Deleted(D::Uncommitted),
            (S::Saved | S::Error, E::Unload) => S::Deleted(D::Saved),
            (S::Saved | S::Error, E::BecameError) => S::Error,

            (S::Error, E::PushedData) => S::Error,
            (S::Error, E::Reloaded | E::Rollback) => S::Saved,
            (S::Error, E::BecomeDirty) => S::Updated(P::Error),
            (S::Error, E::WillCommit) => S::Updated(P::InFlight),

            (S::Created(p), E::BecomeDirty | E::PropertyWasReset | E::PushedData) => S::Created(p),
            (S::Created(P::Uncommitted | P::Error), E::WillCommit) => S::Created(P::InFlight),
            (S::Created(P::InFlight), E::DidCommit { dirty: true }) => S::Updated(P::Uncommitted),
            (S::Created(P::InFlight), E::DidCommit { dirty: false }) => S::Saved,
            (S::Created(P::InFlight), E::BecameInvalid) => S::Created(P::Invalid),
            (S::Created(P::InFlight), E::BecameError) => S::Created(P::Error),
            // Only the changes made after the save was issued are discarded.
            (S::Created(P::InFlight), E::Rollback) => S::Created(P::InFlight),
            (S::Created(P::Invalid), E::BecameValid) => S::Created(P::Uncommitted),
            // A new record cannot be un-created: rolling it back or deleting it
            // before it was ever saved marks it deleted.
            (S::Created(P::Uncommitted | P::Invalid | P::Error), E::Rollback | E::DeleteRecord) => {
                S::Deleted(D::Saved)
            }

            (S::Updated(p), E::BecomeDirty | E::PushedData) => S::Updated(p),
            (S::Updated(P::Uncommitted), E::PropertyWasReset) => S::Saved,
            (S::Updated(p), E::PropertyWasReset) => S::Updated(p),
            (S::Updated(P::Uncommitted | P::Error), E::WillCommit) => S::Updated(P::InFlight),
            (S::Updated(P::InFlight), E::DidCommit { dirty: true }) => S::Updated(P::Uncommitted),
            (S::Updated(P::InFlight), E::DidCommit { dirty: false }) => S::Saved,
            (S::Updated(P::InFlight), E::BecameInvalid) => S::Updated(P::Invalid),
            (S::Updated(P::Uncommitted | P::InFlight | P::Error), E::BecameError) => {
                S::Updated(P::Error)
            }
            (S::Updated(P::InFlight), E::Rollback) => S::Updated(P::InFlight),
            (S::Updated(P::Invalid), E::BecameValid) => S::Updated(P::Uncommitted),
            (S::Updated(P::Uncommitted | P::Invalid | P::Error), E::Rollback) => S::Saved,
            (S::Updated(P::Uncommitted | P::Invalid | P::Error), E::DeleteRecord) => {
                S::Deleted(D::Uncommitted)
            }
            (S::Updated(P::Uncommitted), E::Reloaded) => S::Updated(P::Uncommitted),
            (S::Updated(P::Error), E::Reloaded) => S::Updated(P::Uncommitted),

            (S::Deleted(p), E::PushedData) => S::Deleted(p),
            (S::Deleted(D::Uncommitted | D::Error), E::WillCommit) => S::Deleted(D::InFlight),
            (S::Deleted(D::Uncommitted | D::Error), E::Rollback) => S::Saved,
            (S::Deleted(D::InFlight), E::DidCommit { .. }) => S::Deleted(D::Saved),
            (S::Deleted(D::InFlight), E::BecameError | E::BecameInvalid) => S::Deleted(D::Error),
            (S::Deleted(D::Saved), E::Unload | E::DeleteRecord) => S::Deleted(D::Saved),

            (from, event) => return Err(InvalidTransition { from, event }),
        };
        Ok(next)
    }
}
