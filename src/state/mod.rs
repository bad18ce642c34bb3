//! Record lifecycle.
//!
//! Every record carries one [`RecordState`]. Transitions are driven by
//! [`LifecycleEvent`]s; the boolean projections in [`RecordFlags`] are always
//! derived from the state and never stored.

mod machine;

pub use machine::{
    DeletedPhase, DirtyPhase, InvalidTransition, LifecycleEvent, RecordFlags, RecordState,
};
