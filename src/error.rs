//! Error types for the store.

use crate::types::{ClientId, RecordId, TypeKey};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Per-attribute validation messages reported by an adapter.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Errors(IndexMap<String, Vec<String>>);

impl Errors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a message for an attribute.
    pub fn add(&mut self, attribute: impl Into<String>, message: impl Into<String>) {
        self.0.entry(attribute.into()).or_default().push(message.into());
    }

    /// Builder form of [`Errors::add`].
    pub fn with(mut self, attribute: impl Into<String>, message: impl Into<String>) -> Self {
        self.add(attribute, message);
        self
    }

    /// Messages for one attribute.
    pub fn get(&self, attribute: &str) -> Option<&[String]> {
        self.0.get(attribute).map(Vec::as_slice)
    }

    /// Drop every message for an attribute. Returns true if any were present.
    pub fn remove(&mut self, attribute: &str) -> bool {
        self.0.shift_remove(attribute).is_some()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn attributes(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl fmt::Display for Errors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (attribute, messages) in &self.0 {
            if !first {
                write!(f, "; ")?;
            }
            first = false;
            write!(f, "{}: {}", attribute, messages.join(", "))?;
        }
        Ok(())
    }
}

/// Failure reported by an adapter hook.
#[derive(Clone, Debug, Error)]
pub enum AdapterError {
    /// The backend rejected the record with per-attribute messages.
    #[error("Record is invalid: {0}")]
    Invalid(Errors),

    /// Opaque failure (transport, server error, missing fixture, ...).
    #[error("Adapter failure: {0}")]
    Failure(String),

    /// The adapter does not implement this hook.
    #[error("Adapter does not implement `{0}`")]
    NotImplemented(&'static str),
}

impl AdapterError {
    pub fn failure(message: impl Into<String>) -> Self {
        AdapterError::Failure(message.into())
    }
}

/// Result type for adapter hooks.
pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// Main error type for store operations.
#[derive(Clone, Debug, Error)]
pub enum StoreError {
    /// Structured rejection; the record is now in an `invalid` sub-state.
    #[error("Validation failed: {0}")]
    Validation(Errors),

    /// Opaque adapter rejection; the record is now in an `error` sub-state.
    #[error("Adapter error: {0}")]
    Adapter(String),

    /// Operation not permitted in the record's current state.
    #[error("Invalid state for {operation} on {record}: record is {state}")]
    InvalidState {
        record: String,
        state: &'static str,
        operation: &'static str,
    },

    /// Broken invariant caused by the caller (wrong type in a relationship,
    /// unloaded record behind a synchronous relationship, ...).
    #[error("Assertion failed: {0}")]
    Assertion(String),

    #[error("The id {id} has already been used with another record of type {type_key}")]
    DuplicateId { type_key: TypeKey, id: RecordId },

    #[error("Unknown record type: {0}")]
    UnknownType(TypeKey),

    #[error("Type {type_key} has no attribute `{name}`")]
    UnknownAttribute { type_key: TypeKey, name: String },

    #[error("Type {type_key} has no relationship `{name}`")]
    UnknownRelationship { type_key: TypeKey, name: String },

    #[error("Record not found: {type_key}:{id}")]
    RecordNotFound { type_key: TypeKey, id: RecordId },

    #[error("Record handle {0:?} is not known to this store")]
    UnknownRecord(ClientId),

    #[error("Record array not found: {0}")]
    ArrayNotFound(u64),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// True for rejections the caller can recover from by retrying or editing.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StoreError::Validation(_) | StoreError::Adapter(_))
    }
}

impl From<AdapterError> for StoreError {
    fn from(e: AdapterError) -> Self {
        match e {
            AdapterError::Invalid(errors) => StoreError::Validation(errors),
            other => StoreError::Adapter(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
