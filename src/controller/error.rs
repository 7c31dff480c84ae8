//! Error types for the Database controller

use thiserror::Error;

use crate::crd::DatabaseState;
use crate::provider::ProviderError;
use crate::store::StoreError;

/// Error variants are named with the `Error` suffix for clarity (e.g., `StoreError`, `ValidationError`).
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    StoreError(#[from] StoreError),

    #[error(transparent)]
    ProviderError(#[from] ProviderError),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid state transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),
}

impl Error {
    /// True when the object the error refers to no longer exists
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::StoreError(e) if e.is_not_found())
    }

    pub(crate) fn invalid_transition(from: Option<DatabaseState>, event: impl ToString) -> Self {
        Error::InvalidTransition {
            from: from.map_or_else(|| "(none)".to_string(), |s| s.to_string()),
            event: event.to_string(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
