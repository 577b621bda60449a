use thiserror::Error;

use crate::domain::errors::MoneyError;

/// Storage failures callers may want to recognise after an `anyhow` round trip
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("child {child_id} not found in family {family_id}")]
    ChildNotFound { family_id: String, child_id: String },

    #[error("transaction {id} does not carry a {expected} provenance")]
    ProvenanceMismatch { id: String, expected: &'static str },

    #[error("amount cannot be stored: {0}")]
    InvalidAmount(#[from] MoneyError),
}
