// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Error taxonomy shared by every component.
use thiserror::Error;

use crate::ident::ObjectId;
use crate::validation::{ErrorToken, ValidationReport};

/// Errors surfaced by the engine.
///
/// Authorization and validation failures raised inside a transaction poison
/// it: the whole unit of work rolls back at completion. Read-path errors never
/// affect a transaction.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    /// Permission denied on a write, delete or access-control operation.
    #[error("{reason}")]
    Authorization {
        /// Human-readable reason, e.g. "Modification not permitted".
        reason: String,
    },
    /// One or more objects failed validation.
    #[error("validation failed: {0}")]
    Validation(ValidationReport),
    /// Unknown id, unknown paging cursor, or existence hidden by policy.
    #[error("not found: {what}")]
    NotFound {
        /// What was looked up.
        what: String,
    },
    /// Another transaction committed a conflicting write first.
    #[error("concurrent modification of {object}")]
    Conflict {
        /// The contended object.
        object: ObjectId,
    },
    /// Malformed propagation or cascade metadata, or an invalid schema.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The transaction already finished.
    #[error("transaction is closed")]
    TransactionClosed,
    /// The transaction was marked successful but had to roll back.
    #[error("transaction aborted: {reason}")]
    TransactionAborted {
        /// Why the commit did not happen.
        reason: String,
    },
}

impl GraphError {
    pub(crate) fn authorization(reason: impl Into<String>) -> Self {
        Self::Authorization {
            reason: reason.into(),
        }
    }

    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub(crate) fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub(crate) fn validation(tokens: Vec<ErrorToken>) -> Self {
        Self::Validation(ValidationReport::from(tokens))
    }

    /// Validation tokens, when this is a validation error.
    pub fn tokens(&self) -> &[ErrorToken] {
        match self {
            Self::Validation(report) => report.tokens(),
            _ => &[],
        }
    }
}
