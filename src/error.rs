//! Job failure classification
//!
//! Every job execution ends in either an output or a [`JobFailure`]. The
//! runner reads the [`FailureKind`] to decide whether a permanent failure is
//! recorded as fatal for the changeset or only as a missing artefact.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad class of a job failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Pub/sub connect refused, broker restart, delivery timeout
    Transport,
    /// Invalid commit range, missing blob
    Input,
    /// Highlighting or line analysis could not be produced
    Artifact,
    /// Database or bookkeeping failure inside the engine
    Internal,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Transport => write!(f, "transport"),
            FailureKind::Input => write!(f, "input"),
            FailureKind::Artifact => write!(f, "artifact"),
            FailureKind::Internal => write!(f, "internal"),
        }
    }
}

/// A failed job execution
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[error("{kind} failure: {detail}")]
pub struct JobFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn transport(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::Transport, detail)
    }

    pub fn input(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::Input, detail)
    }

    pub fn artifact(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::Artifact, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::Internal, detail)
    }

    /// Wrap an `anyhow` error chain, keeping every context line
    pub fn from_error(kind: FailureKind, error: &anyhow::Error) -> Self {
        Self::new(kind, format!("{:#}", error))
    }

    /// Whether a permanent failure of this kind leaves the changeset with a
    /// fatal gap rather than a lesser artefact
    pub fn fatal(&self) -> bool {
        matches!(self.kind, FailureKind::Input | FailureKind::Internal)
    }

    /// Encode for transport inside a pub/sub error response
    pub fn to_wire(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.detail.clone())
    }

    /// Decode an error string received from a remote worker; anything that is
    /// not an encoded failure is treated as an internal worker error
    pub fn from_wire(message: &str) -> Self {
        serde_json::from_str(message).unwrap_or_else(|_| Self::internal(message))
    }
}
