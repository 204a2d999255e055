//! Shared types for pkgrelay mirrors.
//!
//! This crate carries the error taxonomy used across every mirror, the
//! progress-event types published on the state bus, and the mirror identity
//! helpers. It has no I/O of its own.
//!
//! # Example
//!
//! ```
//! use pkgrelay_types::{MirrorError, MirrorKind, State, Status, mirror_id};
//!
//! let id = mirror_id(MirrorKind::Composer, "packagist");
//! assert_eq!(id, "composer.packagist");
//!
//! let event = State::new(id, Status::Running, "Syncing packages");
//! assert_eq!(event.status, Status::Running);
//!
//! let err = anyhow::Error::from(MirrorError::EmptyKey);
//! assert!(MirrorError::is_empty_key(&err));
//! ```

use serde::{Deserialize, Serialize};

/// Error taxonomy shared by every mirror.
///
/// These are the error kinds HTTP handlers and cache-miss pathways branch
/// on. Operations propagate them inside `anyhow::Error`; use the `is_*`
/// helpers or `downcast_ref` to test for a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MirrorError {
    /// A synchronization is already running.
    #[error("a synchronization is already running")]
    SyncInProgress,

    /// The store has no value for the requested key.
    #[error("no value available")]
    EmptyKey,

    /// The upstream returned a 404.
    #[error("resource not found")]
    ResourceNotFound,

    /// The local store has no record yet (static mirror first fetch).
    #[error("empty data")]
    EmptyData,

    /// A template substitution produced its own input (configuration gap).
    #[error("same key")]
    SameKey,

    /// The upstream returned a non-200, non-404 status.
    #[error("http error: status {0}")]
    HttpError(u16),

    /// The upstream returned a document without an id.
    #[error("invalid package")]
    InvalidPackage,

    /// The store is closed for compaction.
    #[error("database locked")]
    DatabaseLocked,

    /// The on-disk lock is held elsewhere.
    #[error("lock timeout")]
    LockTimeout,
}

impl MirrorError {
    /// Test whether an error chain bottoms out in this exact kind.
    pub fn matches(err: &anyhow::Error, kind: MirrorError) -> bool {
        err.downcast_ref::<MirrorError>() == Some(&kind)
    }

    /// Shorthand for the cache-miss pathway.
    pub fn is_empty_key(err: &anyhow::Error) -> bool {
        Self::matches(err, MirrorError::EmptyKey)
    }

    /// Shorthand for the upstream-404 pathway.
    pub fn is_not_found(err: &anyhow::Error) -> bool {
        Self::matches(err, MirrorError::ResourceNotFound)
    }
}

/// The five supported mirror kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorKind {
    Composer,
    Npm,
    Git,
    Bower,
    Static,
}

impl MirrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MirrorKind::Composer => "composer",
            MirrorKind::Npm => "npm",
            MirrorKind::Git => "git",
            MirrorKind::Bower => "bower",
            MirrorKind::Static => "static",
        }
    }
}

impl std::fmt::Display for MirrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a mirror instance: `<kind>.<code>`.
pub fn mirror_id(kind: MirrorKind, code: &str) -> String {
    format!("{}.{}", kind, code)
}

/// Lifecycle status carried by a state event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Running,
    Hold,
    Error,
}

/// A progress event published on the state bus.
///
/// The `id` tags the originating mirror (`<kind>.<code>`); events from all
/// mirrors are funnelled into a single process-wide channel and fanned out
/// to SSE subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub id: String,
    pub status: Status,
    pub message: String,
}

impl State {
    pub fn new(id: impl Into<String>, status: Status, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_id_joins_kind_and_code() {
        assert_eq!(mirror_id(MirrorKind::Npm, "main"), "npm.main");
        assert_eq!(mirror_id(MirrorKind::Static, "assets"), "static.assets");
    }

    #[test]
    fn kind_display_is_lowercase() {
        assert_eq!(MirrorKind::Composer.to_string(), "composer");
        assert_eq!(MirrorKind::Git.to_string(), "git");
    }

    #[test]
    fn status_serializes_uppercase() {
        let json = serde_json::to_string(&Status::Running).expect("serialize");
        assert_eq!(json, "\"RUNNING\"");
        let json = serde_json::to_string(&Status::Hold).expect("serialize");
        assert_eq!(json, "\"HOLD\"");
    }

    #[test]
    fn state_event_roundtrip() {
        let event = State::new("composer.packagist", Status::Error, "boom");
        let json = serde_json::to_string(&event).expect("serialize");
        let parsed: State = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, event);
    }

    #[test]
    fn error_kind_matching_through_anyhow() {
        let err = anyhow::Error::from(MirrorError::ResourceNotFound);
        assert!(MirrorError::is_not_found(&err));
        assert!(!MirrorError::is_empty_key(&err));
    }

    #[test]
    fn error_kind_matching_with_context() {
        use anyhow::Context;

        let err: anyhow::Error = Err::<(), _>(MirrorError::EmptyKey)
            .context("loading package")
            .unwrap_err();
        // context wraps the kind; downcast_ref walks the chain
        assert!(MirrorError::is_empty_key(&err));
    }

    #[test]
    fn http_error_carries_status() {
        let err = MirrorError::HttpError(503);
        assert_eq!(err.to_string(), "http error: status 503");
    }
}
