// Error types shared across the overlay engine, its sources and its server.

use std::io;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

// ============================================================================
// Snapshot Sources
// ============================================================================

/// Why a snapshot fetch did not produce a snapshot.
///
/// An empty snapshot is never a failure: zero entities is a valid outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "type", content = "detail", rename_all = "snake_case")]
pub enum FetchFailure {
    #[error("network error: {0}")]
    Network(String),
    #[error("no validated feed yet")]
    NotValidated,
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("parse error: {0}")]
    Parse(String),
}

impl FetchFailure {
    pub fn is_not_validated(&self) -> bool {
        matches!(self, FetchFailure::NotValidated)
    }
}

// ============================================================================
// Rendering Surface
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "type", content = "detail", rename_all = "snake_case")]
pub enum RenderError {
    #[error("rendering surface is not ready")]
    NotReady,
    #[error("unknown feature handle {0}")]
    UnknownHandle(u64),
    #[error("unknown popup handle {0}")]
    UnknownPopup(u64),
    #[error("unknown layer `{0}`")]
    UnknownLayer(String),
    #[error("missing or invalid map access credential")]
    Credential,
    #[error("renderer failed to load: {0}")]
    Load(String),
}

// ============================================================================
// Map Session
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("map session was already initialized")]
    AlreadyInitialized,
    #[error("map session is not initializing")]
    NotInitializing,
    #[error("map session was destroyed")]
    Destroyed,
    #[error("map session failed to initialize: {0}")]
    Errored(String),
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse overlay config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read overlay config from {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

// ============================================================================
// Static GTFS Archives
// ============================================================================

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed to open GTFS archive {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid zip archive: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("{0} not found in archive")]
    MissingFile(&'static str),
    #[error("failed to read {file}: {source}")]
    Read {
        file: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("malformed {file}: {source}")]
    Csv {
        file: &'static str,
        #[source]
        source: csv::Error,
    },
}

impl From<ArchiveError> for FetchFailure {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::Open { .. } => FetchFailure::NotValidated,
            other => FetchFailure::Parse(other.to_string()),
        }
    }
}

// ============================================================================
// Validation Collaborator
// ============================================================================

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("only ZIP files are accepted (got `{0}`)")]
    NotZip(String),
    #[error("failed to read feed archive {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("validation request failed: {0}")]
    Network(String),
    #[error("validation service returned {status}: {message}")]
    Server { status: u16, message: String },
    #[error("invalid validation response: {0}")]
    Parse(String),
}

// ============================================================================
// Engine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("overlay engine is no longer running")]
    Closed,
}
