//! Crate-wide error type.

use std::{io, path::PathBuf};

use thiserror::Error;

use crate::id::ResourceId;

pub type Result<T, E = ServerError> = std::result::Result<T, E>;

/// Unifies the error kinds enumerated in the error-handling design: some are fatal at
/// startup (propagated out of `main`), others are recorded on a [`crate::request::CompilationRequest`]
/// or logged as a recoverable warning. Which behavior applies is a property of the call
/// site, not of the variant.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("no compiler registered for resource type {0:?}")]
    UnknownResourceType(crate::id::ResourceTypeId),

    #[error("no compile-dependency information available for {0}")]
    NoCompileDependencyInfo(ResourceId),

    #[error("failed to spawn compiler subprocess for {resource}: {source}")]
    SubprocessSpawn {
        resource: ResourceId,
        #[source]
        source: io::Error,
    },

    #[error("compiler subprocess for {0} crashed or timed out")]
    SubprocessCrashOrTimeout(ResourceId),

    #[error("record store at {0} is corrupt, resetting to empty")]
    RecordStoreCorruption(PathBuf),

    #[error("another instance of the server is already running (lock held at {0})")]
    AlreadyRunning(PathBuf),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("malformed resource id {0:?}")]
    MalformedResourceId(String),

    #[error("malformed compiled resource header in {0}")]
    MalformedHeader(PathBuf),
}

impl ServerError {
    pub fn io(source: io::Error, context: impl Into<String>) -> Self {
        Self::Io { context: context.into(), source }
    }
}
