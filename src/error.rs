//! Error types for the aggregator and its collaborators.
//!
//! None of these reach the caller of a mutating aggregator operation; they are
//! logged at the operation boundary and folded into an [`Outcome`](crate::aggregator::Outcome).

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::model::{DescriptorKind, RepoPath};

/// Failures raised by an [`ArtifactStore`](crate::store::ArtifactStore).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("item not found: {0}")]
    NotFound(RepoPath),

    #[error("storage of repository [{repository}] is unavailable: {reason}")]
    Unavailable { repository: String, reason: String },

    #[error("invalid repository path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("link chain starting at {0} is too deep")]
    LinkLoop(RepoPath),

    #[error("i/o failure on {path}: {source}")]
    Io {
        path: RepoPath,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: &RepoPath, source: io::Error) -> Self {
        StoreError::Io {
            path: path.clone(),
            source,
        }
    }
}

/// Failures raised by a [`DescriptorToolkit`](crate::toolkit::DescriptorToolkit).
#[derive(Debug, Error)]
pub enum ToolkitError {
    #[error("i/o failure on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not parse {path:?}: {message}")]
    Xml { path: PathBuf, message: String },

    #[error("malformed descriptor {path:?}: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

impl ToolkitError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ToolkitError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        ToolkitError::Malformed {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("repository [{0}] could not be found")]
    RepositoryUnavailable(String),

    #[error("malformed {kind} fragment: {reason}")]
    MalformedFragment { kind: DescriptorKind, reason: String },

    #[error("fragment {0} is not present in the store")]
    FragmentNotFound(RepoPath),

    #[error("aggregate index file {0} is missing after materialization")]
    IndexMissing(RepoPath),

    #[error("staging failed: {0}")]
    Staging(#[source] io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Toolkit(#[from] ToolkitError),
}

impl AggregatorError {
    /// Malformed input is expected from upstream producers and gets an extra debug line.
    pub fn is_malformed_input(&self) -> bool {
        matches!(
            self,
            AggregatorError::MalformedFragment { .. }
                | AggregatorError::Toolkit(ToolkitError::Malformed { .. })
                | AggregatorError::Toolkit(ToolkitError::Xml { .. })
        )
    }

    /// Short label used for metrics.
    pub fn category(&self) -> &'static str {
        match self {
            AggregatorError::RepositoryUnavailable(_) => "repository_unavailable",
            AggregatorError::MalformedFragment { .. } => "malformed_fragment",
            AggregatorError::FragmentNotFound(_) => "fragment_not_found",
            AggregatorError::IndexMissing(_) => "index_missing",
            AggregatorError::Staging(_) => "staging",
            AggregatorError::Store(_) => "store_io",
            AggregatorError::Toolkit(ToolkitError::Io { .. }) => "toolkit_io",
            AggregatorError::Toolkit(_) => "malformed_fragment",
        }
    }
}
