use crate::os::CommandError;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Failure of a call to the remote group/project service.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status} from {url}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },

    #[error("failed to parse response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("request cancelled")]
    Cancelled,
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }
}

/// Errors surfaced by the extraction pipeline.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to fetch group {group_id}: {source}")]
    GroupFetch {
        group_id: String,
        #[source]
        source: ApiError,
    },

    #[error("failed to fetch groups: {0}")]
    GroupsFetch(#[source] ApiError),

    #[error("failed to fetch subgroups of group {group_id}: {source}")]
    SubGroupsFetch {
        group_id: u64,
        #[source]
        source: ApiError,
    },

    #[error("failed to fetch projects for group {group_id}: {source}")]
    ProjectsFetch {
        group_id: u64,
        #[source]
        source: ApiError,
    },

    #[error("no group IDs provided")]
    NoGroupIds,

    #[error("all group IDs are skipped")]
    AllGroupIdsSkipped,

    #[error("no group passed")]
    NoGroupPassed,

    #[error("directory already exists: {}", .0.display())]
    DirExists(PathBuf),

    #[error("failed to check if directory exists ({}): {source}", .dir.display())]
    DirExistsCheck {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("output directory {} not created: {source}", .dir.display())]
    OutputDirNotCreated {
        dir: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("failed to clone project ({project}): {source}\nOutput:\n{output}")]
    Clone {
        project: String,
        output: String,
        #[source]
        source: CommandError,
    },

    #[error("failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Whether a group lookup failed because the group does not exist.
    pub fn is_group_not_found(&self) -> bool {
        matches!(self, Error::GroupFetch { source, .. } if source.is_not_found())
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::GroupFetch { source, .. }
            | Error::GroupsFetch(source)
            | Error::SubGroupsFetch { source, .. }
            | Error::ProjectsFetch { source, .. } => matches!(source, ApiError::Cancelled),
            Error::Clone { source, .. } => matches!(source, CommandError::Cancelled { .. }),
            _ => false,
        }
    }
}
