use crate::error::Error;
use serde::Deserialize;
use std::sync::Arc;

/// A node of the remote group hierarchy.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Group {
    pub id: u64,
    pub full_path: String,
}

/// A project as listed by the remote service, before it is attached to the
/// group it was discovered under.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ProjectRecord {
    pub id: u64,
    pub ssh_url_to_repo: String,
    pub http_url_to_repo: String,
    pub path: String,
    pub path_with_namespace: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub id: u64,
    pub ssh_url_to_repo: String,
    pub http_url_to_repo: String,
    pub path: String,
    /// Unique within a run; doubles as the relative clone destination.
    pub path_with_namespace: String,
    pub group: Arc<Group>,
}

impl Project {
    pub fn new(record: ProjectRecord, group: Arc<Group>) -> Self {
        Self {
            id: record.id,
            ssh_url_to_repo: record.ssh_url_to_repo,
            http_url_to_repo: record.http_url_to_repo,
            path: record.path,
            path_with_namespace: record.path_with_namespace,
            group,
        }
    }
}

/// The result of handling one project in the clone stage.
///
/// `project` is `None` only for failures that are not tied to a single
/// project, such as the output directory not being creatable.
#[derive(Debug)]
pub struct CloneOutcome {
    pub project: Option<Project>,
    pub result: Result<(), Error>,
}

impl CloneOutcome {
    pub fn cloned(project: Project) -> Self {
        Self {
            project: Some(project),
            result: Ok(()),
        }
    }

    pub fn failed(project: Option<Project>, err: Error) -> Self {
        Self {
            project,
            result: Err(err),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn project_path(&self) -> Option<&str> {
        self.project.as_ref().map(|p| p.path_with_namespace.as_str())
    }
}
