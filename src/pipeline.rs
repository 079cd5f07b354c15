use crate::config::RunConfig;
use crate::discovery::proceed_groups;
use crate::git::{clone_projects, GitCloner};
use crate::gitlab::{GroupsService, ProjectsService};
use crate::groups::fetch_groups;
use crate::os::OsWrapper;
use crate::progress::{Progress, ProgressCounter};
use crate::project::CloneOutcome;
use crate::stream::{merge, recv, tee};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub progress: Progress,
    /// Errors raised while resolving groups or discovering projects.
    pub fetch_errors: u32,
}

impl Summary {
    pub fn is_success(&self) -> bool {
        self.progress.failed == 0 && self.fetch_errors == 0
    }
}

/// Runs a whole extraction: groups are resolved, their projects discovered
/// and cloned. Returns once every stage has shut down.
pub async fn run<C>(
    cancel: &CancellationToken,
    config: Arc<RunConfig>,
    client: Arc<C>,
    os: Arc<dyn OsWrapper>,
) -> Summary
where
    C: GroupsService + ProjectsService + 'static,
{
    // Cancelled on run-wide failures without touching the caller's token.
    let cancel = cancel.child_token();
    let counter = Arc::new(ProgressCounter::new(0));

    let groups_client: Arc<dyn GroupsService> = client.clone();
    let projects_client: Arc<dyn ProjectsService> = client;

    let (groups, group_errors) = fetch_groups(&cancel, groups_client, Arc::clone(&config));
    let (projects, project_errors) =
        proceed_groups(&cancel, projects_client, config.max_workers, groups);

    let mut outputs = tee(&cancel, projects, 2).into_iter();
    let (Some(mut to_count), Some(to_clone)) = (outputs.next(), outputs.next()) else {
        return Summary::default();
    };
    let counting = {
        let cancel = cancel.clone();
        let counter = Arc::clone(&counter);
        tokio::spawn(async move {
            while recv(&cancel, &mut to_count).await.is_some() {
                counter.register();
            }
        })
    };

    let cloner = Arc::new(GitCloner::new(Arc::clone(&config), os));
    let mut outcomes = clone_projects(&cancel, cloner, config.max_workers, to_clone);
    let mut errors = merge(&cancel, vec![group_errors, project_errors]);

    let mut fetch_errors = 0;
    let (mut outcomes_open, mut errors_open) = (true, true);
    while outcomes_open || errors_open {
        tokio::select! {
            outcome = outcomes.recv(), if outcomes_open => match outcome {
                Some(outcome) => record_outcome(&cancel, &counter, outcome),
                None => outcomes_open = false,
            },
            err = errors.recv(), if errors_open => match err {
                Some(err) => {
                    log::error!("{}", err);
                    fetch_errors += 1;
                }
                None => errors_open = false,
            },
        }
    }

    if let Err(e) = counting.await {
        log::debug!("Progress counting task failed: {}", e);
    }

    Summary {
        progress: counter.snapshot(),
        fetch_errors,
    }
}

/// Formats `[completed/total]` for progress lines.
///
/// The total is registered by a separate task and can trail the outcomes
/// for a moment, so it is shown as at least `completed`. It is exact once
/// the run has finished.
fn progress_label(progress: &Progress) -> String {
    format!(
        "[{}/{}]",
        progress.completed,
        progress.total.max(progress.completed)
    )
}

fn record_outcome(cancel: &CancellationToken, counter: &ProgressCounter, outcome: CloneOutcome) {
    counter.update(outcome.is_success());
    let label = progress_label(&counter.snapshot());

    match (&outcome.project, &outcome.result) {
        (Some(project), Ok(())) => {
            log::info!("{} Cloned {}", label, project.path_with_namespace)
        }
        (Some(project), Err(err)) if err.is_cancelled() => {
            log::debug!("Cancelled {}", project.path_with_namespace)
        }
        (Some(project), Err(err)) => {
            log::error!("{} Failed {}: {}", label, project.path_with_namespace, err)
        }
        (None, Err(err)) => {
            log::error!("Stopping the run: {}", err);
            cancel.cancel();
        }
        (None, Ok(())) => {}
    }
}
