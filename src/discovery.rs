use crate::error::Error;
use crate::gitlab::{ProjectsService, PAGE_SIZE};
use crate::project::{Group, Project};
use crate::stream::{channel, recv, send};
use std::sync::Arc;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Streams the projects directly owned by `group`, page by page.
pub fn fetch_group_projects(
    cancel: &CancellationToken,
    client: Arc<dyn ProjectsService>,
    group: Option<Arc<Group>>,
) -> (Receiver<Project>, Receiver<Error>) {
    let (tx_projects, rx_projects) = channel();
    let (tx_errors, rx_errors) = channel();
    let cancel = cancel.clone();

    tokio::spawn(async move {
        let Some(group) = group else {
            send(&cancel, &tx_errors, Error::NoGroupPassed).await;
            return;
        };

        let mut page = 0;
        loop {
            let projects = match client
                .list_group_projects(&cancel, group.id, page, PAGE_SIZE)
                .await
            {
                Ok(projects) => projects,
                Err(source) => {
                    let err = Error::ProjectsFetch {
                        group_id: group.id,
                        source,
                    };
                    send(&cancel, &tx_errors, err).await;
                    return;
                }
            };

            for record in projects.items.into_iter().flatten() {
                let project = Project::new(record, Arc::clone(&group));
                log::debug!(
                    "Discovered project={} group={}",
                    project.path_with_namespace,
                    group.full_path
                );
                if !send(&cancel, &tx_projects, project).await {
                    return;
                }
            }

            match projects.next_page {
                Some(next) => page = next,
                None => break,
            }
        }
    });

    (rx_projects, rx_errors)
}

/// Discovers the projects of every group read from `groups`, with at most
/// `max_workers` groups being listed at the same time.
pub fn proceed_groups(
    cancel: &CancellationToken,
    client: Arc<dyn ProjectsService>,
    max_workers: usize,
    mut groups: Receiver<Arc<Group>>,
) -> (Receiver<Project>, Receiver<Error>) {
    let (tx_projects, rx_projects) = channel();
    let (tx_errors, rx_errors) = channel();
    let cancel = cancel.clone();

    tokio::spawn(async move {
        let semaphore = Arc::new(Semaphore::new(max_workers.max(1)));
        let mut workers = JoinSet::new();

        while let Some(group) = recv(&cancel, &mut groups).await {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let cancel = cancel.clone();
            let client = Arc::clone(&client);
            let tx_projects = tx_projects.clone();
            let tx_errors = tx_errors.clone();
            workers.spawn(async move {
                forward_group_projects(&cancel, client, group, &tx_projects, &tx_errors).await;
                drop(permit);
            });
        }

        while workers.join_next().await.is_some() {}
        log::debug!("Finished discovering projects");
    });

    (rx_projects, rx_errors)
}

async fn forward_group_projects(
    cancel: &CancellationToken,
    client: Arc<dyn ProjectsService>,
    group: Arc<Group>,
    tx_projects: &Sender<Project>,
    tx_errors: &Sender<Error>,
) {
    log::debug!("Discovering projects of group={}", group.full_path);
    let (mut projects, mut errors) = fetch_group_projects(cancel, client, Some(group));
    let (mut projects_open, mut errors_open) = (true, true);

    while projects_open || errors_open {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            project = projects.recv(), if projects_open => match project {
                Some(project) => {
                    if !send(cancel, tx_projects, project).await {
                        return;
                    }
                }
                None => projects_open = false,
            },
            err = errors.recv(), if errors_open => match err {
                Some(err) => {
                    if !send(cancel, tx_errors, err).await {
                        return;
                    }
                }
                None => errors_open = false,
            },
        }
    }
}
