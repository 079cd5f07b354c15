//! Resolution of the configured groups into a stream of [`Group`]s.
//!
//! With explicit group IDs every configured group is fetched and its
//! subgroup tree is walked breadth-first, one worker per top-level group.
//! Without them every group visible to the token is listed. Both modes
//! honour the skip list at every pagination level.

use crate::config::RunConfig;
use crate::error::Error;
use crate::gitlab::{GroupsService, PAGE_SIZE};
use crate::project::Group;
use crate::stream::{channel, send};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub fn fetch_groups(
    cancel: &CancellationToken,
    client: Arc<dyn GroupsService>,
    config: Arc<RunConfig>,
) -> (Receiver<Arc<Group>>, Receiver<Error>) {
    if config.group_ids.is_empty() {
        fetch_all_groups(cancel, client, config)
    } else {
        fetch_groups_by_ids(cancel, client, config)
    }
}

pub fn fetch_all_groups(
    cancel: &CancellationToken,
    client: Arc<dyn GroupsService>,
    config: Arc<RunConfig>,
) -> (Receiver<Arc<Group>>, Receiver<Error>) {
    let (tx_groups, rx_groups) = channel();
    let (tx_errors, rx_errors) = channel();
    let cancel = cancel.clone();

    tokio::spawn(async move {
        let skip_ids =
            match fetch_skipped_group_ids(&cancel, client.as_ref(), &config.skip_group_ids).await {
                Ok(ids) => ids,
                Err(err) => {
                    send(&cancel, &tx_errors, err).await;
                    return;
                }
            };

        let mut page = 0;
        loop {
            let groups = match client.list_groups(&cancel, &skip_ids, page, PAGE_SIZE).await {
                Ok(groups) => groups,
                Err(err) => {
                    send(&cancel, &tx_errors, Error::GroupsFetch(err)).await;
                    return;
                }
            };
            log::debug!(
                "Fetched groups page={} count={}",
                page,
                groups.items.len()
            );

            for group in groups.items.into_iter().flatten() {
                if skip_ids.contains(&group.id) {
                    continue;
                }
                if !send(&cancel, &tx_groups, Arc::new(group)).await {
                    return;
                }
            }

            match groups.next_page {
                Some(next) => page = next,
                None => break,
            }
        }

        log::debug!("Finished listing groups");
    });

    (rx_groups, rx_errors)
}

/// Removes skipped and repeated IDs, keeping the order of `group_ids`.
pub fn filter_group_ids(group_ids: &[String], skip_group_ids: &[String]) -> Vec<String> {
    let skip: HashSet<&str> = skip_group_ids.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();

    group_ids
        .iter()
        .filter(|id| !skip.contains(id.as_str()) && seen.insert(id.as_str()))
        .cloned()
        .collect()
}

pub fn fetch_groups_by_ids(
    cancel: &CancellationToken,
    client: Arc<dyn GroupsService>,
    config: Arc<RunConfig>,
) -> (Receiver<Arc<Group>>, Receiver<Error>) {
    let (tx_groups, rx_groups) = channel();
    let (tx_errors, rx_errors) = channel();
    let cancel = cancel.clone();

    tokio::spawn(async move {
        if config.group_ids.is_empty() {
            send(&cancel, &tx_errors, Error::NoGroupIds).await;
            return;
        }

        let group_ids = filter_group_ids(&config.group_ids, &config.skip_group_ids);
        if group_ids.is_empty() {
            send(&cancel, &tx_errors, Error::AllGroupIdsSkipped).await;
            return;
        }

        let skip_ids =
            match fetch_skipped_group_ids(&cancel, client.as_ref(), &config.skip_group_ids).await {
                Ok(ids) => Arc::new(ids),
                Err(err) => {
                    send(&cancel, &tx_errors, err).await;
                    return;
                }
            };

        let semaphore = Arc::new(Semaphore::new(config.max_workers.max(1)));
        let mut workers = JoinSet::new();

        for group_id in group_ids {
            let cancel = cancel.clone();
            let client = Arc::clone(&client);
            let semaphore = Arc::clone(&semaphore);
            let skip_ids = Arc::clone(&skip_ids);
            let tx_groups = tx_groups.clone();
            let tx_errors = tx_errors.clone();

            workers.spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                };

                let res = walk_group_tree(
                    &cancel,
                    client.as_ref(),
                    &group_id,
                    &skip_ids,
                    &tx_groups,
                )
                .await;
                if let Err(err) = res {
                    log::debug!("Stopped walking group={} err={}", group_id, err);
                    send(&cancel, &tx_errors, err).await;
                }
            });
        }

        while workers.join_next().await.is_some() {}
        log::debug!("Finished resolving groups");
    });

    (rx_groups, rx_errors)
}

/// Emits `group_id` and then every group below it in breadth-first order.
///
/// Returns early without an error when the receiver is gone or the token is
/// cancelled.
async fn walk_group_tree(
    cancel: &CancellationToken,
    client: &dyn GroupsService,
    group_id: &str,
    skip_ids: &[u64],
    tx_groups: &Sender<Arc<Group>>,
) -> Result<(), Error> {
    let root = fetch_group_by_id(cancel, client, group_id).await?;
    // The root may be configured under another alias than its skip entry.
    if skip_ids.contains(&root.id) {
        log::debug!("Skipping group={} id={}", group_id, root.id);
        return Ok(());
    }
    let mut frontier = VecDeque::from([root.id]);

    if !send(cancel, tx_groups, Arc::new(root)).await {
        return Ok(());
    }

    while let Some(parent_id) = frontier.pop_front() {
        if cancel.is_cancelled() {
            return Ok(());
        }

        for group in fetch_subgroups(cancel, client, parent_id, skip_ids).await? {
            frontier.push_back(group.id);
            if !send(cancel, tx_groups, Arc::new(group)).await {
                return Ok(());
            }
        }
    }

    Ok(())
}

/// Resolves skip IDs (numeric or full paths) to numeric group IDs. Groups
/// that do not exist are ignored.
pub async fn fetch_skipped_group_ids(
    cancel: &CancellationToken,
    client: &dyn GroupsService,
    group_ids: &[String],
) -> Result<Vec<u64>, Error> {
    let mut skip_ids = Vec::with_capacity(group_ids.len());

    for group_id in group_ids {
        match fetch_group_by_id(cancel, client, group_id).await {
            Ok(group) => skip_ids.push(group.id),
            Err(err) if err.is_group_not_found() => {
                log::debug!("Ignoring unknown skipped group={}", group_id);
            }
            Err(err) => return Err(err),
        }
    }

    Ok(skip_ids)
}

/// Lists every page of direct subgroups of `group_id`.
pub async fn fetch_subgroups(
    cancel: &CancellationToken,
    client: &dyn GroupsService,
    group_id: u64,
    skip_ids: &[u64],
) -> Result<Vec<Group>, Error> {
    let mut subgroups = Vec::new();
    let mut page = 0;

    loop {
        let groups = client
            .list_subgroups(cancel, group_id, skip_ids, page, PAGE_SIZE)
            .await
            .map_err(|source| Error::SubGroupsFetch { group_id, source })?;

        subgroups.extend(
            groups
                .items
                .into_iter()
                .flatten()
                .filter(|group| !skip_ids.contains(&group.id)),
        );

        match groups.next_page {
            Some(next) => page = next,
            None => break,
        }
    }

    Ok(subgroups)
}

pub async fn fetch_group_by_id(
    cancel: &CancellationToken,
    client: &dyn GroupsService,
    group_id: &str,
) -> Result<Group, Error> {
    client
        .get_group(cancel, group_id)
        .await
        .map_err(|source| Error::GroupFetch {
            group_id: group_id.to_owned(),
            source,
        })
}
