use crate::config::RunConfig;
use crate::error::Error;
use crate::os::OsWrapper;
use crate::project::{CloneOutcome, Project};
use crate::stream::{channel, recv, send};
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;
use tokio::sync::{OnceCell, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum CloneMethod {
    Ssh,
    Https,
}

impl fmt::Display for CloneMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloneMethod::Ssh => f.write_str("ssh"),
            CloneMethod::Https => f.write_str("https"),
        }
    }
}

/// Injects `oauth2:<token>@` credentials into an `https://` URL. Any other
/// URL, or an empty token, is returned unchanged.
pub fn add_token_to_https_url(url: &str, token: &str) -> String {
    match url.strip_prefix("https://") {
        Some(rest) if !token.is_empty() => format!("https://oauth2:{}@{}", token, rest),
        _ => url.to_owned(),
    }
}

/// Clones projects with the `git` binary.
pub struct GitCloner {
    config: Arc<RunConfig>,
    os: Arc<dyn OsWrapper>,
}

impl GitCloner {
    pub fn new(config: Arc<RunConfig>, os: Arc<dyn OsWrapper>) -> Self {
        Self { config, os }
    }

    pub fn output_dir(&self) -> Option<&Path> {
        self.config.output_dir.as_deref()
    }

    pub fn project_dir(&self, project: &Project) -> PathBuf {
        match self.output_dir() {
            Some(dir) => dir.join(&project.path_with_namespace),
            None => PathBuf::from(&project.path_with_namespace),
        }
    }

    pub fn clone_url(&self, project: &Project) -> String {
        match self.config.clone_method {
            CloneMethod::Ssh => project.ssh_url_to_repo.clone(),
            CloneMethod::Https => {
                add_token_to_https_url(&project.http_url_to_repo, &self.config.access_token)
            }
        }
    }

    fn clone_args(&self, url: String, dir: &Path) -> Vec<OsString> {
        let mut args = vec![OsString::from("clone")];
        if self.config.clone_bare {
            args.push(OsString::from("--bare"));
        }
        args.push(OsString::from(url));
        args.push(dir.as_os_str().to_owned());
        args
    }

    /// Creates the output directory, if one is configured.
    async fn ensure_output_dir(&self) -> Result<(), Arc<io::Error>> {
        match self.output_dir() {
            Some(dir) => {
                log::debug!("Creating output directory {:?}", dir);
                self.os.make_dir_all(dir).await.map_err(Arc::new)
            }
            None => Ok(()),
        }
    }

    /// Clones `project`, retrying failed attempts up to the configured limit.
    ///
    /// An existing destination is reported without any attempt. Cancellation
    /// wins over the retry bookkeeping as soon as it is observed.
    pub async fn clone_project_with_retry(
        &self,
        cancel: &CancellationToken,
        project: &Project,
    ) -> Result<(), Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let dir = self.project_dir(project);
        match self.os.path_exists(&dir).await {
            Ok(false) => {}
            Ok(true) => return Err(Error::DirExists(dir)),
            Err(source) => return Err(Error::DirExistsCheck { dir, source }),
        }

        let max_retries = self.config.max_retries.max(1);
        let mut last_err = None;

        for attempt in 1..=max_retries {
            if attempt > 1 {
                log::debug!(
                    "Retrying project={} attempt={}/{}",
                    project.path_with_namespace,
                    attempt,
                    max_retries
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(self.config.retry_delay) => {}
                }
            }

            match self.clone_project(cancel, project, &dir).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    log::warn!(
                        "Failed to clone project={} attempt={}/{}",
                        project.path_with_namespace,
                        attempt,
                        max_retries
                    );
                    last_err = Some(err);
                }
            }

            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
        }

        Err(Error::RetriesExhausted {
            attempts: max_retries,
            source: Box::new(last_err.unwrap_or(Error::Cancelled)),
        })
    }

    async fn clone_project(
        &self,
        cancel: &CancellationToken,
        project: &Project,
        dir: &Path,
    ) -> Result<(), Error> {
        let args = self.clone_args(self.clone_url(project), dir);
        log::debug!(
            "Cloning project={} fs_path={:?} method={}",
            project.path_with_namespace,
            dir,
            self.config.clone_method
        );

        match self.os.run_command(cancel, "git", &args).await {
            Ok(_) => Ok(()),
            Err(source) => {
                if let Err(e) = self.os.remove_all(dir).await {
                    log::debug!("Failed to clean up {:?}: {}", dir, e);
                }
                Err(Error::Clone {
                    project: project.path_with_namespace.clone(),
                    output: String::from_utf8_lossy(source.output()).into_owned(),
                    source,
                })
            }
        }
    }
}

/// Clones every project read from `projects` with at most `max_workers`
/// clones running at once, producing one outcome per project.
///
/// The output directory is created once for the whole run. If that fails a
/// single outcome carrying the error is produced and cloning stops.
pub fn clone_projects(
    cancel: &CancellationToken,
    cloner: Arc<GitCloner>,
    max_workers: usize,
    mut projects: Receiver<Project>,
) -> Receiver<CloneOutcome> {
    let (tx_outcomes, rx_outcomes) = channel();
    let cancel = cancel.clone();

    tokio::spawn(async move {
        let output_dir_ready: Arc<OnceCell<Result<(), Arc<io::Error>>>> =
            Arc::new(OnceCell::new());
        let output_dir_reported: Arc<OnceCell<()>> = Arc::new(OnceCell::new());
        let semaphore = Arc::new(Semaphore::new(max_workers.max(1)));
        let mut workers = JoinSet::new();

        while let Some(project) = recv(&cancel, &mut projects).await {
            if let Some(Err(_)) = output_dir_ready.get() {
                break;
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let cancel = cancel.clone();
            let cloner = Arc::clone(&cloner);
            let output_dir_ready = Arc::clone(&output_dir_ready);
            let output_dir_reported = Arc::clone(&output_dir_reported);
            let tx_outcomes = tx_outcomes.clone();

            workers.spawn(async move {
                let _permit = permit;

                let ready = output_dir_ready
                    .get_or_init(|| cloner.ensure_output_dir())
                    .await;
                if let Err(source) = ready {
                    output_dir_reported
                        .get_or_init(|| async {
                            let err = Error::OutputDirNotCreated {
                                dir: cloner.output_dir().map(Path::to_owned).unwrap_or_default(),
                                source: Arc::clone(source),
                            };
                            log::error!("{}", err);
                            send(&cancel, &tx_outcomes, CloneOutcome::failed(None, err)).await;
                        })
                        .await;
                    return;
                }

                let outcome = match cloner.clone_project_with_retry(&cancel, &project).await {
                    Ok(()) => CloneOutcome::cloned(project),
                    Err(err) => {
                        log::debug!(
                            "Gave up on project={} err={}",
                            project.path_with_namespace,
                            err
                        );
                        CloneOutcome::failed(Some(project), err)
                    }
                };
                send(&cancel, &tx_outcomes, outcome).await;
            });
        }

        while workers.join_next().await.is_some() {}
        log::debug!("Finished cloning");
    });

    rx_outcomes
}
