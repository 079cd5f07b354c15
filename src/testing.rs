//! In-memory stand-ins for the GitLab API and the OS, shared by the unit tests.

use crate::error::ApiError;
use crate::gitlab::{GroupsService, Page, ProjectsService};
use crate::os::{CommandError, OsWrapper};
use crate::project::{Group, ProjectRecord};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc::Receiver;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub async fn collect<T>(mut rx: Receiver<T>) -> Vec<T> {
    let mut items = Vec::new();
    while let Some(item) = rx.recv().await {
        items.push(item);
    }
    items
}

pub fn group(id: u64, full_path: &str) -> Group {
    Group {
        id,
        full_path: full_path.to_owned(),
    }
}

pub fn project_record(id: u64, path_with_namespace: &str) -> ProjectRecord {
    let path = path_with_namespace
        .rsplit('/')
        .next()
        .unwrap_or(path_with_namespace);
    ProjectRecord {
        id,
        ssh_url_to_repo: format!("git@gitlab.test:{}.git", path_with_namespace),
        http_url_to_repo: format!("https://gitlab.test/{}.git", path_with_namespace),
        path: path.to_owned(),
        path_with_namespace: path_with_namespace.to_owned(),
    }
}

async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Counts a call as running until dropped, recording the peak.
struct InFlight<'a> {
    current: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(current: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { current }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct FakeGitLab {
    groups: BTreeMap<u64, Group>,
    subgroups: HashMap<u64, Vec<u64>>,
    projects: HashMap<u64, Vec<ProjectRecord>>,
    page_size: usize,
    null_entries: bool,
    honour_skip_list: bool,
    delay: Duration,
    fail_get_group: bool,
    fail_list_groups_page: Option<u32>,
    fail_subgroups_of: HashSet<u64>,
    fail_projects_of: HashSet<u64>,
    calls: Mutex<HashMap<&'static str, usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeGitLab {
    pub fn new() -> Self {
        Self {
            groups: BTreeMap::new(),
            subgroups: HashMap::new(),
            projects: HashMap::new(),
            page_size: 100,
            null_entries: false,
            honour_skip_list: true,
            delay: Duration::ZERO,
            fail_get_group: false,
            fail_list_groups_page: None,
            fail_subgroups_of: HashSet::new(),
            fail_projects_of: HashSet::new(),
            calls: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_groups(mut self, groups: impl IntoIterator<Item = Group>) -> Self {
        self.groups.extend(groups.into_iter().map(|g| (g.id, g)));
        self
    }

    pub fn with_subgroups(mut self, parent: u64, children: impl IntoIterator<Item = u64>) -> Self {
        self.subgroups.entry(parent).or_default().extend(children);
        self
    }

    pub fn with_projects(
        mut self,
        group_id: u64,
        projects: impl IntoIterator<Item = ProjectRecord>,
    ) -> Self {
        self.projects.entry(group_id).or_default().extend(projects);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Adds a `null` entry at the start of every page.
    pub fn with_null_entries(mut self) -> Self {
        self.null_entries = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Lists skipped groups anyway, like a server that drops `skip_groups[]`.
    pub fn ignoring_skip_list(mut self) -> Self {
        self.honour_skip_list = false;
        self
    }

    pub fn failing_get_group(mut self) -> Self {
        self.fail_get_group = true;
        self
    }

    pub fn failing_list_groups_on_page(mut self, page: u32) -> Self {
        self.fail_list_groups_page = Some(page);
        self
    }

    pub fn failing_list_subgroups_of(mut self, id: u64) -> Self {
        self.fail_subgroups_of.insert(id);
        self
    }

    pub fn failing_list_projects_of(mut self, id: u64) -> Self {
        self.fail_projects_of.insert(id);
        self
    }

    pub fn calls(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(method)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    /// Peak number of service calls running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, method: &'static str) -> InFlight<'_> {
        *self.calls.lock().unwrap().entry(method).or_default() += 1;
        InFlight::enter(&self.in_flight, &self.max_in_flight)
    }

    fn skipped(&self, skip_ids: &[u64], id: u64) -> bool {
        self.honour_skip_list && skip_ids.contains(&id)
    }

    fn server_error(what: String) -> ApiError {
        ApiError::Status {
            status: 500,
            url: what,
            body: String::from("internal error"),
        }
    }

    fn paginate<T: Clone>(&self, items: &[T], page: u32) -> Page<T> {
        let page = page.max(1) as usize;
        let start = ((page - 1) * self.page_size).min(items.len());
        let end = (start + self.page_size).min(items.len());

        let mut out: Vec<Option<T>> = items[start..end].iter().cloned().map(Some).collect();
        if self.null_entries {
            out.insert(0, None);
        }

        Page {
            items: out,
            next_page: (end < items.len()).then(|| page as u32 + 1),
        }
    }
}

#[async_trait]
impl GroupsService for FakeGitLab {
    async fn get_group(&self, cancel: &CancellationToken, id: &str) -> Result<Group, ApiError> {
        let _call = self.record("get_group");
        if !pause(cancel, self.delay).await {
            return Err(ApiError::Cancelled);
        }
        if self.fail_get_group {
            return Err(Self::server_error(format!("groups/{}", id)));
        }

        self.groups
            .values()
            .find(|g| g.id.to_string() == id || g.full_path == id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("group {}", id)))
    }

    async fn list_groups(
        &self,
        cancel: &CancellationToken,
        skip_ids: &[u64],
        page: u32,
        _per_page: u32,
    ) -> Result<Page<Group>, ApiError> {
        let _call = self.record("list_groups");
        if !pause(cancel, self.delay).await {
            return Err(ApiError::Cancelled);
        }
        if self.fail_list_groups_page == Some(page) {
            return Err(Self::server_error(String::from("groups")));
        }

        let groups: Vec<Group> = self
            .groups
            .values()
            .filter(|g| !self.skipped(skip_ids, g.id))
            .cloned()
            .collect();
        Ok(self.paginate(&groups, page))
    }

    async fn list_subgroups(
        &self,
        cancel: &CancellationToken,
        id: u64,
        skip_ids: &[u64],
        page: u32,
        _per_page: u32,
    ) -> Result<Page<Group>, ApiError> {
        let _call = self.record("list_subgroups");
        if !pause(cancel, self.delay).await {
            return Err(ApiError::Cancelled);
        }
        if self.fail_subgroups_of.contains(&id) {
            return Err(Self::server_error(format!("groups/{}/subgroups", id)));
        }

        let children: Vec<Group> = self
            .subgroups
            .get(&id)
            .into_iter()
            .flatten()
            .filter(|child| !self.skipped(skip_ids, **child))
            .filter_map(|child| self.groups.get(child).cloned())
            .collect();
        Ok(self.paginate(&children, page))
    }
}

#[async_trait]
impl ProjectsService for FakeGitLab {
    async fn list_group_projects(
        &self,
        cancel: &CancellationToken,
        group_id: u64,
        page: u32,
        _per_page: u32,
    ) -> Result<Page<ProjectRecord>, ApiError> {
        let _call = self.record("list_group_projects");
        if !pause(cancel, self.delay).await {
            return Err(ApiError::Cancelled);
        }
        if self.fail_projects_of.contains(&group_id) {
            return Err(Self::server_error(format!("groups/{}/projects", group_id)));
        }

        let projects = self.projects.get(&group_id).cloned().unwrap_or_default();
        Ok(self.paginate(&projects, page))
    }
}

/// Fake filesystem and git binary.
pub struct FakeOs {
    existing: HashSet<PathBuf>,
    exists_err: bool,
    mkdir_err: bool,
    failing_commands: usize,
    command_delay: Duration,
    mkdir_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    commands: Mutex<Vec<(Instant, Vec<OsString>)>>,
    removed: Mutex<Vec<PathBuf>>,
}

impl FakeOs {
    pub fn new() -> Self {
        Self {
            existing: HashSet::new(),
            exists_err: false,
            mkdir_err: false,
            failing_commands: 0,
            command_delay: Duration::ZERO,
            mkdir_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            commands: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
        }
    }

    pub fn with_existing(mut self, path: impl Into<PathBuf>) -> Self {
        self.existing.insert(path.into());
        self
    }

    pub fn failing_exists_check(mut self) -> Self {
        self.exists_err = true;
        self
    }

    pub fn failing_mkdir(mut self) -> Self {
        self.mkdir_err = true;
        self
    }

    /// The first `n` commands fail; `usize::MAX` makes every command fail.
    pub fn failing_commands(mut self, n: usize) -> Self {
        self.failing_commands = n;
        self
    }

    pub fn with_command_delay(mut self, delay: Duration) -> Self {
        self.command_delay = delay;
        self
    }

    pub fn mkdir_calls(&self) -> usize {
        self.mkdir_calls.load(Ordering::SeqCst)
    }

    /// Peak number of commands running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<Vec<OsString>> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .map(|(_, args)| args.clone())
            .collect()
    }

    pub fn command_times(&self) -> Vec<Instant> {
        self.commands.lock().unwrap().iter().map(|(at, _)| *at).collect()
    }

    pub fn removed(&self) -> Vec<PathBuf> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl OsWrapper for FakeOs {
    async fn path_exists(&self, path: &Path) -> io::Result<bool> {
        if self.exists_err {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "permission denied"));
        }
        Ok(self.existing.contains(path))
    }

    async fn make_dir_all(&self, _path: &Path) -> io::Result<()> {
        self.mkdir_calls.fetch_add(1, Ordering::SeqCst);
        // Widen the window in which concurrent callers could race.
        tokio::task::yield_now().await;
        if self.mkdir_err {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "permission denied"));
        }
        Ok(())
    }

    async fn remove_all(&self, path: &Path) -> io::Result<()> {
        self.removed.lock().unwrap().push(path.to_owned());
        Err(io::Error::new(io::ErrorKind::Other, "ignored"))
    }

    async fn run_command(
        &self,
        cancel: &CancellationToken,
        program: &str,
        args: &[OsString],
    ) -> Result<Vec<u8>, CommandError> {
        let _running = InFlight::enter(&self.in_flight, &self.max_in_flight);
        let count = {
            let mut commands = self.commands.lock().unwrap();
            let mut line = vec![OsString::from(program)];
            line.extend(args.iter().cloned());
            commands.push((Instant::now(), line));
            commands.len()
        };

        if !pause(cancel, self.command_delay).await {
            return Err(CommandError::Cancelled {
                program: program.to_owned(),
            });
        }

        if count <= self.failing_commands {
            return Err(CommandError::Exit {
                program: program.to_owned(),
                code: Some(128),
                output: format!("fatal: attempt {} failed", count).into_bytes(),
            });
        }
        Ok(b"Cloning...".to_vec())
    }
}
