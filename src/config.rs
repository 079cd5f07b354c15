use crate::git::CloneMethod;
use anyhow::{Context, Result};
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_GITLAB_URL: &str = "https://gitlab.com";
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_SECONDS: u64 = 2;

/// Clone every project of a set of GitLab groups
#[derive(Parser, Debug)]
#[command(name = "gitlab-repo-extractor", version, about, long_about = None)]
pub struct Args {
    /// Base URL of the GitLab instance
    #[arg(long, env = "RE_GITLAB_URL", default_value = DEFAULT_GITLAB_URL)]
    pub gitlab_url: String,

    /// Access token used for the API and for HTTPS clones
    #[arg(long, env = "RE_GITLAB_TOKEN", hide_env_values = true, default_value = "")]
    pub token: String,

    /// Directory the projects are cloned into (defaults to the working directory)
    #[arg(short, long, env = "RE_OUTPUT_DIR")]
    pub output_dir: Option<String>,

    /// Clone over SSH instead of HTTPS
    #[arg(long, env = "RE_USE_SSH", action = ArgAction::Set, num_args = 0..=1,
        default_value = "false", default_missing_value = "true",
        value_parser = BoolishValueParser::new())]
    pub use_ssh: bool,

    /// Create bare repositories
    #[arg(long, env = "RE_CLONE_BARE", action = ArgAction::Set, num_args = 0..=1,
        default_value = "true", default_missing_value = "true",
        value_parser = BoolishValueParser::new())]
    pub clone_bare: bool,

    /// Groups to extract, separated by commas or whitespace (all groups when empty)
    #[arg(short, long, env = "RE_GROUP_IDS", default_value = "")]
    pub group_ids: String,

    /// Groups to leave out, separated by commas or whitespace
    #[arg(short, long, env = "RE_SKIP_GROUP_IDS", default_value = "")]
    pub skip_group_ids: String,

    /// Number of concurrent workers per stage (defaults to the CPU count)
    #[arg(short = 'j', long, env = "RE_MAX_WORKERS")]
    pub max_workers: Option<usize>,

    /// Clone attempts per project
    #[arg(long, env = "RE_MAX_RETRIES", default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    /// Seconds to wait between clone attempts
    #[arg(long, env = "RE_RETRY_DELAY_SECONDS", default_value_t = DEFAULT_RETRY_DELAY_SECONDS)]
    pub retry_delay_seconds: u64,
}

/// Settings of one extraction run. Built once and shared read-only by every
/// stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub gitlab_url: String,
    pub access_token: String,
    pub output_dir: Option<PathBuf>,
    pub clone_method: CloneMethod,
    pub clone_bare: bool,
    pub group_ids: Vec<String>,
    pub skip_group_ids: Vec<String>,
    pub max_workers: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            gitlab_url: String::from(DEFAULT_GITLAB_URL),
            access_token: String::new(),
            output_dir: None,
            clone_method: CloneMethod::Https,
            clone_bare: true,
            group_ids: Vec::new(),
            skip_group_ids: Vec::new(),
            max_workers: default_max_workers(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_secs(DEFAULT_RETRY_DELAY_SECONDS),
        }
    }
}

impl Args {
    pub fn into_config(self) -> Result<RunConfig> {
        let output_dir = match self.output_dir.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(dir) => Some(
                expand_home(dir)
                    .with_context(|| format!("Invalid output directory: {}", dir))?,
            ),
        };

        let clone_method = if self.use_ssh {
            CloneMethod::Ssh
        } else {
            CloneMethod::Https
        };

        Ok(RunConfig {
            gitlab_url: self.gitlab_url.trim_end_matches('/').to_owned(),
            access_token: self.token,
            output_dir,
            clone_method,
            clone_bare: self.clone_bare,
            group_ids: parse_group_ids(&self.group_ids),
            skip_group_ids: parse_group_ids(&self.skip_group_ids),
            max_workers: self.max_workers.unwrap_or_else(default_max_workers).max(1),
            max_retries: self.max_retries.max(1),
            retry_delay: Duration::from_secs(self.retry_delay_seconds),
        })
    }
}

fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Splits a list of group IDs on commas and whitespace, dropping empty
/// entries and repeated IDs while keeping the first-seen order.
pub fn parse_group_ids(input: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for id in input
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
    {
        if !ids.iter().any(|seen| seen == id) {
            ids.push(id.to_owned());
        }
    }
    ids
}

fn expand_home(dir: &str) -> Result<PathBuf> {
    let rest = match dir.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest.trim_start_matches('/'),
        _ => return Ok(PathBuf::from(dir)),
    };

    let home = dirs::home_dir().with_context(|| "Failed to find the home directory")?;
    if rest.is_empty() {
        Ok(home)
    } else {
        Ok(home.join(Path::new(rest)))
    }
}
