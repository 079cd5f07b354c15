use async_trait::async_trait;
use reqwest::Url;
use std::ffi::{OsStr, OsString};
use std::io;
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {}", describe_exit(.code))]
    Exit {
        program: String,
        code: Option<i32>,
        output: Vec<u8>,
    },

    #[error("{program} was cancelled")]
    Cancelled { program: String },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {}", code),
        None => String::from("a signal"),
    }
}

impl CommandError {
    /// Combined output captured before the command failed.
    pub fn output(&self) -> &[u8] {
        match self {
            CommandError::Exit { output, .. } => output,
            _ => &[],
        }
    }
}

/// Strips credentials from URL arguments so command lines can be logged.
fn redact_args(args: &[OsString]) -> Vec<String> {
    args.iter().map(|arg| redact_arg(arg)).collect()
}

fn redact_arg(arg: &OsStr) -> String {
    let arg = arg.to_string_lossy();
    match Url::parse(&arg) {
        Ok(mut url) if !url.username().is_empty() || url.password().is_some() => {
            if url.set_username("").and(url.set_password(None)).is_ok() {
                url.into()
            } else {
                String::from("<redacted>")
            }
        }
        _ => arg.into_owned(),
    }
}

/// Filesystem and process operations used by the clone stage.
#[async_trait]
pub trait OsWrapper: Send + Sync {
    async fn path_exists(&self, path: &Path) -> io::Result<bool>;

    /// Creates `path` and its parents; succeeds if it already exists.
    async fn make_dir_all(&self, path: &Path) -> io::Result<()>;

    async fn remove_all(&self, path: &Path) -> io::Result<()>;

    /// Runs `program` to completion and returns its combined output.
    async fn run_command(
        &self,
        cancel: &CancellationToken,
        program: &str,
        args: &[OsString],
    ) -> Result<Vec<u8>, CommandError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemOs;

#[async_trait]
impl OsWrapper for SystemOs {
    async fn path_exists(&self, path: &Path) -> io::Result<bool> {
        match tokio::fs::metadata(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn make_dir_all(&self, path: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }

    async fn remove_all(&self, path: &Path) -> io::Result<()> {
        match tokio::fs::remove_dir_all(path).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            res => res,
        }
    }

    async fn run_command(
        &self,
        cancel: &CancellationToken,
        program: &str,
        args: &[OsString],
    ) -> Result<Vec<u8>, CommandError> {
        log::debug!(
            "Running command program={} args={:?}",
            program,
            redact_args(args)
        );

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::Spawn {
                program: program.to_owned(),
                source,
            })?;

        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(CommandError::Cancelled { program: program.to_owned() });
            }
            output = child.wait_with_output() => output.map_err(|source| CommandError::Spawn {
                program: program.to_owned(),
                source,
            })?,
        };

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);

        if output.status.success() {
            Ok(combined)
        } else {
            Err(CommandError::Exit {
                program: program.to_owned(),
                code: output.status.code(),
                output: combined,
            })
        }
    }
}
