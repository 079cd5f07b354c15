mod config;
mod discovery;
mod error;
mod git;
mod gitlab;
mod groups;
mod os;
mod pipeline;
mod progress;
mod project;
mod stream;
#[cfg(test)]
mod testing;

use crate::config::Args;
use crate::gitlab::GitLab;
use crate::os::SystemOs;
use crate::pipeline::Summary;
use anyhow::Result;
use clap::Parser;
use console::style;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

fn print_summary(summary: &Summary) {
    let progress = summary.progress;
    println!(
        "{} {} projects: {} cloned, {} failed",
        style("Done.").bold(),
        progress.total,
        style(progress.succeeded).green(),
        if progress.failed > 0 {
            style(progress.failed).red()
        } else {
            style(progress.failed).dim()
        },
    );
    if summary.fetch_errors > 0 {
        println!(
            "{} {} groups or project listings could not be fetched",
            style("Warning:").yellow().bold(),
            summary.fetch_errors
        );
    }
}

/// Cancels `cancel` on the first Ctrl-C.
fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            res = signal::ctrl_c() => match res {
                Ok(()) => {
                    log::warn!("Interrupted, stopping");
                    cancel.cancel();
                }
                Err(e) => log::error!("Failed to install the Ctrl-C handler: {}", e),
            },
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::from_filename(".env.local").ok();
    dotenvy::dotenv().ok();

    let config = Args::parse().into_config()?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if config.access_token.is_empty() {
        eprintln!(
            "{} missing access token, set {} or pass --token",
            style("error:").red().bold(),
            style("RE_GITLAB_TOKEN").bold()
        );
        std::process::exit(1);
    }

    log::info!(
        "Starting gitlab_url={} output_dir={:?} method={} bare={} groups={:?} skip={:?} workers={} retries={} retry_delay={:?}",
        config.gitlab_url,
        config.output_dir,
        config.clone_method,
        config.clone_bare,
        config.group_ids,
        config.skip_group_ids,
        config.max_workers,
        config.max_retries,
        config.retry_delay
    );

    let client = Arc::new(GitLab::new(&config.gitlab_url, &config.access_token)?);
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let summary = pipeline::run(&cancel, Arc::new(config), client, Arc::new(SystemOs)).await;
    print_summary(&summary);

    if !summary.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
