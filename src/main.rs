//! Application entry point.
//!
//! Parses command-line arguments, resolves the source/target worktree pair
//! (auto-detecting whichever of `--source`, `--remote-url` and `--branch`
//! were omitted), and delegates to the task orchestrator.

use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use graft::cli::Cli;
use graft::orchestrator::{Orchestrator, RunContext};
use graft::status::{IndicatifReporter, Subtask};
use graft::vcs::Git;
use graft::worktree;
use tracing::{Level, debug, error};
use tracing_subscriber::fmt;

fn main() -> ExitCode {
    let cli = Cli::parse();
    let max_level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    fmt().with_max_level(max_level).init();

    match run(&cli) {
        Ok(code) => code,
        Err(err) => {
            error!(error = %err, "graft failed");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<ExitCode> {
    let target = cli.worktree_path.clone().into_std_path_buf();
    if !target.exists() {
        anyhow::bail!("worktree path does not exist: {}", target.display());
    }

    let Some(source) = resolve_source(cli, &target)? else {
        debug!("no other worktree found, nothing to graft");
        return Ok(ExitCode::SUCCESS);
    };

    let pair = worktree::validate(&source, &target).context("validating worktree pair")?;

    let remote_url = cli
        .remote_url
        .clone()
        .or_else(|| detect_remote_url(&pair.target));
    let branch = cli.branch.clone().or_else(|| detect_branch(&pair.target));

    let ctx = RunContext {
        pair,
        remote_url,
        branch,
    };

    let orchestrator = Orchestrator::with_all_tasks();
    let enabled = orchestrator.enabled_tasks(&ctx);
    if enabled.is_empty() {
        debug!("no task has anything to do");
        return Ok(ExitCode::SUCCESS);
    }

    let subtasks: Vec<Subtask> = enabled.iter().flat_map(|task| task.subtasks()).collect();
    let reporter = IndicatifReporter::new(&subtasks);

    match orchestrator.run(&ctx, &reporter) {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(err) => {
            error!(error = %err, "graft failed");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn resolve_source(cli: &Cli, target: &Path) -> Result<Option<std::path::PathBuf>> {
    if let Some(source) = &cli.source {
        return Ok(Some(source.clone().into_std_path_buf()));
    }
    worktree::find_primary(target).context("probing for primary worktree")
}

fn detect_remote_url(target: &Path) -> Option<String> {
    Git::new(target)
        .run(&["remote", "get-url", "origin"])
        .ok()
        .filter(|value| !value.is_empty())
}

fn detect_branch(target: &Path) -> Option<String> {
    Git::new(target)
        .run(&["branch", "--show-current"])
        .ok()
        .filter(|value| !value.is_empty())
}
