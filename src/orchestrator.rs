//! Parallel dispatch of the enabled tasks onto a bounded thread pool.

use std::thread;

use anyhow::Result;

use crate::status::{StatusReporter, Subtask};
use crate::tasks::{build_cache, settings, submodules, timestamps};
use crate::worktree::WorktreePair;

/// Everything a task needs to decide whether it should run and, if so, how
/// to run.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// The validated source/target worktree pair.
    pub pair: WorktreePair,
    /// Remote URL used by the settings propagator, if known.
    pub remote_url: Option<String>,
    /// Branch name used by the settings propagator, if known.
    pub branch: Option<String>,
}

/// One unit of grafting work. Variants carry no state of their own; all the
/// data a task needs comes from the shared [`RunContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    /// Mirror file timestamps from source to target.
    Timestamps,
    /// Graft submodule checkouts.
    Submodules,
    /// Fix embedded absolute paths in copied build directories.
    BuildCache,
    /// Propagate assistant trust settings.
    Settings,
}

impl Task {
    /// The four tasks the orchestrator knows about, in declaration order.
    pub const ALL: [Self; 4] = [Self::Timestamps, Self::Submodules, Self::BuildCache, Self::Settings];

    /// A short, human-readable caption for error reporting.
    #[must_use]
    pub const fn caption(self) -> &'static str {
        match self {
            Self::Timestamps => "timestamp mirror",
            Self::Submodules => "submodule grafter",
            Self::BuildCache => "build cache fixup",
            Self::Settings => "settings propagator",
        }
    }

    /// Probe whether this task has anything to do for `ctx`. Called once,
    /// sequentially, for every task before any task runs.
    #[must_use]
    pub fn should_run(self, ctx: &RunContext) -> bool {
        match self {
            Self::Timestamps => timestamps::should_run(ctx),
            Self::Submodules => submodules::should_run(ctx),
            Self::BuildCache => build_cache::should_run(ctx),
            Self::Settings => settings::should_run(ctx),
        }
    }

    /// The named subtasks this task contributes to the status display.
    #[must_use]
    pub fn subtasks(self) -> Vec<Subtask> {
        match self {
            Self::Timestamps => timestamps::subtasks(),
            Self::Submodules => submodules::subtasks(),
            Self::BuildCache => build_cache::subtasks(),
            Self::Settings => settings::subtasks(),
        }
    }

    /// Run this task to completion.
    ///
    /// # Errors
    ///
    /// Returns an error if the task fails; the orchestrator treats this as
    /// that task's single failure and drains the others regardless.
    pub fn run(self, ctx: &RunContext, status: &dyn StatusReporter) -> Result<()> {
        match self {
            Self::Timestamps => timestamps::run(ctx, status),
            Self::Submodules => submodules::run(ctx, status),
            Self::BuildCache => build_cache::run(ctx, status),
            Self::Settings => settings::run(ctx, status),
        }
    }
}

/// Gates, dispatches and aggregates the outcome of the task set.
pub struct Orchestrator {
    tasks: Vec<Task>,
}

impl Orchestrator {
    /// Build an orchestrator over the given tasks, in the order they should
    /// be probed.
    #[must_use]
    pub const fn new(tasks: Vec<Task>) -> Self {
        Self { tasks }
    }

    /// Build an orchestrator carrying all four known tasks.
    #[must_use]
    pub fn with_all_tasks() -> Self {
        Self::new(Task::ALL.to_vec())
    }

    /// Which tasks are enabled for `ctx`, probed sequentially in
    /// declaration order.
    #[must_use]
    pub fn enabled_tasks(&self, ctx: &RunContext) -> Vec<Task> {
        self.tasks
            .iter()
            .copied()
            .filter(|task| task.should_run(ctx))
            .collect()
    }

    /// Run every enabled task concurrently on a thread pool whose width
    /// equals the number of enabled tasks, draining all of them before
    /// returning the first failure, if any.
    ///
    /// # Errors
    ///
    /// Returns the first task's error, by dispatch order, if any task
    /// failed.
    pub fn run(&self, ctx: &RunContext, status: &dyn StatusReporter) -> Result<()> {
        let enabled = self.enabled_tasks(ctx);
        if enabled.is_empty() {
            return Ok(());
        }

        let results: Vec<(Task, Result<()>)> = thread::scope(|scope| {
            let handles: Vec<_> = enabled
                .iter()
                .map(|&task| scope.spawn(move || (task, task.run(ctx, status))))
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        (
                            Task::Timestamps,
                            Err(anyhow::anyhow!("task panicked")),
                        )
                    })
                })
                .collect()
        });

        let mut first_error = None;
        for (task, result) in results {
            if let Err(err) = result {
                status.log(&format!("{} failed: {err}", task.caption()));
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn ctx() -> RunContext {
        RunContext {
            pair: WorktreePair {
                source: PathBuf::from("/tmp/graft-test-source"),
                target: PathBuf::from("/tmp/graft-test-target"),
            },
            remote_url: None,
            branch: None,
        }
    }

    #[test]
    fn empty_task_list_runs_cleanly() {
        let orchestrator = Orchestrator::new(vec![]);
        let status = crate::status::SilentReporter;
        assert!(orchestrator.run(&ctx(), &status).is_ok());
    }

    #[test]
    fn all_tasks_constant_has_four_entries() {
        assert_eq!(Task::ALL.len(), 4);
    }
}
