//! Progress reporting for the task orchestrator.
//!
//! Each enabled task contributes one or more named subtasks up front; the
//! reporter owns one progress line per subtask and transitions it through
//! pending, active, done and failed states as the orchestrator runs.

use std::io::{self, Write};
use std::sync::Mutex;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

/// A subtask identifier paired with its human-readable caption.
pub type Subtask = (&'static str, String);

fn pending_message(caption: &str) -> String {
    format!("  pending  {caption}")
}

fn active_message(caption: &str) -> String {
    format!("  active   {caption}")
}

fn done_message(caption: &str) -> String {
    format!("  done     {caption}")
}

fn failed_message(caption: &str) -> String {
    format!("  failed   {caption}")
}

/// Reports subtask lifecycle transitions and ad hoc log lines.
pub trait StatusReporter: Send + Sync {
    /// Mark a subtask as actively running.
    fn start(&self, key: &str);
    /// Mark a subtask as finished successfully.
    fn finish(&self, key: &str);
    /// Mark a subtask as finished with an error.
    fn fail(&self, key: &str);
    /// Emit a standalone log line, clearing progress bars first if needed.
    fn log(&self, message: &str);
}

/// Reporter that discards everything; used for non-interactive runs.
pub struct SilentReporter;

impl StatusReporter for SilentReporter {
    fn start(&self, _key: &str) {}
    fn finish(&self, _key: &str) {}
    fn fail(&self, _key: &str) {}
    fn log(&self, _message: &str) {}
}

struct IndicatifState {
    progress: MultiProgress,
    bars: Vec<(String, String, ProgressBar)>,
}

impl IndicatifState {
    fn index_of(&self, key: &str) -> Option<usize> {
        self.bars.iter().position(|(k, _, _)| k == key)
    }
}

/// Reporter backed by `indicatif::MultiProgress`, one line per subtask.
pub struct IndicatifReporter {
    state: Mutex<IndicatifState>,
}

impl IndicatifReporter {
    /// Build a reporter with one pending line per subtask, in the given
    /// order.
    #[must_use]
    pub fn new(subtasks: &[Subtask]) -> Self {
        let progress = MultiProgress::with_draw_target(ProgressDrawTarget::stderr_with_hz(12));
        progress.set_move_cursor(false);
        let style =
            ProgressStyle::with_template("{msg}").unwrap_or_else(|_| ProgressStyle::default_spinner());

        let mut bars = Vec::with_capacity(subtasks.len());
        for (key, caption) in subtasks {
            let bar = progress.add(ProgressBar::new(1));
            bar.set_style(style.clone());
            bar.set_message(pending_message(caption));
            bars.push(((*key).to_owned(), caption.clone(), bar));
        }

        Self {
            state: Mutex::new(IndicatifState { progress, bars }),
        }
    }
}

impl StatusReporter for IndicatifReporter {
    fn start(&self, key: &str) {
        let state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(index) = state.index_of(key)
            && let Some((_, caption, bar)) = state.bars.get(index)
        {
            bar.set_message(active_message(caption));
        }
    }

    fn finish(&self, key: &str) {
        let state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(index) = state.index_of(key)
            && let Some((_, caption, bar)) = state.bars.get(index)
        {
            bar.finish_with_message(done_message(caption));
        }
    }

    fn fail(&self, key: &str) {
        let state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(index) = state.index_of(key)
            && let Some((_, caption, bar)) = state.bars.get(index)
        {
            bar.finish_with_message(failed_message(caption));
        }
    }

    fn log(&self, message: &str) {
        let state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if state.progress.println(message).is_err() {
            drop(writeln!(io::stderr(), "{message}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subtasks() -> Vec<Subtask> {
        vec![
            ("timestamps", "mirror file timestamps".to_owned()),
            ("submodules", "re-pin submodule checkouts".to_owned()),
        ]
    }

    #[test]
    fn silent_reporter_does_nothing_observable() {
        let reporter = SilentReporter;
        reporter.start("timestamps");
        reporter.finish("timestamps");
        reporter.fail("submodules");
        reporter.log("ignored");
    }

    #[test]
    fn indicatif_reporter_transitions_known_keys_without_panicking() {
        let reporter = IndicatifReporter::new(&subtasks());
        reporter.start("timestamps");
        reporter.finish("timestamps");
        reporter.start("submodules");
        reporter.fail("submodules");
        reporter.log("all subtasks settled");
    }

    #[test]
    fn indicatif_reporter_ignores_unknown_keys() {
        let reporter = IndicatifReporter::new(&subtasks());
        reporter.start("not-a-real-task");
        reporter.finish("not-a-real-task");
        reporter.fail("not-a-real-task");
    }
}
