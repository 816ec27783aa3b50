//! Wrapper around external version-control invocations.
//!
//! All shelling out to `git` goes through [`Git`] so that lock-contention
//! retries, stale-lock detection and logging stay in one place rather than
//! being reimplemented at each call site.

use std::path::Path;
use std::process::{Command, Output};
use std::thread;
use std::time::{Duration, SystemTime};

use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::{debug, warn};

/// Environment variable that opts into removing a stale `.git/index.lock`.
pub const STALE_LOCK_CLEANUP_ENV: &str = "GRAFT_REMOVE_STALE_LOCK";

/// Maximum age, before a `.git/index.lock` is considered stale enough to
/// remove when [`STALE_LOCK_CLEANUP_ENV`] is set.
const STALE_LOCK_AGE: Duration = Duration::from_secs(15 * 60);

/// Number of attempts for retry-on-lock-contention invocations.
const LOCK_RETRY_ATTEMPTS: u32 = 8;

/// Linear backoff step between lock-contention retries.
const LOCK_RETRY_BACKOFF: Duration = Duration::from_millis(250);

static LOCK_CONTENTION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    #[expect(clippy::unwrap_used, reason = "pattern is a compile-time constant")]
    Regex::new(r"(?i)unable to create .*index\.lock|index\.lock.*File exists").unwrap()
});

/// Errors raised while invoking the version-control tool.
#[derive(Debug, Error)]
pub enum GitError {
    /// The `git` process could not be spawned.
    #[error("failed to spawn git {args}: {source}")]
    Spawn {
        /// The arguments that were passed to `git`.
        args: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// `git` exited with a non-zero status.
    #[error("git {args} failed: {stderr}")]
    Failed {
        /// The arguments that were passed to `git`.
        args: String,
        /// The captured standard error, trimmed.
        stderr: String,
    },
}

/// Thin wrapper over `std::process::Command` for invoking `git`.
#[derive(Debug, Clone)]
pub struct Git {
    working_dir: std::path::PathBuf,
}

impl Git {
    /// Create a wrapper that runs `git` with the given working directory.
    #[must_use]
    pub fn new(working_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    fn spawn(&self, args: &[&str]) -> Result<Output, GitError> {
        let joined = args.join(" ");
        debug!(target: "graft::vcs", "running: git {joined}");
        Command::new("git")
            .args(args)
            .current_dir(&self.working_dir)
            .output()
            .map_err(|source| GitError::Spawn {
                args: joined,
                source,
            })
    }

    /// Run `git` with the given arguments and return stdout as a `String`,
    /// trimmed of trailing whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`GitError`] if the process cannot be spawned or exits with a
    /// non-zero status.
    pub fn run(&self, args: &[&str]) -> Result<String, GitError> {
        let output = self.spawn(args)?;
        if !output.status.success() {
            return Err(GitError::Failed {
                args: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }

    /// Run `git` with the given arguments, retrying on detected index-lock
    /// contention up to [`LOCK_RETRY_ATTEMPTS`] times with linear backoff.
    ///
    /// # Errors
    ///
    /// Returns [`GitError`] if every attempt fails, or if the final failure
    /// does not look like lock contention.
    pub fn run_retrying_on_lock(&self, args: &[&str]) -> Result<String, GitError> {
        self.check_stale_lock();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.run(args) {
                Ok(stdout) => return Ok(stdout),
                Err(GitError::Failed { args: a, stderr })
                    if attempt < LOCK_RETRY_ATTEMPTS && LOCK_CONTENTION_PATTERN.is_match(&stderr) =>
                {
                    warn!(
                        target: "graft::vcs",
                        attempt,
                        "git {a} hit index lock contention, retrying: {stderr}"
                    );
                    thread::sleep(LOCK_RETRY_BACKOFF * attempt);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Check for a stale `.git/index.lock` file, warning on every startup
    /// and optionally removing it when [`STALE_LOCK_CLEANUP_ENV`] is set and
    /// the lock is older than [`STALE_LOCK_AGE`].
    fn check_stale_lock(&self) {
        let lock_path = self.working_dir.join(".git").join("index.lock");
        let Ok(metadata) = std::fs::metadata(&lock_path) else {
            return;
        };
        warn!(
            target: "graft::vcs",
            path = %lock_path.display(),
            "found existing .git/index.lock"
        );
        let Ok(modified) = metadata.modified() else {
            return;
        };
        let Ok(age) = SystemTime::now().duration_since(modified) else {
            return;
        };
        if age < STALE_LOCK_AGE {
            return;
        }
        if std::env::var_os(STALE_LOCK_CLEANUP_ENV).is_none() {
            return;
        }
        warn!(
            target: "graft::vcs",
            path = %lock_path.display(),
            "removing stale index.lock older than 15 minutes"
        );
        if let Err(err) = std::fs::remove_file(&lock_path) {
            warn!(target: "graft::vcs", error = %err, "failed to remove stale index.lock");
        }
    }
}

/// Run an arbitrary external program (not `git`) in the given directory and
/// return its stdout as a `String`.
///
/// Used for `ninja -t compdb`, which is invoked the same way `git` is but
/// belongs to a different tool.
///
/// # Errors
///
/// Returns an [`std::io::Error`] if the process cannot be spawned, and a
/// [`GitError::Failed`]-shaped error via [`GitError`] is intentionally not
/// reused here since the caller is not `git`; callers wrap this in their own
/// domain error instead.
pub fn run_external(program: &str, args: &[&str], working_dir: &Path) -> std::io::Result<Output> {
    debug!(target: "graft::vcs", "running: {program} {}", args.join(" "));
    Command::new(program)
        .args(args)
        .current_dir(working_dir)
        .output()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_contention_pattern_matches_known_message() {
        let msg = "fatal: Unable to create '/repo/.git/index.lock': File exists.";
        assert!(LOCK_CONTENTION_PATTERN.is_match(msg));
    }

    #[test]
    fn lock_contention_pattern_rejects_unrelated_errors() {
        let msg = "fatal: not a git repository (or any of the parent directories): .git";
        assert!(!LOCK_CONTENTION_PATTERN.is_match(msg));
    }

    #[test]
    fn run_surfaces_stderr_on_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let git = Git::new(dir.path());
        let err = git.run(&["not-a-real-subcommand"]).expect_err("should fail");
        match err {
            GitError::Failed { stderr, .. } => assert!(!stderr.is_empty()),
            GitError::Spawn { .. } => panic!("expected Failed, got Spawn"),
        }
    }
}
