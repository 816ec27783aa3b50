//! Mirrors file timestamps from the source worktree onto the target.
//!
//! A freshly checked out worktree gives every file a "now" mtime, which
//! would make a copied build cache look entirely stale. Aligning mtimes
//! (and atimes) with the source restores the cache's validity.

use std::path::{Path, PathBuf};
use std::thread;

use anyhow::Result;
use filetime::{FileTime, set_file_atime, set_file_mtime};
use tracing::debug;
use walkdir::WalkDir;

use crate::orchestrator::RunContext;
use crate::pool;
use crate::status::{StatusReporter, Subtask};

const POOL_WIDTH: usize = 8;

/// This task always has something to check; per-file skips (missing at the
/// target, unreadable metadata) are handled silently inside the walk.
#[must_use]
pub fn should_run(_ctx: &RunContext) -> bool {
    true
}

/// The single subtask this task contributes.
#[must_use]
pub fn subtasks() -> Vec<Subtask> {
    vec![("timestamps", "mirror file timestamps".to_owned())]
}

/// Walk the source worktree and copy (atime, mtime) onto every
/// corresponding regular file that also exists in the target.
///
/// # Errors
///
/// Only fails if the source directory itself cannot be listed; individual
/// file failures are swallowed.
pub fn run(ctx: &RunContext, status: &dyn StatusReporter) -> Result<()> {
    status.start("timestamps");
    mirror(&ctx.pair.source, &ctx.pair.target);
    status.finish("timestamps");
    Ok(())
}

fn mirror(source: &Path, target: &Path) {
    let files: Vec<PathBuf> = WalkDir::new(source)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .collect();

    let chunks = pool::partition(files, POOL_WIDTH);
    thread::scope(|scope| {
        for chunk in chunks {
            scope.spawn(move || {
                for path in &chunk {
                    mirror_one(source, target, path);
                }
            });
        }
    });
}

fn mirror_one(source: &Path, target: &Path, source_path: &Path) {
    let Ok(relative) = source_path.strip_prefix(source) else {
        return;
    };
    let target_path = target.join(relative);
    if !target_path.is_file() {
        return;
    }

    let Ok(metadata) = std::fs::symlink_metadata(source_path) else {
        debug!(path = %source_path.display(), "could not stat source file, skipping");
        return;
    };
    if metadata.file_type().is_symlink() {
        return;
    }

    let mtime = FileTime::from_last_modification_time(&metadata);
    let atime = FileTime::from_last_access_time(&metadata);

    if let Err(err) = set_file_mtime(&target_path, mtime) {
        debug!(path = %target_path.display(), error = %err, "failed to set mtime, skipping");
        return;
    }
    if let Err(err) = set_file_atime(&target_path, atime) {
        debug!(path = %target_path.display(), error = %err, "failed to set atime, skipping");
    }
}
