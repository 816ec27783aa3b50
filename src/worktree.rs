//! Discovery and validation of the source/target worktree pair.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::vcs::Git;

/// Errors raised while discovering or validating a worktree pair.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Neither the source nor the target path exists on disk.
    #[error("path does not exist: {0}")]
    PathMissing(PathBuf),

    /// The source and target canonicalize to the same path.
    #[error("source and target are the same worktree: {0}")]
    SameWorktree(PathBuf),

    /// A path is not inside any git repository.
    #[error("{0} is not inside a git repository")]
    NotARepository(PathBuf),

    /// The source and target belong to different repositories.
    #[error(
        "source and target do not share a repository: {source_common_dir} != {target_common_dir}"
    )]
    DifferentRepositories {
        /// Common object-store directory resolved from the source path.
        source_common_dir: PathBuf,
        /// Common object-store directory resolved from the target path.
        target_common_dir: PathBuf,
    },

    /// Running `git` itself failed.
    #[error(transparent)]
    Git(#[from] crate::vcs::GitError),
}

/// A validated `(source, target)` worktree pair sharing one object store.
#[derive(Debug, Clone)]
pub struct WorktreePair {
    /// The worktree cached state is copied from.
    pub source: PathBuf,
    /// The freshly created worktree being grafted onto.
    pub target: PathBuf,
}

/// Resolve the common (shared) object-store directory for `path`, or `None`
/// if `path` is not inside a git repository.
#[must_use]
pub fn common_dir(path: &Path) -> Option<PathBuf> {
    let git = Git::new(path);
    let dir = git.run(&["rev-parse", "--git-common-dir"]).ok()?;
    let dir = PathBuf::from(dir);
    let absolute = if dir.is_relative() { path.join(dir) } else { dir };
    absolute.canonicalize().ok()
}

/// Resolve the shared `modules/` directory (holding per-submodule git
/// directories) for `path`, or `None` if it cannot be determined.
#[must_use]
pub fn modules_dir(path: &Path) -> Option<PathBuf> {
    let common = common_dir(path)?;
    let modules = common.join("modules");
    if modules.is_dir() { Some(modules) } else { None }
}

/// A single record from `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct WorktreeRecord {
    path: PathBuf,
}

/// Parse `git worktree list --porcelain` output into worktree paths, in the
/// order git reports them (the first record is always the primary/main
/// worktree).
fn parse_porcelain_worktrees(stdout: &str) -> Vec<WorktreeRecord> {
    stdout
        .split("\n\n")
        .filter_map(|record| {
            record
                .lines()
                .find_map(|line| line.strip_prefix("worktree "))
                .map(|path| WorktreeRecord {
                    path: PathBuf::from(path),
                })
        })
        .collect()
}

/// Find the first worktree listed for the repository containing `target`
/// that is not `target` itself.
///
/// Returns `None` when `target` is the only worktree — the caller should
/// treat this as "nothing to do" and exit successfully, per the Open
/// Question in the design notes: this heuristic assumes the caller is
/// invoking `graft` from the newly created worktree, not from some other
/// secondary worktree.
///
/// # Errors
///
/// Returns [`ProbeError::Git`] if `git worktree list` fails.
pub fn find_primary(target: &Path) -> Result<Option<PathBuf>, ProbeError> {
    let git = Git::new(target);
    let stdout = git.run(&["worktree", "list", "--porcelain"])?;
    let records = parse_porcelain_worktrees(&stdout);

    let canonical_target = target.canonicalize().unwrap_or_else(|_| target.to_path_buf());

    for record in records {
        let canonical = record
            .path
            .canonicalize()
            .unwrap_or_else(|_| record.path.clone());
        if canonical != canonical_target {
            return Ok(Some(record.path));
        }
    }
    Ok(None)
}

/// Validate that `source` and `target` are distinct worktrees of the same
/// repository.
///
/// # Errors
///
/// Returns a [`ProbeError`] variant describing why the pair is invalid.
pub fn validate(source: &Path, target: &Path) -> Result<WorktreePair, ProbeError> {
    if !source.exists() {
        return Err(ProbeError::PathMissing(source.to_path_buf()));
    }
    if !target.exists() {
        return Err(ProbeError::PathMissing(target.to_path_buf()));
    }

    let canonical_source = source
        .canonicalize()
        .map_err(|_| ProbeError::NotARepository(source.to_path_buf()))?;
    let canonical_target = target
        .canonicalize()
        .map_err(|_| ProbeError::NotARepository(target.to_path_buf()))?;

    if canonical_source == canonical_target {
        return Err(ProbeError::SameWorktree(canonical_source));
    }

    let source_common_dir =
        common_dir(&canonical_source).ok_or_else(|| ProbeError::NotARepository(canonical_source.clone()))?;
    let target_common_dir =
        common_dir(&canonical_target).ok_or_else(|| ProbeError::NotARepository(canonical_target.clone()))?;

    if source_common_dir != target_common_dir {
        return Err(ProbeError::DifferentRepositories {
            source_common_dir,
            target_common_dir,
        });
    }

    Ok(WorktreePair {
        source: canonical_source,
        target: canonical_target,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_record() {
        let stdout = "worktree /repo\nHEAD abc123\nbranch refs/heads/main\n";
        let records = parse_porcelain_worktrees(stdout);
        assert_eq!(records, vec![WorktreeRecord { path: PathBuf::from("/repo") }]);
    }

    #[test]
    fn parses_multiple_blank_line_separated_records() {
        let stdout = "worktree /repo\nHEAD abc\nbranch refs/heads/main\n\nworktree /repo.feature\nHEAD def\nbranch refs/heads/feature\n";
        let records = parse_porcelain_worktrees(stdout);
        assert_eq!(
            records,
            vec![
                WorktreeRecord { path: PathBuf::from("/repo") },
                WorktreeRecord { path: PathBuf::from("/repo.feature") },
            ]
        );
    }

    #[test]
    fn validate_rejects_missing_paths() {
        let err = validate(Path::new("/no/such/source"), Path::new("/no/such/target"))
            .expect_err("should fail");
        assert!(matches!(err, ProbeError::PathMissing(_)));
    }

    #[test]
    fn validate_rejects_identical_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = validate(dir.path(), dir.path()).expect_err("should fail");
        assert!(matches!(err, ProbeError::SameWorktree(_)));
    }
}
