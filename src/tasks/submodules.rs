//! Reconstitutes submodule working trees from the shared modules store and
//! re-pins them to the commit the target branch actually records.
//!
//! Deliberately bypasses the version-control tool's own submodule-update
//! machinery: that command rewrites the shared modules configuration, which
//! is owned by the source worktree, not the target.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::orchestrator::RunContext;
use crate::pool;
use crate::retry;
use crate::status::{StatusReporter, Subtask};
use crate::vcs::Git;
use crate::worktree;

/// Width of the thread pool copying submodule trees in parallel.
const COPY_POOL_WIDTH: usize = 4;

/// Errors specific to the submodule grafting task.
#[derive(Debug, Error)]
pub enum SubmoduleError {
    /// The computed destination would live inside the source worktree.
    #[error("refusing to write submodule {name} into the source worktree")]
    DestinationInsideSource {
        /// The submodule's manifest name.
        name: String,
    },

    /// Copying the working tree or git directory failed.
    #[error("copying submodule {name} failed: {source}")]
    Copy {
        /// The submodule's manifest name.
        name: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Running the version-control tool failed.
    #[error(transparent)]
    Git(#[from] crate::vcs::GitError),
}

/// A submodule's manifest entry: its name, checkout location, and remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmoduleDescriptor {
    /// The manifest key (the dotted name between `submodule.` and
    /// `.path`/`.url`); may itself contain dots.
    pub name: String,
    /// The submodule's checkout location, relative to a worktree root.
    pub relative_path: PathBuf,
    /// The submodule's configured remote, if the manifest records one.
    pub url: Option<String>,
}

/// Runs whenever the target worktree has a submodule manifest at all.
#[must_use]
pub fn should_run(ctx: &RunContext) -> bool {
    ctx.pair.target.join(".gitmodules").is_file()
}

/// The subtasks this task contributes.
#[must_use]
pub fn subtasks() -> Vec<Subtask> {
    vec![
        ("submodules:copy", "copy submodule checkouts".to_owned()),
        ("submodules:repin", "re-pin submodules to target HEAD".to_owned()),
    ]
}

enum ManifestField {
    Path,
    Url,
}

fn parse_manifest_line(line: &str) -> Option<(&str, ManifestField, &str)> {
    let (key, value) = line.split_once(' ')?;
    let rest = key.strip_prefix("submodule.")?;
    if let Some(name) = rest.strip_suffix(".path") {
        Some((name, ManifestField::Path, value))
    } else if let Some(name) = rest.strip_suffix(".url") {
        Some((name, ManifestField::Url, value))
    } else {
        None
    }
}

/// Parse `.gitmodules` (via `git config --get-regexp`, which emits lines of
/// the form `submodule.<name>.<field> <value>`) into descriptors.
///
/// # Errors
///
/// Returns [`SubmoduleError::Git`] if the version-control tool cannot be
/// invoked.
pub fn parse_manifest(worktree_root: &Path) -> Result<Vec<SubmoduleDescriptor>, SubmoduleError> {
    let git = Git::new(worktree_root);
    let stdout = match git.run(&[
        "config",
        "--file",
        ".gitmodules",
        "--get-regexp",
        r"^submodule\..*\.(path|url)$",
    ]) {
        Ok(stdout) => stdout,
        Err(crate::vcs::GitError::Failed { .. }) => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut names: Vec<String> = Vec::new();
    let mut paths: std::collections::HashMap<String, String> = std::collections::HashMap::new();
    let mut urls: std::collections::HashMap<String, String> = std::collections::HashMap::new();

    for line in stdout.lines() {
        let Some((name, field, value)) = parse_manifest_line(line) else {
            continue;
        };
        if !names.iter().any(|existing| existing == name) {
            names.push(name.to_owned());
        }
        match field {
            ManifestField::Path => {
                paths.insert(name.to_owned(), value.to_owned());
            }
            ManifestField::Url => {
                urls.insert(name.to_owned(), value.to_owned());
            }
        }
    }

    Ok(names
        .into_iter()
        .filter_map(|name| {
            let relative_path = PathBuf::from(paths.get(&name)?);
            let url = urls.get(&name).cloned();
            Some(SubmoduleDescriptor {
                name,
                relative_path,
                url,
            })
        })
        .collect())
}

fn is_nonempty_dir(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Graft submodule checkouts onto the target: copy what can be copied from
/// the source, re-pin everything to the target's recorded commits, and
/// clone whatever neither side has.
///
/// # Errors
///
/// Returns an error if a copy, clone or re-pin step fails outright; per-file
/// copy retries are exhausted before surfacing.
pub fn run(ctx: &RunContext, status: &dyn StatusReporter) -> Result<()> {
    status.start("submodules:copy");
    let descriptors = parse_manifest(&ctx.pair.target).context("parsing submodule manifest")?;

    let (copyable, needs_clone): (Vec<_>, Vec<_>) = descriptors.into_iter().partition(|descriptor| {
        is_nonempty_dir(&ctx.pair.source.join(&descriptor.relative_path))
    });

    copy_all(&ctx.pair, &copyable, status)?;
    status.finish("submodules:copy");

    status.start("submodules:repin");
    let head_entries = list_head_commit_entries(&ctx.pair.target)?;
    repin_all(&ctx.pair.target, &copyable, &head_entries);
    clone_all(&ctx.pair.target, &needs_clone, &head_entries, status);
    status.finish("submodules:repin");

    Ok(())
}

fn copy_all(
    pair: &worktree::WorktreePair,
    descriptors: &[SubmoduleDescriptor],
    status: &dyn StatusReporter,
) -> Result<()> {
    if descriptors.is_empty() {
        return Ok(());
    }
    let refs: Vec<&SubmoduleDescriptor> = descriptors.iter().collect();
    let chunks = pool::partition(refs, COPY_POOL_WIDTH);
    let results: Vec<Result<()>> = thread::scope(|scope| {
        let handles: Vec<_> = chunks
            .into_iter()
            .map(|chunk| {
                scope.spawn(move || -> Result<()> {
                    for descriptor in chunk {
                        copy_one(pair, descriptor)?;
                    }
                    Ok(())
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or_else(|_| Err(anyhow::anyhow!("submodule copy thread panicked"))))
            .collect()
    });

    for result in results {
        if let Err(err) = result {
            status.log(&format!("submodule copy failed: {err}"));
            return Err(err);
        }
    }
    Ok(())
}

fn copy_one(pair: &worktree::WorktreePair, descriptor: &SubmoduleDescriptor) -> Result<()> {
    let source_path = pair.source.join(&descriptor.relative_path);
    let target_path = pair.target.join(&descriptor.relative_path);

    if target_path.starts_with(&pair.source) {
        return Err(SubmoduleError::DestinationInsideSource {
            name: descriptor.name.clone(),
        }
        .into());
    }

    if target_path.exists() {
        fs::remove_dir_all(&target_path)
            .with_context(|| format!("removing existing {}", target_path.display()))?;
    }
    fs::create_dir_all(&target_path)
        .with_context(|| format!("creating {}", target_path.display()))?;

    copy_tree_excluding_git(&source_path, &target_path, &descriptor.name)?;

    if let Some(modules_dir) = worktree::modules_dir(&pair.target) {
        let module_git_dir = modules_dir.join(&descriptor.name);
        if module_git_dir.is_dir() {
            let dest_git_dir = target_path.join(".git");
            copy_git_directory(&module_git_dir, &dest_git_dir, &descriptor.name)?;
            unset_core_worktree(&dest_git_dir);
        }
    }

    Ok(())
}

fn copy_tree_excluding_git(source: &Path, target: &Path, name: &str) -> Result<()> {
    for entry in WalkDir::new(source)
        .into_iter()
        .filter_entry(|entry| entry.file_name() != ".git")
    {
        let entry = entry.with_context(|| format!("walking {}", source.display()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .with_context(|| format!("relativizing {}", entry.path().display()))?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let dest = target.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest).with_context(|| format!("creating {}", dest.display()))?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
            }
            let source_file = entry.path().to_path_buf();
            let dest_file = dest.clone();
            retry::with_backoff(|| fs::copy(&source_file, &dest_file).map(|_| ()))
                .map_err(|source| SubmoduleError::Copy {
                    name: name.to_owned(),
                    source,
                })?;
        }
    }
    Ok(())
}

fn copy_git_directory(source: &Path, target: &Path, name: &str) -> Result<()> {
    for entry in WalkDir::new(source) {
        let entry = entry.with_context(|| format!("walking {}", source.display()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .with_context(|| format!("relativizing {}", entry.path().display()))?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let dest = target.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest).with_context(|| format!("creating {}", dest.display()))?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
            }
            let source_file = entry.path().to_path_buf();
            let dest_file = dest.clone();
            retry::with_backoff(|| fs::copy(&source_file, &dest_file).map(|_| ()))
                .map_err(|source| SubmoduleError::Copy {
                    name: name.to_owned(),
                    source,
                })?;
            make_writable(&dest_file);
        }
    }
    Ok(())
}

fn make_writable(path: &Path) {
    let Ok(metadata) = fs::metadata(path) else {
        return;
    };
    let mut permissions = metadata.permissions();
    if permissions.readonly() {
        permissions.set_readonly(false);
        let _ = fs::set_permissions(path, permissions);
    }
}

fn unset_core_worktree(git_dir: &Path) {
    let git = Git::new(git_dir);
    match git.run_retrying_on_lock(&["config", "--unset", "core.worktree"]) {
        Ok(_) | Err(crate::vcs::GitError::Failed { .. }) => {}
        Err(err) => debug!(error = %err, "failed to unset core.worktree"),
    }
}

/// One `(relative_path, commit)` entry from the target's `HEAD` tree whose
/// mode marks it as a submodule (gitlink) entry.
#[derive(Debug, Clone)]
struct HeadCommitEntry {
    relative_path: PathBuf,
    commit: String,
}

fn list_head_commit_entries(target: &Path) -> Result<Vec<HeadCommitEntry>, SubmoduleError> {
    let git = Git::new(target);
    let stdout = match git.run(&["ls-tree", "-z", "-r", "HEAD"]) {
        Ok(stdout) => stdout,
        Err(crate::vcs::GitError::Failed { .. }) => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    Ok(stdout
        .split('\0')
        .filter_map(|record| {
            let (info, path) = record.split_once('\t')?;
            let mut fields = info.split_whitespace();
            let mode = fields.next()?;
            let _object_type = fields.next()?;
            let commit = fields.next()?;
            if mode != "160000" {
                return None;
            }
            Some(HeadCommitEntry {
                relative_path: PathBuf::from(path),
                commit: commit.to_owned(),
            })
        })
        .collect())
}

fn repin_all(target: &Path, copyable: &[SubmoduleDescriptor], head_entries: &[HeadCommitEntry]) {
    for descriptor in copyable {
        let Some(entry) = head_entries
            .iter()
            .find(|entry| entry.relative_path == descriptor.relative_path)
        else {
            continue;
        };
        let submodule_dir = target.join(&descriptor.relative_path);
        let git = Git::new(&submodule_dir);
        if let Err(err) = git.run_retrying_on_lock(&["checkout", "--detach", "--quiet", &entry.commit]) {
            warn!(
                submodule = %descriptor.name,
                commit = %entry.commit,
                error = %err,
                "failed to re-pin submodule to target HEAD commit"
            );
        }
    }
}

fn clone_all(
    target: &Path,
    needs_clone: &[SubmoduleDescriptor],
    head_entries: &[HeadCommitEntry],
    status: &dyn StatusReporter,
) {
    for descriptor in needs_clone {
        let Some(url) = descriptor.url.as_deref() else {
            continue;
        };
        let submodule_dir = target.join(&descriptor.relative_path);
        let parent_dir = Git::new(target);
        if let Err(err) = parent_dir.run_retrying_on_lock(&[
            "clone",
            "--quiet",
            url,
            &submodule_dir.to_string_lossy(),
        ]) {
            status.log(&format!("cloning submodule {} failed: {err}", descriptor.name));
            continue;
        }

        let Some(entry) = head_entries
            .iter()
            .find(|entry| entry.relative_path == descriptor.relative_path)
        else {
            continue;
        };

        let git = Git::new(&submodule_dir);
        let fetched = git
            .run_retrying_on_lock(&["fetch", "--quiet", "origin", &entry.commit])
            .is_ok();
        if !fetched {
            warn!(
                submodule = %descriptor.name,
                commit = %entry.commit,
                "could not fetch exact commit, checkout may fall back to default branch ancestry"
            );
        }
        if let Err(err) = git.run_retrying_on_lock(&["checkout", "--detach", "--quiet", &entry.commit]) {
            warn!(submodule = %descriptor.name, error = %err, "failed to check out cloned submodule's pinned commit");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_manifest_line_path_and_url() {
        let line = "submodule.vendor.lib.path libs/vendor.lib";
        let (name, field, value) = parse_manifest_line(line).expect("should parse");
        assert_eq!(name, "vendor.lib");
        assert!(matches!(field, ManifestField::Path));
        assert_eq!(value, "libs/vendor.lib");
    }

    #[test]
    fn ignores_unrelated_config_lines() {
        assert!(parse_manifest_line("core.bare false").is_none());
    }

    #[test]
    fn parses_gitlink_entries_from_ls_tree_output() {
        let record = "160000 commit abc123\tlibs/widget";
        let (info, path) = record.split_once('\t').expect("has tab");
        let mut fields = info.split_whitespace();
        assert_eq!(fields.next(), Some("160000"));
        assert_eq!(fields.next(), Some("commit"));
        assert_eq!(fields.next(), Some("abc123"));
        assert_eq!(path, "libs/widget");
    }
}
