//! Copies build directories the target is missing and fixes up embedded
//! absolute paths so a ninja + CMake build tree considers the copied cache
//! valid at its new location.

pub mod cmake_rewrite;
pub mod ninja_deps;
pub mod ninja_log;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::orchestrator::RunContext;
use crate::retry;
use crate::status::{StatusReporter, Subtask};

const CANDIDATE_NAMES: [&str; 3] = ["build", ".build", "_build"];

/// Runs whenever either worktree has a build directory worth copying or
/// fixing up.
#[must_use]
pub fn should_run(ctx: &RunContext) -> bool {
    let plan = plan(&ctx.pair.source, &ctx.pair.target);
    !plan.to_copy.is_empty() || !plan.to_fix.is_empty()
}

/// The subtasks this task contributes.
#[must_use]
pub fn subtasks() -> Vec<Subtask> {
    vec![
        ("build_cache:ninja-deps", "patch ninja dependency database".to_owned()),
        ("build_cache:ninja-log", "rehash ninja execution log".to_owned()),
        ("build_cache:cmake", "rewrite CMake build-tree paths".to_owned()),
    ]
}

/// Which build directories need copying, and which need their embedded
/// paths fixed, expressed as paths relative to a worktree root.
#[derive(Debug, Clone, Default)]
struct BuildCachePlan {
    to_copy: Vec<PathBuf>,
    to_fix: Vec<PathBuf>,
}

/// Find every directory under `root` matching the `build`, `build/*`,
/// `.build` or `_build` patterns, dropping any entry that is itself an
/// ancestor of a more specific entry already in the list.
fn discover_build_dirs(root: &Path) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    for name in CANDIDATE_NAMES {
        let path = root.join(name);
        if path.is_dir() {
            candidates.push(path);
        }
    }

    let build_dir = root.join("build");
    if build_dir.is_dir()
        && let Ok(entries) = fs::read_dir(&build_dir)
    {
        for entry in entries.flatten() {
            if entry.path().is_dir() {
                candidates.push(entry.path());
            }
        }
    }

    filter_ancestors(candidates)
}

fn filter_ancestors(mut dirs: Vec<PathBuf>) -> Vec<PathBuf> {
    dirs.sort();
    dirs.dedup();
    dirs.iter()
        .filter(|candidate| {
            !dirs
                .iter()
                .any(|other| other != *candidate && other.starts_with(candidate))
        })
        .cloned()
        .collect()
}

fn plan(source: &Path, target: &Path) -> BuildCachePlan {
    let relative = |root: &Path, dirs: Vec<PathBuf>| -> Vec<PathBuf> {
        dirs.into_iter()
            .filter_map(|dir| dir.strip_prefix(root).ok().map(Path::to_path_buf))
            .collect()
    };

    let source_relative = relative(source, discover_build_dirs(source));
    let target_relative = relative(target, discover_build_dirs(target));

    let to_copy: Vec<PathBuf> = source_relative
        .iter()
        .filter(|rel| !target_relative.contains(rel))
        .cloned()
        .collect();

    let mut to_fix = target_relative;
    to_fix.extend(to_copy.iter().cloned());
    to_fix.sort();
    to_fix.dedup();

    BuildCachePlan { to_copy, to_fix }
}

/// Copy directories missing from the target, then fix up embedded paths in
/// every build directory that now exists at the target.
///
/// # Errors
///
/// Returns an error if copying a build directory or any of the three
/// fixups fails outright.
pub fn run(ctx: &RunContext, status: &dyn StatusReporter) -> Result<()> {
    let plan = plan(&ctx.pair.source, &ctx.pair.target);
    let source_str = ctx.pair.source.to_string_lossy().into_owned();
    let target_str = ctx.pair.target.to_string_lossy().into_owned();

    for relative in &plan.to_copy {
        copy_build_dir(&ctx.pair.source.join(relative), &ctx.pair.target.join(relative))?;
    }

    status.start("build_cache:ninja-deps");
    for relative in &plan.to_fix {
        let deps_path = ctx.pair.target.join(relative).join(".ninja_deps");
        if deps_path.is_file() {
            ninja_deps::patch(&deps_path, source_str.as_bytes(), target_str.as_bytes())?;
        }
    }
    status.finish("build_cache:ninja-deps");

    status.start("build_cache:ninja-log");
    for relative in &plan.to_fix {
        let build_dir = ctx.pair.target.join(relative);
        let log_path = build_dir.join(".ninja_log");
        if log_path.is_file() {
            match ninja_log::command_map(&build_dir) {
                Ok(commands) => ninja_log::rehash(&log_path, &build_dir, &commands)?,
                Err(err) => status.log(&format!(
                    "could not recompute compilation database for {}: {err}",
                    build_dir.display()
                )),
            }
        }
    }
    status.finish("build_cache:ninja-log");

    status.start("build_cache:cmake");
    for relative in &plan.to_fix {
        let build_dir = ctx.pair.target.join(relative);
        cmake_rewrite::rewrite_tree(&build_dir, &source_str, &target_str)?;
    }
    status.finish("build_cache:cmake");

    Ok(())
}

fn copy_build_dir(source: &Path, target: &Path) -> Result<()> {
    fs::create_dir_all(target).with_context(|| format!("creating {}", target.display()))?;
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
                .with_context(|| format!("copying {}", source_file.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovers_top_level_build_directory() {
        let root = tempfile::tempdir().expect("tempdir");
        fs::create_dir(root.path().join("build")).expect("mkdir build");
        let dirs = discover_build_dirs(root.path());
        assert_eq!(dirs, vec![root.path().join("build")]);
    }

    #[test]
    fn ancestor_dropped_in_favour_of_more_specific_child() {
        let root = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(root.path().join("build").join("debug")).expect("mkdir build/debug");
        let dirs = discover_build_dirs(root.path());
        assert_eq!(dirs, vec![root.path().join("build").join("debug")]);
    }

    #[test]
    fn plan_marks_source_only_dirs_as_to_copy() {
        let source = tempfile::tempdir().expect("tempdir");
        let target = tempfile::tempdir().expect("tempdir");
        fs::create_dir(source.path().join("build")).expect("mkdir");

        let plan = plan(source.path(), target.path());
        assert_eq!(plan.to_copy, vec![PathBuf::from("build")]);
        assert_eq!(plan.to_fix, vec![PathBuf::from("build")]);
    }

    #[test]
    fn plan_marks_preexisting_target_dirs_as_to_fix_only() {
        let source = tempfile::tempdir().expect("tempdir");
        let target = tempfile::tempdir().expect("tempdir");
        fs::create_dir(target.path().join("build")).expect("mkdir");

        let plan = plan(source.path(), target.path());
        assert!(plan.to_copy.is_empty());
        assert_eq!(plan.to_fix, vec![PathBuf::from("build")]);
    }
}
