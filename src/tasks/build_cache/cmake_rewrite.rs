//! Rewrites embedded absolute source paths inside CMake-generated text
//! files (rule files, compile commands, configured headers) so a copied
//! build tree resolves to the target location.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, Result};
use filetime::FileTime;
use walkdir::WalkDir;

use crate::pool;

/// Width of the per-build-directory worker pool rewriting files.
const POOL_WIDTH: usize = 8;

/// Walk every regular, non-symlink file under `build_dir` and replace every
/// occurrence of `source` with `target`, preserving (atime, mtime) on any
/// file actually rewritten. Files that do not decode as UTF-8 are treated
/// as binary and skipped.
///
/// # Errors
///
/// Returns an error if any file's rewrite fails to complete (read, write or
/// the mtime restore itself).
pub fn rewrite_tree(build_dir: &Path, source: &str, target: &str) -> Result<()> {
    let files: Vec<PathBuf> = WalkDir::new(build_dir)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .collect();

    let chunks = pool::partition(files, POOL_WIDTH);
    let results: Vec<Result<()>> = thread::scope(|scope| {
        let handles: Vec<_> = chunks
            .into_iter()
            .map(|chunk| {
                scope.spawn(move || -> Result<()> {
                    for path in &chunk {
                        rewrite_file(path, source, target)?;
                    }
                    Ok(())
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or_else(|_| Err(anyhow::anyhow!("cmake rewrite thread panicked"))))
            .collect()
    });

    for result in results {
        result?;
    }
    Ok(())
}

fn rewrite_file(path: &Path, source: &str, target: &str) -> Result<()> {
    let metadata = fs::symlink_metadata(path).with_context(|| format!("stat {}", path.display()))?;
    if metadata.file_type().is_symlink() {
        return Ok(());
    }

    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let Ok(text) = String::from_utf8(bytes) else {
        return Ok(());
    };
    if !text.contains(source) {
        return Ok(());
    }

    let rewritten = text.replace(source, target);
    let atime = FileTime::from_last_access_time(&metadata);
    let mtime = FileTime::from_last_modification_time(&metadata);

    fs::write(path, rewritten).with_context(|| format!("writing {}", path.display()))?;
    filetime::set_file_times(path, atime, mtime)
        .with_context(|| format!("restoring timestamps on {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_matching_text_and_restores_mtime() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("rules.ninja");
        fs::write(&file, "cd /src/project && cc -c foo.c").expect("write file");

        let old_time = FileTime::from_unix_time(1_000_000, 0);
        filetime::set_file_mtime(&file, old_time).expect("set mtime");

        rewrite_tree(dir.path(), "/src/project", "/tmp/new/project").expect("rewrite");

        let contents = fs::read_to_string(&file).expect("read back");
        assert_eq!(contents, "cd /tmp/new/project && cc -c foo.c");

        let metadata = fs::metadata(&file).expect("metadata");
        assert_eq!(FileTime::from_last_modification_time(&metadata), old_time);
    }

    #[test]
    fn leaves_non_matching_files_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("unrelated.txt");
        fs::write(&file, "nothing to see here").expect("write file");

        rewrite_tree(dir.path(), "/src/project", "/tmp/new/project").expect("rewrite");

        let contents = fs::read_to_string(&file).expect("read back");
        assert_eq!(contents, "nothing to see here");
    }

    #[test]
    fn skips_binary_files_without_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("object.bin");
        fs::write(&file, [0xff, 0xfe, 0x00, 0xfd]).expect("write binary file");

        rewrite_tree(dir.path(), "/src/project", "/tmp/new/project").expect("rewrite should not fail");
    }
}
