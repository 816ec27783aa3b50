//! Recomputes command hashes and mtimes in ninja's execution log
//! (`.ninja_log`) so a copied build cache matches its new location.
//!
//! The hash function must match ninja's own command-line hashing exactly;
//! substituting anything else invalidates every entry in the log.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::vcs;

#[derive(Debug, Deserialize)]
struct CompDbEntry {
    #[serde(default)]
    #[expect(dead_code, reason = "kept for shape-fidelity with ninja's compdb emitter")]
    directory: String,
    command: String,
    file: String,
}

/// Build the `output_path -> command` map from the build tool's
/// compilation-database emitter (`ninja -t compdb`).
///
/// # Errors
///
/// Returns an error if the `ninja` process cannot be spawned, exits
/// non-zero, or emits output that is not a valid compilation database.
pub fn command_map(build_dir: &Path) -> Result<HashMap<String, String>> {
    let output = vcs::run_external("ninja", &["-t", "compdb"], build_dir)
        .with_context(|| format!("invoking ninja -t compdb in {}", build_dir.display()))?;
    if !output.status.success() {
        bail!(
            "ninja -t compdb exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    let entries: Vec<CompDbEntry> = serde_json::from_slice(&output.stdout)
        .context("parsing ninja -t compdb output as JSON")?;
    Ok(entries
        .into_iter()
        .map(|entry| (entry.file, entry.command))
        .collect())
}

/// Rewrite every data line of the execution log at `log_path`: refresh the
/// mtime field from disk when the output still exists, and recompute the
/// command hash when a command is known for that output. Comment and blank
/// lines pass through unchanged.
///
/// # Errors
///
/// Returns an error only on I/O failure reading or writing `log_path`.
pub fn rehash(log_path: &Path, build_dir: &Path, commands: &HashMap<String, String>) -> Result<()> {
    let content = fs::read_to_string(log_path).with_context(|| format!("reading {}", log_path.display()))?;
    let had_trailing_newline = content.ends_with('\n');

    let rewritten_lines: Vec<String> = content
        .lines()
        .map(|line| rehash_line(line, build_dir, commands))
        .collect();

    let mut rewritten = rewritten_lines.join("\n");
    if had_trailing_newline {
        rewritten.push('\n');
    }

    if rewritten != content {
        fs::write(log_path, rewritten).with_context(|| format!("writing {}", log_path.display()))?;
    }
    Ok(())
}

fn rehash_line(line: &str, build_dir: &Path, commands: &HashMap<String, String>) -> String {
    if line.starts_with('#') || line.trim().is_empty() {
        return line.to_owned();
    }

    let fields: Vec<&str> = line.split('\t').collect();
    let [start_ms, end_ms, mtime_ns, output_path, hash] = fields.as_slice() else {
        return line.to_owned();
    };

    let new_mtime = current_mtime_ns(build_dir, output_path).unwrap_or_else(|| (*mtime_ns).to_owned());
    let new_hash = lookup_command(build_dir, output_path, commands)
        .map(|command| format!("{:016x}", rapidhash::rapidhash(command.as_bytes())))
        .unwrap_or_else(|| (*hash).to_owned());

    format!("{start_ms}\t{end_ms}\t{new_mtime}\t{output_path}\t{new_hash}")
}

fn current_mtime_ns(build_dir: &Path, output_path: &str) -> Option<String> {
    let path = build_dir.join(output_path);
    let metadata = fs::metadata(path).ok()?;
    let modified = metadata.modified().ok()?;
    let nanos = modified.duration_since(UNIX_EPOCH).ok()?.as_nanos();
    Some(nanos.to_string())
}

fn lookup_command(build_dir: &Path, output_path: &str, commands: &HashMap<String, String>) -> Option<String> {
    if let Some(command) = commands.get(output_path) {
        return Some(command.clone());
    }
    let absolute = build_dir.join(output_path);
    commands.get(&absolute.to_string_lossy().into_owned()).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_through_comment_and_blank_lines() {
        let commands = HashMap::new();
        assert_eq!(rehash_line("# ninja log v5", Path::new("/build"), &commands), "# ninja log v5");
        assert_eq!(rehash_line("", Path::new("/build"), &commands), "");
    }

    #[test]
    fn passes_through_malformed_lines() {
        let commands = HashMap::new();
        let line = "not\tenough\tfields";
        assert_eq!(rehash_line(line, Path::new("/build"), &commands), line);
    }

    #[test]
    fn keeps_old_hash_and_mtime_when_output_and_command_unknown() {
        let commands = HashMap::new();
        let line = "1\t2\t1000\tmissing.o\tdeadbeef";
        assert_eq!(rehash_line(line, Path::new("/no/such/build/dir"), &commands), line);
    }

    #[test]
    fn recomputes_hash_for_known_command() {
        let build_dir = tempfile::tempdir().expect("tempdir");
        fs::write(build_dir.path().join("foo.o"), b"object").expect("write output");

        let mut commands = HashMap::new();
        commands.insert("foo.o".to_owned(), "cc -c foo.c".to_owned());

        let line = "1\t2\t1000\tfoo.o\tdeadbeef";
        let rewritten = rehash_line(line, build_dir.path(), &commands);
        let fields: Vec<&str> = rewritten.split('\t').collect();
        assert_eq!(fields[3], "foo.o");
        assert_eq!(
            fields[4],
            format!("{:016x}", rapidhash::rapidhash(b"cc -c foo.c"))
        );
        assert_ne!(fields[2], "1000");
    }
}
