//! Propagates the assistant trust/settings document from source to target,
//! optionally injecting a synthesized task-list identifier.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{Map, Value, json};

use crate::orchestrator::RunContext;
use crate::status::{StatusReporter, Subtask};

/// Location of the assistant settings document, relative to a worktree
/// root.
const SETTINGS_RELATIVE_PATH: &str = ".claude/settings.local.json";

/// Environment key the synthesized task-list identifier is written under.
const TASK_LIST_ID_KEY: &str = "CLAUDE_CODE_TASK_LIST_ID";

/// Runs only when the source worktree actually has a settings document to
/// copy.
#[must_use]
pub fn should_run(ctx: &RunContext) -> bool {
    source_settings_path(&ctx.pair.source).is_file()
}

/// The single subtask this task contributes.
#[must_use]
pub fn subtasks() -> Vec<Subtask> {
    vec![("settings", "propagate assistant settings".to_owned())]
}

fn source_settings_path(source: &Path) -> PathBuf {
    source.join(SETTINGS_RELATIVE_PATH)
}

fn target_settings_path(target: &Path) -> PathBuf {
    target.join(SETTINGS_RELATIVE_PATH)
}

/// Copy the settings document, merging it into any pre-existing target
/// document, optionally injecting the synthesized task-list identifier.
///
/// # Errors
///
/// Returns an error if the source document cannot be read or parsed, or if
/// the target document cannot be written.
pub fn run(ctx: &RunContext, status: &dyn StatusReporter) -> Result<()> {
    status.start("settings");
    let result = propagate(ctx);
    match &result {
        Ok(()) => status.finish("settings"),
        Err(_) => status.fail("settings"),
    }
    result
}

fn propagate(ctx: &RunContext) -> Result<()> {
    let source_path = source_settings_path(&ctx.pair.source);
    let target_path = target_settings_path(&ctx.pair.target);

    let source_text = fs::read_to_string(&source_path)
        .with_context(|| format!("reading {}", source_path.display()))?;
    let source_value: Value = serde_json::from_str(&source_text)
        .with_context(|| format!("parsing {} as JSON", source_path.display()))?;

    let target_value: Value = match fs::read_to_string(&target_path) {
        Ok(text) => serde_json::from_str(&text)
            .with_context(|| format!("parsing {} as JSON", target_path.display()))?,
        Err(_) => json!({}),
    };

    let mut merged = merge(target_value, source_value);

    if let (Some(remote_url), Some(branch)) = (ctx.remote_url.as_deref(), ctx.branch.as_deref())
        && let Some(identifier) = synthesize_identifier(remote_url, branch)
    {
        inject_task_list_id(&mut merged, &identifier);
    }

    if let Some(parent) = target_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    write_pretty(&target_path, &merged)?;
    Ok(())
}

/// Shallow merge at the top level, with one level of recursion into the
/// `env` subobject so injected identifiers coexist with copied entries.
fn merge(mut base: Value, overlay: Value) -> Value {
    let Value::Object(overlay_map) = overlay else {
        return base;
    };
    let Value::Object(base_map) = &mut base else {
        return Value::Object(overlay_map);
    };
    for (key, value) in overlay_map {
        if key == "env"
            && let (Some(Value::Object(base_env)), Value::Object(overlay_env)) =
                (base_map.get_mut("env"), &value)
        {
            for (env_key, env_value) in overlay_env {
                base_env.insert(env_key.clone(), env_value.clone());
            }
            continue;
        }
        base_map.insert(key, value);
    }
    base
}

fn inject_task_list_id(settings: &mut Value, identifier: &str) {
    let Value::Object(root) = settings else {
        return;
    };
    let env = root
        .entry("env")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(env_map) = env {
        env_map.insert(TASK_LIST_ID_KEY.to_owned(), Value::String(identifier.to_owned()));
    }
}

fn write_pretty(path: &Path, value: &Value) -> Result<()> {
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"  ");
    let mut buffer = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
    serde::Serialize::serialize(value, &mut serializer)
        .with_context(|| format!("serializing {}", path.display()))?;
    buffer.push(b'\n');
    fs::write(path, buffer).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Parse a remote URL into `(org, repo)`, handling both
/// `user@host:path` and `scheme://host/path` forms, with any trailing
/// `.git` stripped.
#[must_use]
pub fn parse_org_repo(url: &str) -> Option<(String, String)> {
    let path = if let Some(scheme_end) = url.find("://") {
        let after_scheme = &url[scheme_end + 3..];
        let (_, rest) = after_scheme.split_once('/')?;
        rest
    } else {
        let colon = url.find(':')?;
        &url[colon + 1..]
    };

    let path = path.strip_suffix(".git").unwrap_or(path);
    let mut parts: Vec<&str> = path.split('/').filter(|segment| !segment.is_empty()).collect();
    let repo = parts.pop()?;
    let org = parts.pop()?;
    Some((org.to_owned(), repo.to_owned()))
}

/// Sanitize a branch name: replace any run of `[/ \ : # . whitespace]`
/// (including pre-existing `-`) with a single `-`, and strip leading or
/// trailing `-`.
#[must_use]
pub fn sanitize_branch(branch: &str) -> String {
    let mut result = String::with_capacity(branch.len());
    for ch in branch.chars() {
        let collapses = ch == '-' || ch == '/' || ch == '\\' || ch == ':' || ch == '#' || ch == '.' || ch.is_whitespace();
        if collapses {
            if result.chars().next_back() != Some('-') {
                result.push('-');
            }
        } else {
            result.push(ch);
        }
    }
    result.trim_matches('-').to_owned()
}

/// Synthesize the `{org}-{repo}-{sanitized_branch}` identifier from a
/// remote URL and branch name.
#[must_use]
pub fn synthesize_identifier(remote_url: &str, branch: &str) -> Option<String> {
    let (org, repo) = parse_org_repo(remote_url)?;
    Some(format!("{org}-{repo}-{}", sanitize_branch(branch)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::scp_style("git@github.com:acme/widgets.git", "acme", "widgets")]
    #[case::https_nested("https://gitlab.example/group/sub/proj", "sub", "proj")]
    #[case::https_no_dotgit("https://example.com/org/repo", "org", "repo")]
    fn parses_org_repo(#[case] url: &str, #[case] org: &str, #[case] repo: &str) {
        assert_eq!(parse_org_repo(url), Some((org.to_owned(), repo.to_owned())));
    }

    #[test]
    fn url_parse_is_dot_git_insensitive() {
        assert_eq!(
            parse_org_repo("git@github.com:acme/widgets.git"),
            parse_org_repo("git@github.com:acme/widgets")
        );
    }

    #[rstest]
    #[case::slash_separated("feat/new stuff", "feat-new-stuff")]
    #[case::dots_and_hash("v1.2#hot", "v1-2-hot")]
    #[case::collapses_runs("feat//new--stuff", "feat-new-stuff")]
    #[case::strips_edges("-feat-", "feat")]
    fn sanitizes_branch(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(sanitize_branch(input), expected);
    }

    #[test]
    fn sanitize_is_idempotent() {
        let once = sanitize_branch("feat/new stuff!!");
        let twice = sanitize_branch(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn synthesizes_documented_identifiers() {
        assert_eq!(
            synthesize_identifier("git@github.com:acme/widgets.git", "feat/new stuff").as_deref(),
            Some("acme-widgets-feat-new-stuff")
        );
        assert_eq!(
            synthesize_identifier("https://gitlab.example/group/sub/proj", "v1.2#hot").as_deref(),
            Some("sub-proj-v1-2-hot")
        );
    }

    #[test]
    fn merge_preserves_target_only_keys_and_overlays_env() {
        let target = json!({"theme": "dark", "env": {"KEPT": "1"}});
        let source = json!({"env": {"ADDED": "2"}});
        let merged = merge(target, source);
        assert_eq!(merged["theme"], "dark");
        assert_eq!(merged["env"]["KEPT"], "1");
        assert_eq!(merged["env"]["ADDED"], "2");
    }
}
