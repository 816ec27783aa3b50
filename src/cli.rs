//! Command line interface definition using clap.

use camino::Utf8PathBuf;
use clap::Parser;

/// Grafts cached build, submodule and assistant state from a primary
/// worktree onto a freshly created one.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the freshly created worktree to graft state onto.
    pub worktree_path: Utf8PathBuf,

    /// Primary worktree to copy state from; auto-detected when omitted.
    #[arg(long)]
    pub source: Option<Utf8PathBuf>,

    /// Remote URL used to synthesise the assistant task identifier;
    /// auto-detected from `origin` when omitted.
    #[arg(long = "remote-url")]
    pub remote_url: Option<String>,

    /// Branch name used to synthesise the assistant task identifier;
    /// auto-detected from the target worktree's current branch when omitted.
    #[arg(long)]
    pub branch: Option<String>,

    /// Emit debug-level logging.
    #[arg(short, long)]
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_invocation() {
        let cli = Cli::parse_from(["graft", "/tmp/wt"]);
        assert_eq!(cli.worktree_path, Utf8PathBuf::from("/tmp/wt"));
        assert!(cli.source.is_none());
        assert!(cli.remote_url.is_none());
        assert!(cli.branch.is_none());
        assert!(!cli.verbose);
    }

    #[test]
    fn parses_all_flags() {
        let cli = Cli::parse_from([
            "graft",
            "/tmp/wt",
            "--source",
            "/tmp/primary",
            "--remote-url",
            "git@github.com:acme/widgets.git",
            "--branch",
            "feat/new stuff",
            "--verbose",
        ]);
        assert_eq!(cli.source, Some(Utf8PathBuf::from("/tmp/primary")));
        assert_eq!(
            cli.remote_url.as_deref(),
            Some("git@github.com:acme/widgets.git")
        );
        assert_eq!(cli.branch.as_deref(), Some("feat/new stuff"));
        assert!(cli.verbose);
    }
}
