//! CLI interface using clap
//!
//! Provides the command-line interface for the Critic difference engine

mod commands;

pub use commands::*;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Critic - difference engine for code review
#[derive(Parser, Debug)]
#[command(name = "critic")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file (defaults to $CRITIC_CONFIG, then the user config
    /// directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Database file, overriding the configuration
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json)
    #[arg(short = 'o', long, global = true, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the database and write a default configuration
    Init(InitArgs),

    /// Register a git repository
    AddRepository(AddRepositoryArgs),

    /// Request the difference between two commits
    Request(RequestArgs),

    /// Request syntax highlighting of one file version
    Highlight(HighlightArgs),

    /// Record a new branch head
    BranchUpdate(BranchUpdateArgs),

    /// Run the job runner
    Runner(RunnerArgs),

    /// Run the pub/sub broker
    Broker(BrokerArgs),

    /// Run a worker
    Worker(WorkerArgs),

    /// Show the cache state of a changeset
    Status(StatusArgs),
}

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Arguments for init command
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Overwrite an existing configuration file
    #[arg(short, long)]
    pub force: bool,
}

/// Arguments for add-repository command
#[derive(Parser, Debug)]
pub struct AddRepositoryArgs {
    /// Name the repository is referred to by
    #[arg(short, long)]
    pub name: String,

    /// Path to the git repository
    pub path: PathBuf,
}

/// Arguments for request command
#[derive(Parser, Debug)]
pub struct RequestArgs {
    /// Repository name
    #[arg(short, long)]
    pub repository: String,

    /// Old commit (omit for a root commit)
    #[arg(long)]
    pub from: Option<String>,

    /// New commit
    #[arg(long)]
    pub to: String,

    /// Merge commit this changeset belongs to
    #[arg(long)]
    pub for_merge: Option<String>,

    /// Request the content difference
    #[arg(long)]
    pub content: bool,

    /// Request syntax highlighting (implies --content)
    #[arg(long)]
    pub highlight: bool,
}

/// Arguments for highlight command
#[derive(Parser, Debug)]
pub struct HighlightArgs {
    /// Repository name
    #[arg(short, long)]
    pub repository: String,

    /// Blob to highlight
    #[arg(long)]
    pub sha1: String,

    /// Language label (e.g. rust, python)
    #[arg(short, long)]
    pub language: String,

    /// Mark conflict markers
    #[arg(long)]
    pub conflicts: bool,
}

/// Arguments for branch-update command
#[derive(Parser, Debug)]
pub struct BranchUpdateArgs {
    /// Repository name
    #[arg(short, long)]
    pub repository: String,

    /// Branch name
    #[arg(short, long)]
    pub branch: String,

    /// New head
    #[arg(long)]
    pub to: String,

    /// Attach a review to the branch before recording the update
    #[arg(long)]
    pub review: bool,
}

/// Arguments for runner command
#[derive(Parser, Debug)]
pub struct RunnerArgs {
    /// Stop once all requested work is done
    #[arg(long)]
    pub once: bool,
}

/// Arguments for broker command
#[derive(Parser, Debug)]
pub struct BrokerArgs {
    /// Listen address, overriding the configuration
    #[arg(short, long)]
    pub address: Option<String>,
}

/// Arguments for worker command
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Serve framed records on the standard streams instead of the broker
    #[arg(long)]
    pub stdio: bool,

    /// Name announced to the broker
    #[arg(short, long, default_value = "worker")]
    pub name: String,
}

/// Arguments for status command
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Changeset ID
    #[arg(long)]
    pub changeset: i64,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Whether the command speaks framed records on stdout
    pub fn uses_stdio(&self) -> bool {
        matches!(&self.command, Commands::Worker(args) if args.stdio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::parse_from([
            "critic",
            "request",
            "--repository",
            "critic",
            "--to",
            "abc",
            "--highlight",
        ]);
        let Commands::Request(args) = cli.command else {
            panic!("expected request command");
        };
        assert_eq!(args.repository, "critic");
        assert_eq!(args.from, None);
        assert!(args.highlight);
        assert!(!args.content);
    }

    #[test]
    fn test_global_options() {
        let cli = Cli::parse_from(["critic", "runner", "--once", "--database", "x.db", "-v"]);
        assert!(cli.verbose);
        assert_eq!(cli.database, Some(PathBuf::from("x.db")));
        assert!(matches!(cli.command, Commands::Runner(RunnerArgs { once: true })));
        assert!(!cli.uses_stdio());

        let cli = Cli::parse_from(["critic", "worker", "--stdio"]);
        assert!(cli.uses_stdio());
    }
}
