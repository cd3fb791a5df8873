//! Command implementations

use super::{
    AddRepositoryArgs, BranchUpdateArgs, HighlightArgs, OutputFormat, RequestArgs, WorkerArgs,
};
use crate::config::EngineConfig;
use crate::pubsub::{Broker, Incoming, PubsubClient};
use crate::repo::Repository;
use crate::runner::{
    JobRunner, LocalTransport, LogPublisher, Publisher, PubsubPublisher, PubsubTransport,
    RunnerStats, Transport,
};
use crate::storage::{ChangesetRequest, ChangesetStatus, Database, RepositoryRecord};
use crate::worker::{self, BatchWriter, Handlers, Language};
use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Channel announcing recorded branch updates
pub const BRANCH_UPDATES: &str = "branchupdates";

/// Channel announcing new changeset and highlight requests
pub const REQUESTS: &str = "requests";

/// Channel announcing installed extensions
pub const EXTENSION_INSTALLATIONS: &str = "extensioninstallations";

/// Channels that wake the runner up for a scan
pub const RUNNER_SIGNALS: [&str; 3] = [BRANCH_UPDATES, EXTENSION_INSTALLATIONS, REQUESTS];

/// Reservation the runner keeps on the broker so signals sent while it is
/// down are delivered on reconnect
const RUNNER_RESERVATION: &str = "runner";

// ==================== Setup ====================

/// Load the configuration, applying a `--database` override
pub fn load_config(config: Option<&Path>, database: Option<&Path>) -> Result<EngineConfig> {
    let mut loaded = EngineConfig::load_or_default(config)?;
    if let Some(database) = database {
        loaded.database.path = database.to_path_buf();
    }
    Ok(loaded)
}

/// Open the database named by the configuration; it must have been initialised
pub fn open_database(config: &EngineConfig) -> Result<Database> {
    let path = &config.database.path;
    if !path.exists() {
        anyhow::bail!(
            "Database {:?} does not exist. Run 'critic init' first.",
            path
        );
    }
    Database::open(path)
}

/// Create the database schema and write the configuration file
pub fn init(config_path: Option<&Path>, config: &EngineConfig, force: bool) -> Result<()> {
    let config_path = EngineConfig::resolve_path(config_path)
        .context("No configuration directory available; pass --config")?;

    if config_path.exists() && !force {
        anyhow::bail!(
            "Configuration {:?} already exists. Use --force to overwrite.",
            config_path
        );
    }

    if let Some(parent) = config.database.path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
    }
    let db = Database::open(&config.database.path)?;
    config.save(&config_path)?;

    let stats = db.get_stats()?;
    info!(database = ?config.database.path, changesets = stats.changesets, "Initialized");
    println!("✓ Initialized Critic");
    println!("  Database: {:?}", config.database.path);
    println!("  Config: {:?}", config_path);

    Ok(())
}

// ==================== Requests ====================

/// Register a git repository under a name
pub fn add_repository(db: &Database, args: &AddRepositoryArgs) -> Result<RepositoryRecord> {
    // Fails early on something that is not a repository
    Repository::open(&args.path)?;
    let path = args
        .path
        .canonicalize()
        .with_context(|| format!("Failed to resolve {:?}", args.path))?;

    if db.repository_by_name(&args.name)?.is_some() {
        anyhow::bail!("Repository '{}' already exists", args.name);
    }
    db.add_repository(&args.name, &path)
}

fn find_repository(db: &Database, name: &str) -> Result<(RepositoryRecord, Repository)> {
    let record = db
        .repository_by_name(name)?
        .with_context(|| format!("Unknown repository '{}'", name))?;
    let repo = Repository::open(&record.path)?;
    Ok((record, repo))
}

/// Request the changeset between two commits
pub fn request(db: &Database, args: &RequestArgs) -> Result<i64> {
    let (record, repo) = find_repository(db, &args.repository)?;

    let from_commit = args
        .from
        .as_deref()
        .map(|rev| repo.resolve_commit(rev))
        .transpose()?;
    let to_commit = repo.resolve_commit(&args.to)?;
    let for_merge = args
        .for_merge
        .as_deref()
        .map(|rev| repo.resolve_commit(rev))
        .transpose()?;

    let id = db.request_changeset(&ChangesetRequest {
        repository: record.id,
        from_commit,
        to_commit,
        for_merge,
        content: args.content || args.highlight,
        highlight: args.highlight,
    })?;
    debug!(changeset = id, repository = %record.name, "Changeset requested");
    Ok(id)
}

/// Request highlighting of one blob
pub fn highlight(db: &Database, args: &HighlightArgs) -> Result<i64> {
    let (record, repo) = find_repository(db, &args.repository)?;
    let language = Language::from_label(&args.language)
        .with_context(|| format!("Unsupported language '{}'", args.language))?;
    repo.read_blob(&args.sha1)
        .with_context(|| format!("Blob {} not found", args.sha1))?;

    db.request_highlight(record.id, &args.sha1, language.label(), args.conflicts)
}

/// Record a branch update, optionally putting the branch under review
///
/// Returns the update id and the review id, if any.
pub fn branch_update(db: &Database, args: &BranchUpdateArgs) -> Result<(i64, Option<i64>)> {
    let (record, repo) = find_repository(db, &args.repository)?;
    let to_head = repo.resolve_commit(&args.to)?;

    let branch = db.ensure_branch(record.id, &args.branch)?;
    let review = if args.review {
        Some(db.create_review(&branch)?)
    } else {
        None
    };
    let update = db.record_branch_update(branch.id, &to_head)?;
    debug!(branch = %args.branch, branchupdate = update, "Branch update recorded");
    Ok((update, review))
}

/// Tell a running runner about new work; the periodic scan covers failures
pub async fn signal_runner(config: &EngineConfig, channel: &str, payload: Value) {
    if !config.pubsub.enabled {
        return;
    }
    match PubsubClient::connect(
        &config.pubsub.address,
        "critic-cli",
        0,
        config.pubsub.request_timeout(),
    )
    .await
    {
        Ok((client, _incoming)) => {
            if let Err(e) = client.publish(channel, payload) {
                warn!(channel, error = %e, "Failed to signal runner");
            }
            client.close().await;
        }
        Err(e) => warn!(error = %e, "Broker unavailable, runner will pick up the request on its next scan"),
    }
}

// ==================== Services ====================

fn spawn_handlers(config: &EngineConfig) -> Result<Arc<Handlers>> {
    let writer = BatchWriter::spawn(
        &config.database.path,
        config.worker.flush_max_age(),
        config.worker.flush_idle(),
    )
    .context("Failed to start database writer")?;
    Ok(Arc::new(Handlers::new(
        config.database.path.clone(),
        Arc::new(writer),
        config.highlight.clone(),
    )))
}

/// Run the job runner until interrupted, or until idle with `once`
pub async fn run_runner(config: &EngineConfig, once: bool) -> Result<RunnerStats> {
    let db = Arc::new(open_database(config)?);

    let mut signals = None;
    let (transport, publisher): (Arc<dyn Transport>, Arc<dyn Publisher>) =
        if config.pubsub.enabled {
            let (client, incoming) = PubsubClient::connect(
                &config.pubsub.address,
                "runner",
                0,
                config.pubsub.request_timeout(),
            )
            .await
            .with_context(|| format!("Failed to connect to broker at {}", config.pubsub.address))?;
            let client = Arc::new(client);
            for channel in RUNNER_SIGNALS {
                client.subscribe(channel, Some(RUNNER_RESERVATION))?;
            }
            signals = Some((client.clone(), incoming));
            (
                Arc::new(PubsubTransport::new(client.clone())),
                Arc::new(PubsubPublisher::new(client)),
            )
        } else {
            (
                Arc::new(LocalTransport::new(spawn_handlers(config)?)),
                Arc::new(LogPublisher),
            )
        };

    let mut runner = JobRunner::new(db, config, transport, publisher);
    let handle = runner.handle();

    if let Some((client, mut incoming)) = signals {
        let handle = handle.clone();
        tokio::spawn(async move {
            while let Some(incoming) = incoming.recv().await {
                if let Incoming::Message(message) = incoming {
                    debug!(channel = %message.channel, "Runner signalled");
                    if let Some(delivery) = &message.reservation {
                        if let Err(e) = client.acknowledge(delivery) {
                            warn!(error = %e, "Failed to acknowledge signal");
                        }
                    }
                    handle.scan();
                }
            }
            warn!("Broker connection closed, relying on periodic scans");
        });
    }

    {
        let handle = handle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, finishing running jobs");
                handle.terminate();
            }
        });
    }

    runner.run(once).await
}

/// Run the broker until interrupted
pub async fn run_broker(config: &EngineConfig, address: Option<&str>) -> Result<()> {
    let db = Arc::new(Database::open(&config.database.path)?);
    let address = address.unwrap_or(&config.pubsub.address);
    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("Failed to listen on {}", address))?;
    info!(address, "Broker listening");

    let broker = Arc::new(Broker::new(Some(db), &config.pubsub));
    tokio::select! {
        result = broker.serve(listener) => result?,
        _ = tokio::signal::ctrl_c() => info!("Broker stopping"),
    }
    Ok(())
}

/// Run a worker, either against the broker or over the standard streams
pub async fn run_worker(config: &EngineConfig, args: &WorkerArgs) -> Result<()> {
    if args.stdio {
        return worker::serve_stdio(spawn_handlers(config)?).await;
    }
    worker::serve(config, config.database.path.clone(), &args.name).await
}

// ==================== Output ====================

/// Print the id of a created row
pub fn print_created(format: OutputFormat, kind: &str, id: i64) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", json!({ kind: id })),
        OutputFormat::Text => println!("✓ {} {}", kind, id),
    }
    Ok(())
}

pub fn print_status_json(status: &ChangesetStatus) -> Result<()> {
    let json = serde_json::to_string_pretty(status)?;
    println!("{}", json);
    Ok(())
}

pub fn print_status_text(status: &ChangesetStatus) {
    let changeset = &status.changeset;
    let flag = |value: Option<bool>| match value {
        Some(true) => "complete",
        Some(false) => "pending",
        None => "not requested",
    };

    println!("Changeset {}", changeset.id);
    println!(
        "  Commits: {}..{}",
        changeset.from_commit.as_deref().unwrap_or("(root)"),
        changeset.to_commit
    );
    if let Some(merge) = &changeset.for_merge {
        println!("  Merge: {}", merge);
    }
    println!(
        "  Structure: {}",
        if changeset.complete { "complete" } else { "pending" }
    );
    println!("  Changed files: {}", status.changed_files);
    println!("  Blocks: {}", status.blocks);
    println!("  Content: {}", flag(status.content_complete));
    if status.highlight_requested {
        println!(
            "  Highlight: {} ({} files left)",
            flag(status.highlight_evaluated),
            status.unhighlighted_files
        );
    } else {
        println!("  Highlight: not requested");
    }

    if status.errors.is_empty() {
        return;
    }
    println!("\n⚠ {} failed job(s):", status.errors.len());
    for error in &status.errors {
        let first = error.traceback.lines().next().unwrap_or("");
        println!(
            "  {} {}: {}",
            if error.fatal { "✗" } else { "!" },
            error.job_key,
            first
        );
    }
}
