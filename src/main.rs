//! Critic - difference engine for code review
//!
//! Computes and caches what changed between commits: changed files, line
//! blocks, intra-line alignment and syntax highlighting.

use anyhow::{Context, Result};
use critic::cli::{
    add_repository, branch_update, highlight, init, load_config, open_database, print_created,
    print_status_json, print_status_text, request, run_broker, run_runner, run_worker,
    signal_runner, Cli, Commands, OutputFormat, BRANCH_UPDATES, REQUESTS,
};
use serde_json::json;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // A stdio worker's streams carry framed records, so it logs through them
    // instead
    if !cli.uses_stdio() {
        let filter = if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
        };

        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }

    let config = load_config(cli.config.as_deref(), cli.database.as_deref())?;
    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;

    // Execute command
    match cli.command {
        Commands::Init(args) => {
            init(cli.config.as_deref(), &config, args.force)?;
        }

        Commands::AddRepository(args) => {
            let db = open_database(&config)?;
            let record = add_repository(&db, &args)?;
            print_created(cli.format, "repository", record.id)?;
        }

        Commands::Request(args) => {
            let db = open_database(&config)?;
            let id = request(&db, &args)?;
            runtime.block_on(signal_runner(&config, REQUESTS, json!({ "changeset": id })));
            print_created(cli.format, "changeset", id)?;
        }

        Commands::Highlight(args) => {
            let db = open_database(&config)?;
            let id = highlight(&db, &args)?;
            runtime.block_on(signal_runner(&config, REQUESTS, json!({ "highlight_file": id })));
            print_created(cli.format, "highlight_file", id)?;
        }

        Commands::BranchUpdate(args) => {
            let db = open_database(&config)?;
            let (update, review) = branch_update(&db, &args)?;
            runtime.block_on(signal_runner(
                &config,
                BRANCH_UPDATES,
                json!({ "branchupdate": update }),
            ));
            print_created(cli.format, "branchupdate", update)?;
            if let Some(review) = review {
                print_created(cli.format, "review", review)?;
            }
        }

        Commands::Runner(args) => {
            let stats = runtime.block_on(run_runner(&config, args.once))?;
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string(&stats)?),
                OutputFormat::Text => println!(
                    "✓ Runner finished: {} job(s) started, {} finished, {} failed",
                    stats.started, stats.finished, stats.failed
                ),
            }
        }

        Commands::Broker(args) => {
            runtime.block_on(run_broker(&config, args.address.as_deref()))?;
        }

        Commands::Worker(args) => {
            runtime.block_on(run_worker(&config, &args))?;
        }

        Commands::Status(args) => {
            let db = open_database(&config)?;
            let status = db
                .changeset_status(args.changeset)?
                .with_context(|| format!("Changeset {} not found", args.changeset))?;

            match cli.format {
                OutputFormat::Json => print_status_json(&status)?,
                OutputFormat::Text => print_status_text(&status),
            }
        }
    }

    Ok(())
}
