mod logging;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use docqueue::config::{load_config, Config};
use docqueue::job::{JobId, JobStateKind};
use docqueue::store::JobFilter;
use docqueue::submit::SubmitRequest;
use docqueue::{Runtime, StubEngine};
use log::info;
use serde::Serialize;

#[derive(Parser)]
#[command(name = "docqueued", version, about = "Asynchronous document analysis queue")]
struct Cli {
    /// Path to a JSON config file. Built-in defaults apply when omitted.
    #[arg(short, long, global = true, env = "DOCQUEUE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run workers, the retention sweeper and the pending reconciler until
    /// interrupted.
    Run,
    /// Submit a document for analysis.
    Submit {
        file: PathBuf,
        #[arg(short, long)]
        query: String,
        #[arg(long)]
        category: Option<String>,
    },
    /// Show one job.
    Status { id: String },
    /// List jobs, newest first.
    List {
        #[arg(long)]
        state: Option<JobStateKind>,
        #[arg(long, default_value_t = 20)]
        limit: u64,
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },
    /// Job counts and queue depth.
    Stats,
    /// Purge expired jobs once.
    Sweep,
    /// Re-enqueue stuck pending jobs once.
    Reconcile,
    /// Delete every failed job and its document, whatever its age.
    PurgeFailed,
    /// Dump all jobs and analysis history as JSON.
    Export {
        /// Write to this file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    logging::init(&config.logging)?;

    let runtime = Runtime::build(config, Arc::new(StubEngine))?;

    match cli.command {
        Command::Run => run(&runtime),
        Command::Submit {
            file,
            query,
            category,
        } => {
            let content = std::fs::read(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let document_name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let receipt = runtime.submitter().submit(SubmitRequest {
                document_name,
                content,
                query,
                category,
            })?;
            print_json(&receipt)
        }
        Command::Status { id } => {
            let id: JobId = id.parse().context("Invalid job id")?;
            match runtime.store().status(&id)? {
                Some(view) => print_json(&view),
                None => bail!("Job {} not found", id),
            }
        }
        Command::List {
            state,
            limit,
            offset,
        } => {
            let filter = JobFilter {
                state: state.map(|s| s.as_str().to_string()),
                limit: Some(limit),
                offset: Some(offset),
                ..Default::default()
            };
            let (jobs, total) = runtime.store().list(&filter)?;
            print_json(&serde_json::json!({ "jobs": jobs, "total": total }))
        }
        Command::Stats => {
            let stats = runtime.store().stats()?;
            let depth = runtime.queue().depth()?;
            print_json(&serde_json::json!({ "jobs": stats, "queue": depth }))
        }
        Command::Sweep => print_json(&runtime.sweeper().sweep()?),
        Command::Reconcile => print_json(&runtime.reconciler().reconcile()?),
        Command::PurgeFailed => print_json(&runtime.sweeper().purge_failed()?),
        Command::Export { output } => export(&runtime, output.as_deref()),
    }
}

fn export(runtime: &Runtime, output: Option<&Path>) -> Result<()> {
    let data = runtime.store().export()?;
    let Some(path) = output else {
        return print_json(&data);
    };
    let json = serde_json::to_string_pretty(&data)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    info!(
        "Exported {} jobs and {} history rows to {}",
        data.jobs.len(),
        data.history.len(),
        path.display()
    );
    Ok(())
}

fn run(runtime: &Runtime) -> Result<()> {
    let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("Failed to install signal handler")?;

    let services = runtime.start()?;
    info!("Press Ctrl-C to stop");

    let _ = stop_rx.recv();
    info!("Shutdown requested, waiting for in-flight jobs");
    services.shutdown();
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::TempDir;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parses_maintenance_commands() {
        let cli = Cli::try_parse_from(["docqueued", "purge-failed"]).unwrap();
        assert!(matches!(cli.command, Command::PurgeFailed));

        let cli = Cli::try_parse_from(["docqueued", "export", "--output", "dump.json"]).unwrap();
        match cli.command {
            Command::Export { output } => assert_eq!(output, Some(PathBuf::from("dump.json"))),
            _ => panic!("expected export"),
        }
    }

    #[test]
    fn test_export_writes_jobs_and_history() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.store.connection = dir.path().join("jobs.db").to_string_lossy().into_owned();
        config.documents.directory = dir.path().join("documents").to_string_lossy().into_owned();
        let runtime = Runtime::build(config, Arc::new(StubEngine)).unwrap();
        let receipt = runtime
            .submitter()
            .submit(SubmitRequest {
                document_name: "q3.txt".to_string(),
                content: b"revenue up".to_vec(),
                query: "summarize".to_string(),
                category: Some("reports".to_string()),
            })
            .unwrap();

        let out = dir.path().join("export.json");
        export(&runtime, Some(out.as_path())).unwrap();

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&out).unwrap()).unwrap();
        assert_eq!(json["jobs"].as_array().unwrap().len(), 1);
        assert_eq!(json["jobs"][0]["id"], receipt.job_id.to_string());
        assert_eq!(json["history"][0]["category"], "reports");
    }
}
