//! workbatch CLI: operator interface to the batch runner.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use workbatch::config::Config;
use workbatch::engine::{RunOptions, RunReport, Scheduler};
use workbatch::job::JobConfig;
use workbatch::model::Status;
use workbatch::telemetry::{TelemetryConfig, init_telemetry};
use workbatch::worker::Invoker;

#[derive(Parser)]
#[command(name = "workbatch", about = "Run a code agent over a batch of files")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a batch described by a job file
    Run {
        /// Job definition (TOML)
        job: PathBuf,
        /// Directory to discover files under
        #[arg(long, default_value = ".")]
        root: PathBuf,
        /// Skip items a previous run completed
        #[arg(long)]
        resume: bool,
        /// Print the last result instead of running
        #[arg(long)]
        status: bool,
    },
    /// Print the persisted task store of a batch
    Tasks {
        /// Job definition (TOML)
        job: PathBuf,
    },
    /// Print the progress snapshot of a running batch
    Progress {
        /// Job definition (TOML)
        job: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Run {
            job,
            root,
            resume,
            status,
        } => {
            if status {
                cmd_status(&config, &job).await
            } else {
                cmd_run(&config, &job, root, resume).await
            }
        }
        Command::Tasks { job } => cmd_tasks(&config, &job).await,
        Command::Progress { job } => cmd_progress(&config, &job).await,
    }
}

fn scheduler(config: &Config, job: &JobConfig) -> Scheduler {
    Scheduler::new(
        job.scheduler_config(&config.state_dir),
        Arc::new(Invoker::new(config.invoker())),
    )
}

async fn cmd_run(
    config: &Config,
    job_path: &Path,
    root: PathBuf,
    resume: bool,
) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig::from_config(config))?;

    let job = JobConfig::load(job_path)?;
    let pipeline = Arc::new(job.pipeline(&config.state_dir));
    let scheduler = scheduler(config, &job);

    let report = scheduler
        .run(
            pipeline,
            RunOptions {
                resume,
                root_dir: root,
            },
        )
        .await?;

    print_report(&report);
    println!("\nResult: {}", scheduler.paths().result.display());
    Ok(())
}

async fn cmd_status(config: &Config, job_path: &Path) -> anyhow::Result<()> {
    let job = JobConfig::load(job_path)?;
    match scheduler(config, &job).last_result().await? {
        Some(content) => print!("{content}"),
        None => println!("No result for batch '{}' yet.", job.name),
    }
    Ok(())
}

async fn cmd_tasks(config: &Config, job_path: &Path) -> anyhow::Result<()> {
    let job = JobConfig::load(job_path)?;
    let status = scheduler(config, &job).status().await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn cmd_progress(config: &Config, job_path: &Path) -> anyhow::Result<()> {
    let job = JobConfig::load(job_path)?;
    let snapshot = scheduler(config, &job).progress().load().await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn print_report(report: &RunReport) {
    let failures: Vec<_> = report
        .tasks
        .iter()
        .filter(|t| matches!(t.status(), Status::Failed | Status::Timeout))
        .collect();

    if !failures.is_empty() {
        println!("{:<40}  {:<9}  ERROR", "TASK", "STATUS");
        println!("{}", "-".repeat(80));
        for task in &failures {
            let id = task.id.as_str();
            let id_display = if id.chars().count() > 40 {
                id.chars().take(40).collect::<String>()
            } else {
                id.to_string()
            };
            println!(
                "{:<40}  {:<9}  {}",
                id_display,
                task.status().to_string(),
                task.error().unwrap_or("-")
            );
        }
        println!();
    }

    let s = report.summary;
    println!(
        "Batch '{}': {} total, {} completed, {} failed, {} timeout, {} skipped",
        report.name,
        s.total,
        s.completed,
        s.failed,
        s.timeout,
        report.skipped.len()
    );
    println!(
        "Took {}s",
        (report.finished_at - report.started_at).num_seconds()
    );
}
