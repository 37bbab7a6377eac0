use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use seo_jobs::config::OrchestratorConfig;
use seo_jobs::jobs::{
    AuditConfig, ClientCondition, HttpJobClient, InputSet, JobClient, JobEvent, JobId,
    JobOrchestrator, JobRecord, JobRequest, JobStatus, OnPageConfig,
};
use seo_jobs::mock_worker::{self, MockWorker};

#[derive(Parser)]
#[command(name = "seo-jobs")]
#[command(about = "Submit SEO analysis jobs and follow them to completion", long_about = None)]
struct Cli {
    /// Serve the in-process mock worker on this port and use it as the worker
    #[arg(long, global = true)]
    mock_worker: Option<u16>,

    /// Owner scope (project) the jobs belong to
    #[arg(long, global = true, env = "SEO_JOBS_SCOPE", default_value = "default")]
    scope: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run a full site audit
    Audit {
        domain: String,
        #[arg(long)]
        max_pages: Option<u32>,
    },
    /// Check one page against a target keyword
    OnPage { url: String, keyword: String },
    /// Compare a target domain against competitors
    Gap {
        target: String,
        #[arg(required = true)]
        competitors: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();
    let cli = Cli::parse();

    let mock_url = match cli.mock_worker {
        Some(port) => Some(start_mock_worker(port).await?),
        None => None,
    };

    let Some(command) = cli.command else {
        if mock_url.is_some() {
            eprintln!("Mock worker running. Ctrl-C to stop.");
            tokio::signal::ctrl_c().await?;
            return Ok(());
        }
        anyhow::bail!("Nothing to do: pass a command, or --mock-worker <port> to serve the mock worker");
    };

    let config = match mock_url {
        Some(url) => OrchestratorConfig::for_worker(url)?,
        None => OrchestratorConfig::from_env()
            .context("Set SEO_JOBS_WORKER_URL or pass --mock-worker <port>")?,
    };

    eprintln!("SEO Jobs v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Worker: {}", config.worker_url);

    let client: Arc<dyn JobClient> = Arc::new(
        HttpJobClient::new(&config.worker_url, config.request_timeout)?
            .with_token(config.api_token.clone()),
    );
    let orchestrator = JobOrchestrator::new(client, config);

    let request = match command {
        Command::Audit { domain, max_pages } => {
            JobRequest::site_audit(&cli.scope, &AuditConfig { domain, max_pages })
        }
        Command::OnPage { url, keyword } => {
            JobRequest::on_page_check(&cli.scope, &OnPageConfig { url, keyword })
        }
        Command::Gap {
            target,
            competitors,
        } => {
            let mut inputs = InputSet::new(target);
            for competitor in competitors {
                inputs.add(competitor)?;
            }
            JobRequest::competitor_gap(&cli.scope, &inputs.to_gap_config()?)
        }
    };

    let job_id = orchestrator.submit(request).await?;
    eprintln!("   Job: {job_id}\n");

    let outcome = follow(&orchestrator, &job_id).await;
    orchestrator.clear_all().await;
    outcome
}

/// Print every event for a job until its subscription ends, then the result.
async fn follow(orchestrator: &JobOrchestrator, job_id: &JobId) -> anyhow::Result<()> {
    use futures::StreamExt;

    let (_subscription, mut events) = orchestrator.watch(job_id)?;
    let mut last: Option<JobRecord> = None;

    while let Some(event) = events.next().await {
        match event {
            JobEvent::Updated(record) => {
                print_record(&record);
                last = Some(record);
            }
            JobEvent::ResultReady { .. } => {
                let payload = orchestrator.fetch_result(job_id).await?;
                println!("{}", serde_json::to_string_pretty(&payload)?);
            }
            JobEvent::ResultFailed { reason, .. } => {
                anyhow::bail!("Job completed but its result could not be fetched: {reason}");
            }
        }
    }

    match last {
        Some(record) if record.status == JobStatus::Failed => {
            let reason = record
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown failure".to_string());
            anyhow::bail!("Job {job_id} failed: {reason}")
        }
        Some(JobRecord {
            condition: Some(ClientCondition::Lost { reason }),
            ..
        }) => anyhow::bail!("Worker can no longer report on job {job_id}: {reason}"),
        Some(record) if !record.status.is_terminal() => {
            anyhow::bail!("Stopped waiting for job {job_id}; its outcome is unknown")
        }
        _ => Ok(()),
    }
}

fn print_record(record: &JobRecord) {
    let progress = record
        .progress
        .map(|p| format!(" {p:>3}%"))
        .unwrap_or_default();
    let message = record
        .message
        .as_deref()
        .map(|m| format!("  {m}"))
        .unwrap_or_default();
    let condition = record
        .condition
        .as_ref()
        .map(|c| format!("  [{c:?}]"))
        .unwrap_or_default();
    eprintln!("[{}]{progress}{message}{condition}", record.status);
}

async fn start_mock_worker(port: u16) -> anyhow::Result<String> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("Failed to bind mock worker port {port}"))?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        if let Err(e) = mock_worker::serve(listener, MockWorker::new()).await {
            tracing::error!("Mock worker stopped: {e}");
        }
    });

    Ok(format!("http://{addr}"))
}

/// Console logging, plus a daily rolling file when `SEO_JOBS_LOG_DIR` is set.
/// The returned guard flushes the file writer and must live until exit.
fn init_tracing() -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match std::env::var("SEO_JOBS_LOG_DIR") {
        Ok(dir) if !dir.is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "seo-jobs.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::registry().with(filter).with(console).init();
            None
        }
    }
}
