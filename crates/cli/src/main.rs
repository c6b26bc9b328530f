mod cli;
mod config;
mod demo;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use futures::future::join_all;
use serde_json::{json, Value};
use sluice_core::SubmitOptions;
use sluice_queue::{Origin, QueueManager, QueueSnapshot};
use tracing::{info, warn};

use crate::cli::{CliArgs, Command};
use crate::config::CliConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();

    // Load config
    let config = CliConfig::load(args.config.as_deref()).context("failed to load configuration")?;

    match args.command {
        Command::Run {
            requests,
            failure_rate,
            import,
            export,
        } => run_workload(config, requests, failure_rate, import.as_deref(), export.as_deref()).await,
        Command::Submit {
            request_type,
            payload,
            priority,
            cacheable,
            timeout_ms,
        } => {
            let payload: Value = serde_json::from_str(&payload).context("payload is not valid JSON")?;
            let mut options = SubmitOptions::new().priority(priority);
            if cacheable {
                options = options.cacheable();
            }
            if let Some(ms) = timeout_ms {
                options = options.timeout(Duration::from_millis(ms));
            }

            let qm = QueueManager::new(config.queue).context("failed to start queue")?;
            demo::register_handlers(&qm);
            let handle = qm.submit_request(&request_type, payload, options)?;
            let id = handle.id();
            let outcome = handle.wait().await;
            qm.shutdown().await;

            let value = outcome.with_context(|| format!("request {id} failed"))?;
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config).context("failed to render configuration")?);
            Ok(())
        }
    }
}

async fn run_workload(
    config: CliConfig,
    requests: usize,
    failure_rate: f64,
    import: Option<&Path>,
    export: Option<&Path>,
) -> Result<()> {
    let qm = QueueManager::new(config.queue.clone()).context("failed to start queue")?;
    demo::register_handlers(&qm);

    if let Some(path) = import {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read snapshot: {}", path.display()))?;
        let snapshot: QueueSnapshot =
            serde_json::from_str(&raw).with_context(|| format!("failed to parse snapshot: {}", path.display()))?;
        let summary = qm.import_data(snapshot)?;
        info!(
            cache_entries = summary.cache_entries,
            skipped = summary.skipped,
            "Snapshot imported"
        );
    }

    qm.on_error(|err, request| match request {
        Some(req) => warn!(id = %req.id, request_type = %req.request_type, error = %err, "Request failed"),
        None => warn!(error = %err, "Request failed"),
    });
    qm.on_metrics(|m| {
        info!(
            pending = m.pending,
            processing = m.processing,
            workers = m.workers,
            throughput = %format!("{:.1}/s", m.throughput),
            error_rate = %format!("{:.3}", m.error_rate),
            health = ?m.health,
            "Queue metrics"
        );
    });

    let work = demo::workload(requests, failure_rate, &config.workload);
    info!(requests = work.len(), failure_rate, "Submitting workload");

    let mut handles = Vec::with_capacity(work.len());
    let mut rejected = 0usize;
    for item in work {
        match qm.submit_request(item.request_type, item.payload, item.options) {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                rejected += 1;
                warn!(request_type = item.request_type, error = %e, "Submission rejected");
            }
        }
    }

    let reused = handles.iter().filter(|h| h.origin() != Origin::Queued).count();
    let results = join_all(handles.into_iter().map(|h| h.wait())).await;
    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    let failed = results.len() - succeeded;
    info!(succeeded, failed, rejected, reused, "Workload drained");

    let report = json!({
        "summary": {
            "succeeded": succeeded,
            "failed": failed,
            "rejected": rejected,
            "served_without_execution": reused,
        },
        "status": qm.queue_status(),
        "metrics": qm.metrics(),
        "scaling_events": qm.scaling_events(),
        "recommendations": qm.recommendations(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Some(path) = export {
        let snapshot = qm.export_data();
        let body = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(path, body).with_context(|| format!("failed to write snapshot: {}", path.display()))?;
        info!(path = %path.display(), cache_entries = snapshot.cache.len(), "Snapshot exported");
    }

    qm.shutdown().await;
    Ok(())
}
