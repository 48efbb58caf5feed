//! Run command
//!
//! Runs a pipeline on this machine. A pipeline without decentralized steps
//! runs on one local node; otherwise an aggregator and `--clients` local
//! participants are started over one in-memory broker.

use anyhow::{Context, Result, bail};
use clap::Args;
use colored::*;
use coinstac_core::domain::run::RunMode;
use coinstac_core::dto::state::{PipelineOutput, StateEvent, TerminalStatus};
use coinstac_pipeline::{
    ManagerConfig, MemoryBroker, PipelineError, PipelineManager, PodmanDriver, ShutdownMode,
    StartRequest,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use uuid::Uuid;

use super::load_spec;
use super::validate::print_steps;
use crate::config::Config;

#[derive(Args)]
pub struct RunArgs {
    /// Path to the pipeline specification (JSON)
    spec: PathBuf,

    /// Simulated participants for decentralized pipelines
    #[arg(short, long, default_value = "1")]
    clients: usize,

    /// Run id, a new UUID when omitted
    #[arg(long)]
    run_id: Option<String>,

    /// Seconds to wait for peers
    #[arg(long)]
    timeout: Option<u64>,

    /// Files for `files` inputs as source=directory (repeatable)
    #[arg(short, long, value_parser = parse_key_val)]
    files: Vec<(String, PathBuf)>,

    /// Do not pull images before running
    #[arg(long)]
    no_pull: bool,
}

/// Parse a single key=value pair
fn parse_key_val(s: &str) -> Result<(String, PathBuf)> {
    let pos = s
        .find('=')
        .ok_or_else(|| anyhow::anyhow!("invalid SOURCE=dir: no `=` found in `{}`", s))?;
    Ok((s[..pos].to_string(), PathBuf::from(&s[pos + 1..])))
}

/// Lists the files of each source directory, sorted
fn list_files(sources: &[(String, PathBuf)]) -> Result<BTreeMap<String, Vec<String>>> {
    let mut listings = BTreeMap::new();
    for (source, dir) in sources {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("Failed to list directory: {}", dir.display()))?
        {
            let entry = entry.with_context(|| format!("Failed to list directory: {}", dir.display()))?;
            if entry.path().is_file() {
                files.push(entry.path().display().to_string());
            }
        }
        files.sort();
        listings.insert(source.clone(), files);
    }
    Ok(listings)
}

struct Node {
    name: String,
    manager: PipelineManager,
}

pub async fn handle_run(args: RunArgs, config: &Config) -> Result<()> {
    let spec = load_spec(&args.spec)?;
    let run_id = args.run_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let file_listings = list_files(&args.files)?;
    let timeout = args.timeout.map(Duration::from_secs);

    let participants: Vec<String> = if spec.is_decentralized() {
        (1..=args.clients.max(1)).map(|i| format!("site-{}", i)).collect()
    } else {
        vec!["local".to_string()]
    };

    println!("{} {}", "Running".bold(), run_id.cyan());
    print_steps(&spec);

    let driver = Arc::new(PodmanDriver::new(&config.container_binary));
    let broker = MemoryBroker::new();
    let node_config = |mode: RunMode, name: &str| {
        let mut node = ManagerConfig::new(mode, name, &config.operating_dir).with_env_overrides();
        node.container_binary = config.container_binary.clone();
        if let Some(timeout) = timeout {
            node = node.with_peer_timeout(timeout);
        }
        if args.no_pull {
            node = node.without_image_pull();
        }
        node
    };

    let mut nodes = Vec::new();
    let mut results = JoinSet::new();
    let mut progress = None;

    if spec.is_decentralized() {
        let manager = PipelineManager::create(
            node_config(RunMode::Remote, "remote"),
            driver.clone(),
            Arc::new(broker.transport("remote", RunMode::Remote)),
        )
        .await
        .context("Failed to create the aggregator")?;

        let handle = manager
            .start_pipeline(
                StartRequest::new(spec.clone(), run_id.clone()).with_clients(participants.clone()),
            )
            .await
            .context("Failed to start the aggregator")?;
        progress = Some(handle.states);
        results.spawn(labelled("remote".to_string(), handle.result));
        nodes.push(Node {
            name: "remote".to_string(),
            manager,
        });
    }

    for name in &participants {
        let manager = PipelineManager::create(
            node_config(RunMode::Local, name),
            driver.clone(),
            Arc::new(broker.transport(name.clone(), RunMode::Local)),
        )
        .await
        .with_context(|| format!("Failed to create participant {}", name))?;

        let mut request = StartRequest::new(spec.clone(), run_id.clone());
        request.file_listings = file_listings.clone();
        let handle = manager
            .start_pipeline(request)
            .await
            .with_context(|| format!("Failed to start participant {}", name))?;
        if progress.is_none() {
            progress = Some(handle.states);
        }
        results.spawn(labelled(name.clone(), handle.result));
        nodes.push(Node {
            name: name.clone(),
            manager,
        });
    }

    if let Some(states) = progress {
        tokio::spawn(follow(states));
    }

    let mut outcomes = BTreeMap::new();
    let mut interrupted = false;
    loop {
        tokio::select! {
            joined = results.join_next() => match joined {
                Some(Ok((name, result))) => {
                    outcomes.insert(name, result);
                }
                Some(Err(e)) => warn!("Result task failed: {}", e),
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                println!("{}", "Interrupted, stopping run...".yellow());
                for node in &nodes {
                    let manager = node.manager.clone();
                    let run_id = run_id.clone();
                    tokio::spawn(async move {
                        if let Err(e) = manager.stop_pipeline(&run_id, "interrupted").await {
                            debug!("Stop skipped: {}", e);
                        }
                    });
                }
            }
        }
    }

    for node in &nodes {
        if let Err(e) = node.manager.shutdown(ShutdownMode::Graceful).await {
            warn!("Failed to shut down {}: {}", node.name, e);
        }
    }

    print_outcomes(&outcomes)
}

async fn labelled(
    name: String,
    result: impl std::future::Future<Output = coinstac_pipeline::Result<PipelineOutput>>,
) -> (String, coinstac_pipeline::Result<PipelineOutput>) {
    (name, result.await)
}

/// Prints step and iteration changes until the run is terminal
async fn follow(mut states: broadcast::Receiver<StateEvent>) {
    let mut last = None;
    loop {
        match states.recv().await {
            Ok(StateEvent::Update(snapshot)) => {
                let current = (snapshot.step, snapshot.iteration, snapshot.status);
                if last == Some(current) {
                    continue;
                }
                last = Some(current);

                let waiting = if snapshot.waiting_on.is_empty() {
                    String::new()
                } else {
                    format!(" waiting on {}", snapshot.waiting_on.join(", "))
                };
                println!(
                    "  {} step {} iteration {} {}{}",
                    "▸".cyan(),
                    snapshot.step,
                    snapshot.iteration,
                    snapshot.status.to_string().dimmed(),
                    waiting.dimmed()
                );
            }
            Ok(StateEvent::Terminal(event)) => {
                let status = match event.status {
                    TerminalStatus::Complete => event.status.to_string().green(),
                    TerminalStatus::Cancelled => event.status.to_string().yellow(),
                    TerminalStatus::Error => event.status.to_string().red(),
                };
                println!("  {} {}", "■".cyan(), status.bold());
                break;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("Progress display skipped {} update(s)", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_outcomes(outcomes: &BTreeMap<String, coinstac_pipeline::Result<PipelineOutput>>) -> Result<()> {
    println!();
    let mut failed = 0;
    let mut printed_output = false;

    for (name, outcome) in outcomes {
        match outcome {
            Ok(output) => {
                println!(
                    "{} {} in {}ms ({} step(s))",
                    "✓".green().bold(),
                    name.bold(),
                    output.duration_ms,
                    output.steps.len()
                );
                if !printed_output {
                    printed_output = true;
                    let pretty = serde_json::to_string_pretty(&output.output)
                        .context("Failed to format output")?;
                    println!("{}", pretty);
                }
            }
            Err(PipelineError::Cancelled { reason }) => {
                println!("{} {} cancelled: {}", "■".yellow(), name.bold(), reason);
                failed += 1;
            }
            Err(e) => {
                println!("{} {} failed: {}", "✗".red().bold(), name.bold(), e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        bail!("{} node(s) did not complete", failed);
    }
    Ok(())
}
