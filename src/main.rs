// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use foreman_cards::CardValidator;
use foreman_config::Config;
use foreman_daemon::{Daemon, DaemonOptions};
use foreman_governor::{SessionDispatcher, SessionRequest, SessionResponse};
use foreman_host::{HostApi, HttpHostClient, SessionSnapshot};
use foreman_store::{PgStore, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Commands::Completions { shell } = &cli.command {
        cli::print_completions(*shell);
        return Ok(());
    }

    let config = foreman_config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Start => run_daemon(config).await,
        Commands::Validate { task, card, json } => run_validate(config, &task, &card, json).await,
        Commands::Adherence { task, min, max } => run_adherence(config, &task, min, max).await,
        Commands::VerifySubtasks { task, card, json } => {
            run_verify_subtasks(config, &task, &card, json).await
        }
        Commands::SyncChildren => run_sync_children(config).await,
        Commands::Status { session, json } => run_status(config, &session, json).await,
        Commands::ShowConfig => {
            println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
            Ok(())
        }
        Commands::Completions { .. } => Ok(()),
    }
}

// ── Daemon ────────────────────────────────────────────────────────────────────

async fn run_daemon(config: Config) -> anyhow::Result<()> {
    let host = Arc::new(HttpHostClient::new(config.host.base_url()));
    let store = Arc::new(PgStore::new(config.store.connect_url()));
    let dispatcher = Arc::new(HostSessionDispatcher::new(config.host.base_url()));
    let options = DaemonOptions::from_config(&config);

    let (daemon, handle) = Daemon::new(host, store, dispatcher, options);

    // First Ctrl-C asks for a clean shutdown; the in-flight governor action
    // finishes before the daemon exits.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            handle.stop();
        }
    });

    info!(host = %config.host.base_url(), "starting foreman daemon");
    daemon.run().await
}

/// Dispatcher that creates fitter sessions directly on the agent host.
///
/// The workflow layer injects its own [`SessionDispatcher`] when it drives
/// recovery through durable steps; this is the standalone-daemon default.
struct HostSessionDispatcher {
    base_url: String,
    client: reqwest::Client,
}

impl HostSessionDispatcher {
    fn new(base_url: String) -> Self {
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl SessionDispatcher for HostSessionDispatcher {
    async fn create_session(&self, request: SessionRequest) -> anyhow::Result<SessionResponse> {
        let started = std::time::Instant::now();
        let body = serde_json::json!({
            "prompt": request.prompt,
            "mode": request.agent_mode,
            "model": request.model,
            "autoApprove": request.auto_approve,
            "maxTokens": request.max_token_budget,
            "timeoutMs": request.timeout_ms,
        });
        let resp = self
            .client
            .post(format!("{}/session", self.base_url))
            .json(&body)
            .send()
            .await
            .context("creating fitter session")?;
        if !resp.status().is_success() {
            anyhow::bail!("host rejected fitter session: {}", resp.status());
        }
        let created: serde_json::Value = resp.json().await.context("decoding session response")?;
        let session_id = created["id"].as_str().unwrap_or_default().to_string();
        Ok(SessionResponse {
            session_id,
            success: true,
            cost: 0.0,
            files_changed: Vec::new(),
            duration_ms: started.elapsed().as_millis() as u64,
            error: None,
        })
    }
}

// ── Validation commands ───────────────────────────────────────────────────────

/// Open the store for a one-shot command, run `f`, and disconnect.
async fn with_store<T, F, Fut>(config: &Config, f: F) -> anyhow::Result<T>
where
    F: FnOnce(Arc<PgStore>) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    let store = Arc::new(PgStore::new(config.store.connect_url()));
    store.connect().await.context("connecting punch store")?;
    let result = f(store.clone()).await;
    let _ = store.disconnect().await;
    result
}

async fn run_validate(config: Config, task: &str, card: &str, json: bool) -> anyhow::Result<()> {
    let result = with_store(&config, |store| async move {
        Ok(CardValidator::new(store).validate(task, card).await?)
    })
    .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if result.passed() {
        println!("PASS: task {task} satisfies card {card}");
    } else {
        println!("FAIL: task {task} against card {card}");
        for m in &result.missing {
            println!("  missing:   {m}");
        }
        for v in &result.violations {
            println!("  violation: {v}");
        }
    }

    if result.passed() {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

async fn run_adherence(config: Config, task: &str, min: u64, max: u64) -> anyhow::Result<()> {
    let adherence = with_store(&config, |store| async move {
        Ok(CardValidator::new(store)
            .check_tool_adherence(task, (min, max))
            .await?)
    })
    .await?;

    println!(
        "{}: {} mutating calls (allowed {}..={})",
        if adherence.within_range { "PASS" } else { "FAIL" },
        adherence.count,
        adherence.min,
        adherence.max,
    );
    if adherence.within_range {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

async fn run_verify_subtasks(
    config: Config,
    task: &str,
    card: &str,
    json: bool,
) -> anyhow::Result<()> {
    let report = with_store(&config, |store| async move {
        Ok(CardValidator::new(store).verify_subtasks(task, card).await?)
    })
    .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "{}: {} children of task {task}",
            if report.all_children_valid { "PASS" } else { "FAIL" },
            report.children.len(),
        );
        for (child, result) in &report.children {
            println!(
                "  {child}: {}",
                if result.passed() { "pass" } else { "fail" }
            );
        }
    }

    if report.all_children_valid {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

async fn run_status(config: Config, session: &str, json: bool) -> anyhow::Result<()> {
    let host = HttpHostClient::new(config.host.base_url());
    let parts = host
        .list_messages(session)
        .await
        .context("fetching session history")?;
    let snapshot = SessionSnapshot::from_parts(session, &parts);

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        println!("session {session}");
        println!(
            "  parts: {} ({} tool calls, {} errors, {} text)",
            snapshot.part_count, snapshot.tool_calls, snapshot.tool_errors, snapshot.text_parts
        );
        println!(
            "  cost: ${:.4}  tokens: {} in / {} out",
            snapshot.total_cost, snapshot.tokens_input, snapshot.tokens_output
        );
        if let Some(tool) = &snapshot.last_tool {
            println!("  last tool: {tool}");
        }
        if let Some(text) = &snapshot.last_text {
            println!("  last text: {text}");
        }
    }
    Ok(())
}

async fn run_sync_children(config: Config) -> anyhow::Result<()> {
    let inserted = with_store(&config, |store| async move {
        Ok(store.sync_child_rels_from_punches().await?)
    })
    .await?;
    println!("{inserted} child relation(s) recovered from punches");
    Ok(())
}

// ── Logging ───────────────────────────────────────────────────────────────────

fn init_logging(verbosity: u8) {
    // FOREMAN_LOG overrides the verbosity flags; FOREMAN_LOG_FILE redirects
    // output for long-running daemon deployments.
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("FOREMAN_LOG").unwrap_or_else(|_| EnvFilter::new(level));

    if let Ok(log_path) = std::env::var("FOREMAN_LOG_FILE") {
        use std::sync::Mutex;
        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
        {
            let _ = tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
                .with(filter)
                .try_init();
            return;
        }
    }

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
