//! The hearth CLI: the supporting shell around the automation runtime.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use hearth_hub::{HubClient, MockHub, RestHub};
use hearth_runtime::{Config, LlmFactory, ModelRef, ProviderFactory, RunOutcome, Runtime};
use hearth_store::Store;
use hearth_trigger::SystemClock;

#[derive(Parser)]
#[command(name = "hearth", version, about = "Agentic automation engine for a home-automation hub")]
struct Cli {
    /// Config file (default: $HEARTH_CONFIG, then ./hearth.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the automation runtime.
    Serve {
        /// HTTP port for the front-end shell.
        #[arg(long)]
        port: Option<u16>,
        /// Notebook directory override.
        #[arg(long)]
        notebook: Option<PathBuf>,
        /// Validate service calls without contacting the hub.
        #[arg(long)]
        test_mode: bool,
        /// Use the canned fixture hub instead of a real one.
        #[arg(long)]
        eval_mode: bool,
    },
    /// Expose the scheduling and execution tool suites over stdio MCP.
    Mcp {
        /// Validate service calls without contacting the hub.
        #[arg(long)]
        test_mode: bool,
        /// Notebook directory override.
        #[arg(long)]
        notebook: Option<PathBuf>,
    },
    /// Run the scenario catalog and print scores.
    Evals {
        /// Model to evaluate.
        #[arg(long)]
        model: Option<String>,
        /// Provider entry to evaluate (defaults to the configured one).
        #[arg(long)]
        driver: Option<String>,
        /// Limit to the first N scenarios.
        #[arg(long)]
        num: Option<usize>,
        /// Skip judge-model graders.
        #[arg(long)]
        quick: bool,
    },
    /// Write a diagnostic bundle to a timestamped directory.
    DumpBugReport {
        /// Database file override.
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "fatal");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve {
            port,
            notebook,
            test_mode,
            eval_mode,
        } => {
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(notebook) = notebook {
                config.notebook = notebook;
            }
            config.test_mode |= test_mode;
            serve(config, eval_mode).await
        }
        Command::Mcp {
            test_mode,
            notebook,
        } => {
            if let Some(notebook) = notebook {
                config.notebook = notebook;
            }
            config.test_mode |= test_mode;
            mcp(config).await
        }
        Command::Evals {
            model,
            driver,
            num,
            quick,
        } => evals(config, model, driver, num, quick).await,
        Command::DumpBugReport { db_path } => {
            if let Some(db_path) = db_path {
                config.db_path = db_path;
            }
            dump_bug_report(config).await
        }
    }
}

/// Build the hub client: real when configured, fixture otherwise.
fn hub_client(config: &Config, eval_mode: bool) -> Result<Arc<dyn HubClient>, Box<dyn std::error::Error>> {
    if eval_mode {
        return Ok(Arc::new(MockHub::new()));
    }
    match &config.hub {
        Some(hub) => Ok(Arc::new(RestHub::new(&hub.url, &hub.token))),
        None if config.test_mode => Ok(Arc::new(MockHub::new())),
        None => Err("no [hub] configured; set hub.url and hub.token or pass --test-mode".into()),
    }
}

async fn serve(config: Config, eval_mode: bool) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(Store::open(&config.db_path)?);
    let hub = hub_client(&config, eval_mode)?;
    let factory = Arc::new(ProviderFactory::from_config(&config));
    let runtime = Runtime::new(config, store, hub, Arc::new(SystemClock), factory)?;

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    loop {
        match runtime.run(cancel.clone()).await? {
            RunOutcome::Shutdown => {
                tracing::info!("clean shutdown");
                return Ok(());
            }
            RunOutcome::Restart => {
                tracing::info!("notebook replaced, rebooting runtime");
            }
        }
    }
}

async fn mcp(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    use hearth_store::{LogType, NewAutomationLog};
    use hearth_tool::ToolRouter;
    use hearth_tools::{execution_server, scheduling_server, ExecContext, MemoryFile, ScheduleContext};

    let store = Arc::new(Store::open(&config.db_path)?);
    let hub = hub_client(&config, false)?;
    let clock = Arc::new(SystemClock);

    let known_entities = match hub.fetch_states().await {
        Ok(states) => states.into_iter().map(|s| s.entity_id).collect(),
        Err(err) => {
            tracing::warn!(error = %err, "cannot fetch entities; skipping validation");
            Vec::new()
        }
    };

    // External tool hosts get one shared scheduling scope and one log
    // row to attach service calls to.
    let log_id = store
        .append_automation_log(&NewAutomationLog {
            automation_hash: None,
            log_type: LogType::Manual,
            messages: vec![],
            signaled_by: None,
        })
        .await?;

    let schedule_ctx = Arc::new(ScheduleContext {
        store: store.clone(),
        automation_hash: "mcp".into(),
        known_entities,
        clock: clock.clone(),
    });
    let exec_ctx = Arc::new(ExecContext::new(
        hub,
        store,
        log_id,
        config.test_mode,
        Arc::new(MemoryFile::new(
            hearth_runtime::notebook::memory_path(&config.notebook),
        )),
        None,
    ));

    let router = Arc::new(ToolRouter::new(vec![
        scheduling_server(schedule_ctx),
        execution_server(exec_ctx),
    ]));
    hearth_mcp::McpServer::new(router).serve_stdio().await?;
    Ok(())
}

async fn evals(
    config: Config,
    model: Option<String>,
    driver: Option<String>,
    num: Option<usize>,
    quick: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    use hearth_evals::{catalog, EvalHarness, Grader};

    let factory = Arc::new(ProviderFactory::from_config(&config));
    let model_ref = match (driver, model) {
        (Some(provider), model) => Some(ModelRef { provider, model }),
        (None, Some(model)) => config.model.as_deref().map(|default| {
            let mut parsed = ModelRef::parse(default);
            parsed.model = Some(model.clone());
            parsed
        }),
        (None, None) => None,
    };
    let judge = if quick {
        None
    } else {
        factory.create(None).ok().map(|(provider, _)| provider)
    };

    let mut scenarios = catalog();
    if quick {
        for scenario in &mut scenarios {
            scenario
                .graders
                .retain(|g| !matches!(g, Grader::LlmJudge { .. }));
        }
    }
    if let Some(num) = num {
        scenarios.truncate(num);
    }

    let harness = EvalHarness::new(factory, model_ref, judge);
    let results = harness.run_catalog(&scenarios).await;

    let mut total = 0.0;
    let mut possible = 0.0;
    for (scenario, result) in scenarios.iter().zip(&results) {
        total += result.final_score;
        possible += result.final_score_possible;
        println!(
            "{:<24} {:>5.1} / {:<5.1}  ({} messages)",
            scenario.name,
            result.final_score,
            result.final_score_possible,
            result.messages.len()
        );
        for grade in &result.grade_results {
            if let Some(reasoning) = &grade.reasoning {
                println!("    {}: {reasoning}", grade.grader);
            }
        }
    }
    println!("total: {total:.1} / {possible:.1}");
    Ok(())
}

async fn dump_bug_report(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let store = Store::open(&config.db_path)?;
    let timestamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
    let dir = PathBuf::from(format!("bug-report-{timestamp}"));
    std::fs::create_dir_all(&dir)?;

    if let Ok(hub) = hub_client(&config, false) {
        match hub.fetch_states().await {
            Ok(states) => std::fs::write(
                dir.join("states.json"),
                serde_json::to_string_pretty(&states)?,
            )?,
            Err(err) => tracing::warn!(error = %err, "states snapshot unavailable"),
        }
        match hub.fetch_services().await {
            Ok(services) => std::fs::write(
                dir.join("services.json"),
                serde_json::to_string_pretty(&services)?,
            )?,
            Err(err) => tracing::warn!(error = %err, "services snapshot unavailable"),
        }
    }

    let scan = hearth_runtime::notebook::scan(&config.notebook)?;
    let automations_dir = dir.join("automations");
    std::fs::create_dir_all(&automations_dir)?;
    for automation in &scan.automations {
        std::fs::write(automations_dir.join(&automation.file_name), &automation.contents)?;
    }
    let cues_dir = dir.join("cues");
    std::fs::create_dir_all(&cues_dir)?;
    for cue in &scan.cues {
        std::fs::write(cues_dir.join(&cue.file_name), &cue.contents)?;
    }

    let mut log_lines = String::new();
    for (created_at, level, message) in store.tail_logs(500).await? {
        log_lines.push_str(&format!("{created_at} [{level}] {message}\n"));
    }
    std::fs::write(dir.join("logs.txt"), log_lines)?;

    println!("wrote {}", dir.display());
    Ok(())
}

fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(err) => {
                    tracing::error!(error = %err, "cannot install SIGTERM handler");
                    let _ = ctrl_c.await;
                    cancel.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        tracing::info!("shutdown signal received");
        cancel.cancel();
    });
}
