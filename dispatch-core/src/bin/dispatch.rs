//! `dispatch` CLI: boot a workspace, run a single goal, or start a REPL.
//!
//! The LLM backend behind every paid path is `dispatch_core`'s opaque
//! `CognitiveBackend` trait; this binary wires up `MockBackend` because no
//! concrete backend is in scope for the core (see crate docs). Swapping in a
//! real backend only touches `bootstrap`.

use clap::{Parser, Subcommand};
use dispatch_core::{
    AgentRegistry, CognitiveAdapter, Config, DispatchMode, Dispatcher, EventBus, MatcherThresholds,
    MemoryQuery, MockBackend, ProjectManager, TokenEconomy, TraceMatcher, TraceStore,
};
use std::io::{self, BufRead, Write};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dispatch")]
#[command(about = "Cost-aware execution dispatcher and learning memory", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// TOML config file to load before environment and CLI overrides.
    #[arg(long)]
    config: Option<String>,

    /// Workspace directory for traces, projects, and the spend log.
    #[arg(long, env = "LLMOS_WORKSPACE")]
    workspace: Option<String>,

    /// Initial token budget in USD (overrides config/env for this run).
    #[arg(long, env = "LLMOS_BUDGET")]
    budget: Option<f64>,

    /// Execution mode hint; AUTO lets the configured strategy decide.
    #[arg(long, value_enum, default_value = "auto")]
    mode: CliMode,

    /// Per-dispatch cost ceiling in USD.
    #[arg(long, default_value = "1.0")]
    max_cost: f64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum CliMode {
    Auto,
    Crystallized,
    Follower,
    Mixed,
    Learner,
    Orchestrator,
}

impl From<CliMode> for DispatchMode {
    fn from(mode: CliMode) -> Self {
        match mode {
            CliMode::Auto => DispatchMode::Auto,
            CliMode::Crystallized => DispatchMode::Crystallized,
            CliMode::Follower => DispatchMode::Follower,
            CliMode::Mixed => DispatchMode::Mixed,
            CliMode::Learner => DispatchMode::Learner,
            CliMode::Orchestrator => DispatchMode::Orchestrator,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the workspace directory and print the current budget.
    Boot,

    /// Run a REPL: one dispatch per line until `exit`/`quit`/EOF.
    Interactive,

    /// Dispatch a single goal and print the outcome.
    #[command(external_subcommand)]
    Goal(Vec<String>),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.log_level.as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "info" => "info",
        "error" => "error",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(format!("dispatch_core={level}")))
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let mut config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "configuration error");
            return ExitCode::from(2);
        }
    };
    if let Some(budget) = cli.budget {
        config.kernel.budget_usd = budget;
    }
    if let Err(err) = config.validate() {
        error!(%err, "invalid configuration");
        return ExitCode::from(2);
    }

    let dispatcher = bootstrap(&config);
    let mode: DispatchMode = cli.mode.into();

    match cli.command {
        Some(Commands::Boot) | None => {
            println!("workspace: {}", config.workspace.display());
            println!("budget:    ${:.4}", dispatcher.economy().balance_usd().await);
            ExitCode::SUCCESS
        }
        Some(Commands::Interactive) => run_interactive(&dispatcher, mode, cli.max_cost).await,
        Some(Commands::Goal(words)) => {
            let goal = words.join(" ");
            run_single(&dispatcher, &goal, mode, cli.max_cost).await
        }
    }
}

/// Precedence: CLI flag > environment variable > config file > default.
/// `Config::from_file`/`Config::from_env` already overlay the env on top of
/// the file/default; CLI flags (`--workspace`, `--budget`) are applied by
/// the caller after this returns.
fn load_config(cli: &Cli) -> dispatch_core::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    if let Some(workspace) = &cli.workspace {
        config.workspace = workspace.into();
    }
    Ok(config)
}

fn bootstrap(config: &Config) -> Dispatcher<MockBackend> {
    let event_bus = Arc::new(EventBus::new());
    let economy = Arc::new(
        TokenEconomy::new(config.kernel.budget_usd)
            .with_log_path(config.workspace.join("spend_log.json")),
    );
    let trace_store = Arc::new(TraceStore::new(&config.workspace));
    let thresholds = MatcherThresholds {
        follower: config.memory.follower_mode_threshold,
        mixed: config.memory.mixed_mode_threshold,
        auto_crystallization: config.dispatcher.auto_crystallization,
    };
    let trace_matcher = Arc::new(TraceMatcher::new(trace_store.clone(), thresholds));
    let memory_query = Arc::new(MemoryQuery::new(trace_store.clone(), trace_matcher.clone()));
    let project_manager = Arc::new(ProjectManager::new(&config.workspace));
    let agent_registry = Arc::new(AgentRegistry::new());
    let cognitive = Arc::new(CognitiveAdapter::new(Arc::new(MockBackend::default())));

    Dispatcher::new(
        event_bus,
        economy,
        trace_store,
        trace_matcher,
        memory_query,
        project_manager,
        agent_registry,
        cognitive,
        config.clone(),
    )
}

async fn run_single(
    dispatcher: &Dispatcher<MockBackend>,
    goal: &str,
    mode: DispatchMode,
    max_cost: f64,
) -> ExitCode {
    let outcome = dispatcher.dispatch(goal, mode, None, max_cost).await;
    print_outcome(&outcome);
    exit_code_for(&outcome)
}

async fn run_interactive(dispatcher: &Dispatcher<MockBackend>, mode: DispatchMode, max_cost: f64) -> ExitCode {
    println!("dispatch interactive — type a goal, or `exit`/`quit` to leave.");
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        let _ = io::stdout().flush();
        let Some(Ok(line)) = lines.next() else {
            return ExitCode::SUCCESS;
        };
        let goal = line.trim();
        if goal.is_empty() {
            continue;
        }
        if matches!(goal, "exit" | "quit") {
            return ExitCode::SUCCESS;
        }
        let outcome = dispatcher.dispatch(goal, mode, None, max_cost).await;
        print_outcome(&outcome);
        if exit_code_for(&outcome) == ExitCode::from(2) {
            return ExitCode::from(2);
        }
    }
}

fn print_outcome(outcome: &dispatch_core::DispatchOutcome) {
    println!(
        "mode={} success={} cost=${:.4} time={:.2}s",
        outcome.mode, outcome.success, outcome.cost_usd, outcome.execution_time_secs
    );
    if let Some(steps) = outcome.steps_completed {
        println!("steps: {}/{}", steps, outcome.total_steps.unwrap_or(steps));
    }
    if let Some(tool) = &outcome.tool_name {
        println!("tool: {tool}");
    }
    if let Some(error) = &outcome.error {
        println!("error: {error}");
    }
    if let Some(output) = &outcome.output {
        info!(%output, "dispatch output");
    }
}

fn exit_code_for(outcome: &dispatch_core::DispatchOutcome) -> ExitCode {
    if outcome.success {
        ExitCode::SUCCESS
    } else if outcome.error.as_deref().map(|e| e.contains("low battery")).unwrap_or(false) {
        ExitCode::from(1)
    } else {
        ExitCode::from(2)
    }
}
