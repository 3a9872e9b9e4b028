//! Operon CLI - durable AI-agent pipelines over git worktrees
//!
//! Usage:
//!   operon init                     Register this repository as a project
//!   operon run "<requirements>"     Submit and drive a pipeline
//!   operon status [pipeline]        Show pipelines, or one in detail
//!   operon review <pipeline> <d>    Record a plan review decision
//!   operon answer <gate> <text>     Resolve an intervention or consultation
//!   operon pause <pipeline>         Park an active pipeline
//!   operon resume <pipeline>        Wake a paused pipeline and drive it
//!   operon cancel <pipeline>        Cancel a pipeline
//!   operon recover                  Resume every unfinished pipeline
//!   operon evolution list           Show applied project-level changes

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use operon_agent::AgentRunner;
use operon_core::{
    EventBus, OperonConfig, Pipeline, PipelineEvent, PlanDecision, Project, StateStore,
};
use operon_engine::PipelineEngine;
use operon_gate::GateManager;
use operon_git::{GitCommand, GitExecutor};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const STATE_DIR: &str = ".operon/state";

type Engine = PipelineEngine<GitCommand, AgentRunner>;

#[derive(Parser)]
#[command(name = "operon")]
#[command(author, version, about = "Durable AI-agent pipelines over git worktrees")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register this repository as an Operon project
    Init {
        /// Project name (defaults to the repository directory name)
        #[arg(long)]
        name: Option<String>,

        /// Branch task branches merge back into
        #[arg(long)]
        base_branch: Option<String>,

        /// Budget ceiling per pipeline in USD
        #[arg(long)]
        budget: Option<f64>,

        /// Pin every run of this project to one model
        #[arg(long)]
        model: Option<String>,
    },

    /// Submit a pipeline and drive it until it parks or finishes
    Run {
        /// Requirements text (omit when using --file)
        requirements: Option<String>,

        /// Read requirements from a file
        #[arg(long, value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Show all pipelines, or one pipeline in detail
    Status {
        /// Pipeline id
        pipeline: Option<String>,
    },

    /// Record a plan review decision and drive the pipeline onward
    Review {
        /// Pipeline id
        pipeline: String,

        /// The decision
        decision: CliDecision,

        /// Feedback for the next plan (edit only)
        #[arg(long)]
        feedback: Option<String>,
    },

    /// Answer an open intervention or consultation by id
    Answer {
        /// Gate id
        gate: String,

        /// The response text
        response: String,
    },

    /// Park an active pipeline
    Pause {
        /// Pipeline id
        pipeline: String,
    },

    /// Wake a paused pipeline and drive it
    Resume {
        /// Pipeline id
        pipeline: String,
    },

    /// Cancel a pipeline, killing its active runs
    Cancel {
        /// Pipeline id
        pipeline: String,
    },

    /// Resume every pipeline left unfinished by a previous process
    Recover,

    /// Project-level evolution log
    Evolution {
        #[command(subcommand)]
        action: EvolutionCommands,
    },
}

#[derive(Subcommand)]
enum EvolutionCommands {
    /// List applied changes
    List,

    /// Mark an applied change as rolled back
    Rollback {
        /// Evolution entry id
        id: String,
    },
}

/// CLI-friendly review decision
#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliDecision {
    Approve,
    Edit,
    Reject,
}

impl From<CliDecision> for PlanDecision {
    fn from(d: CliDecision) -> Self {
        match d {
            CliDecision::Approve => PlanDecision::Approve,
            CliDecision::Edit => PlanDecision::Edit,
            CliDecision::Reject => PlanDecision::Reject,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Init {
            name,
            base_branch,
            budget,
            model,
        } => cmd_init(name, base_branch, budget, model).await,
        Commands::Run { requirements, file } => cmd_run(requirements, file).await,
        Commands::Status { pipeline } => cmd_status(pipeline).await,
        Commands::Review {
            pipeline,
            decision,
            feedback,
        } => cmd_review(pipeline, decision, feedback).await,
        Commands::Answer { gate, response } => cmd_answer(gate, response).await,
        Commands::Pause { pipeline } => cmd_pause(pipeline).await,
        Commands::Resume { pipeline } => cmd_resume(pipeline).await,
        Commands::Cancel { pipeline } => cmd_cancel(pipeline).await,
        Commands::Recover => cmd_recover().await,
        Commands::Evolution { action } => cmd_evolution(action).await,
    }
}

struct Services {
    engine: Arc<Engine>,
    repo_root: PathBuf,
}

/// Wire every service against the repository the command runs in.
async fn connect() -> Result<Services> {
    let git = GitCommand::detect().await.context("Not in a git repository")?;
    let repo_root = git.repo_root().clone();
    let config = OperonConfig::load_or_default(&repo_root)?;

    let store = Arc::new(StateStore::new(repo_root.join(STATE_DIR)));
    let bus = EventBus::new(1024);
    let gates = Arc::new(GateManager::new(store.clone(), bus.clone()));
    let agents = Arc::new(AgentRunner::from_config(&config.process));
    let engine = Arc::new(PipelineEngine::new(store, config, bus, gates, git, agents));

    Ok(Services { engine, repo_root })
}

async fn current_project(services: &Services) -> Result<Project> {
    services
        .engine
        .store()
        .list_projects()
        .await?
        .into_iter()
        .find(|p| p.repo_path == services.repo_root)
        .ok_or_else(|| anyhow::anyhow!("No project registered here; run 'operon init' first"))
}

/// Answer blocking gates interactively while the engine is parked on
/// them. The engine raises a gate, we prompt on stdin, the answer
/// unparks it. Runs until aborted or stdin closes.
fn spawn_gate_prompter(engine: &Arc<Engine>) -> tokio::task::JoinHandle<()> {
    let mut events = engine.bus().subscribe();
    let gates = engine.gates();
    tokio::spawn(async move {
        let mut input = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            };
            let (is_intervention, id, question) = match event {
                PipelineEvent::InterventionRequested {
                    intervention_id,
                    question,
                    ..
                } => (true, intervention_id, question),
                PipelineEvent::ConsultationRequested {
                    consultation_id,
                    blocking: true,
                    question,
                    ..
                } => (false, consultation_id, question),
                _ => continue,
            };

            println!();
            println!("The pipeline needs an answer:");
            println!("  {}", question);
            print!("> ");
            let _ = std::io::stdout().flush();

            let line = match input.next_line().await {
                Ok(Some(line)) => line,
                _ => break,
            };
            let result = if is_intervention {
                gates.resolve_intervention(&id, line.trim()).await.map(|_| ())
            } else {
                gates.answer_consultation(&id, line.trim()).await.map(|_| ())
            };
            if let Err(err) = result {
                warn!(%err, gate = %id, "Could not record the answer");
            }
        }
    })
}

async fn report_pipeline(engine: &Engine, pipeline: &Pipeline) -> Result<()> {
    println!();
    println!("Pipeline {} is {}", pipeline.id, pipeline.state);
    println!("  cost: ${:.2}", pipeline.total_cost_usd);
    if let Some(error) = &pipeline.error_message {
        println!("  error: {}", error);
    }

    if pipeline.state.requires_human() {
        if let Some(plan) = engine.store().latest_plan(&pipeline.id).await? {
            println!();
            println!("Plan v{} awaits review:", plan.version);
            for task in &plan.tasks {
                let deps = if task.depends_on.is_empty() {
                    String::new()
                } else {
                    format!(" (after {})", task.depends_on.join(", "))
                };
                println!("  - {} [{}] {}{}", task.title, task.role, task.complexity, deps);
            }
            println!();
            println!(
                "Decide with: operon review {} approve|edit|reject",
                pipeline.id
            );
        }
    }
    Ok(())
}

async fn cmd_init(
    name: Option<String>,
    base_branch: Option<String>,
    budget: Option<f64>,
    model: Option<String>,
) -> Result<()> {
    let git = GitCommand::detect().await.context("Not in a git repository")?;
    let repo_root = git.repo_root().clone();

    let config_path = repo_root.join(".operon/config.toml");
    if config_path.exists() {
        println!("Config already present: {}", config_path.display());
    } else {
        OperonConfig::write_default(&repo_root)?;
        println!("Created {}", config_path.display());
    }

    let store = StateStore::new(repo_root.join(STATE_DIR));
    if let Some(existing) = store
        .list_projects()
        .await?
        .into_iter()
        .find(|p| p.repo_path == repo_root)
    {
        println!(
            "Project already registered: {} ({})",
            existing.name, existing.id
        );
        return Ok(());
    }

    let name = name.unwrap_or_else(|| {
        repo_root
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("project")
            .to_string()
    });
    let mut project = Project::new(name, repo_root.clone());
    if let Some(branch) = base_branch {
        project = project.with_base_branch(branch);
    }
    if let Some(budget) = budget {
        project = project.with_budget(budget);
    }
    if let Some(model) = model {
        project = project.with_default_model(model);
    }
    store.save_project(&project).await?;

    println!("Initialized Operon in {}", repo_root.display());
    println!("  project: {} ({})", project.name, project.id);
    println!("  base branch: {}", project.base_branch);
    println!("  budget: ${:.2} per pipeline", project.max_budget_usd);
    println!();
    println!("Next: operon run \"<requirements>\"");
    Ok(())
}

async fn cmd_run(requirements: Option<String>, file: Option<PathBuf>) -> Result<()> {
    let requirements = match (requirements, file) {
        (_, Some(path)) => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?,
        (Some(text), None) => text,
        (None, None) => anyhow::bail!("Provide requirements text or --file"),
    };

    let services = connect().await?;
    let project = current_project(&services).await?;
    let prompter = spawn_gate_prompter(&services.engine);

    let pipeline = services.engine.submit(&project.id, &requirements).await?;
    info!(pipeline_id = %pipeline.id, "Pipeline submitted");
    println!("Pipeline {} submitted", pipeline.id);

    let driven = services.engine.run(&pipeline.id).await?;
    prompter.abort();
    report_pipeline(&services.engine, &driven).await
}

async fn cmd_status(pipeline: Option<String>) -> Result<()> {
    let services = connect().await?;
    match pipeline {
        Some(id) => status_detail(&services.engine, &id).await,
        None => status_table(&services.engine).await,
    }
}

async fn status_table(engine: &Engine) -> Result<()> {
    let pipelines = engine.store().list_pipelines().await?;
    if pipelines.is_empty() {
        println!("No pipelines yet");
        return Ok(());
    }

    println!("Pipelines:");
    for p in pipelines {
        println!(
            "  {}  {:<20} ${:<8.2} replans={} reentries={}",
            p.id,
            p.state.to_string(),
            p.total_cost_usd,
            p.replan_count,
            p.reentry_count
        );
        if let Some(error) = &p.error_message {
            println!("      error: {}", error);
        }
    }
    Ok(())
}

async fn status_detail(engine: &Engine, pipeline_id: &str) -> Result<()> {
    let store = engine.store();
    let pipeline = store.load_pipeline(pipeline_id).await?;
    let project = store.load_project(&pipeline.project_id).await?;

    println!("Pipeline {}", pipeline.id);
    println!("  state: {}", pipeline.state);
    println!(
        "  budget: ${:.2} of ${:.2}",
        pipeline.total_cost_usd, project.max_budget_usd
    );
    println!(
        "  tokens: {} in / {} out",
        pipeline.total_input_tokens, pipeline.total_output_tokens
    );
    println!(
        "  replans: {}  reentries: {}",
        pipeline.replan_count, pipeline.reentry_count
    );
    if let Some(model) = &pipeline.current_model {
        println!("  pinned model: {}", model);
    }
    if let Some(error) = &pipeline.error_message {
        println!("  error: {}", error);
    }

    let stages = store.list_stages_for_pipeline(pipeline_id).await?;
    if !stages.is_empty() {
        println!();
        println!("Stages:");
        for stage in &stages {
            let error = stage
                .error_message
                .as_ref()
                .map(|e| format!("  ({})", e))
                .unwrap_or_default();
            println!(
                "  {:<20} {:<10} attempt {}{}",
                stage.kind.to_string(),
                stage.state.to_string(),
                stage.attempt,
                error
            );
        }
    }

    let tasks = store.list_tasks_for_pipeline(pipeline_id).await?;
    if !tasks.is_empty() {
        println!();
        println!("Tasks:");
        for task in &tasks {
            let merge = task
                .merge_status
                .map(|m| format!("  merge: {}", m))
                .unwrap_or_default();
            println!("  {:<30} {:<10}{}", task.title, task.state.to_string(), merge);
        }
    }

    let runs = store.list_runs_for_pipeline(pipeline_id).await?;
    if !runs.is_empty() {
        println!();
        println!("Agent runs:");
        for run in &runs {
            let exit = run
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "running".to_string());
            println!("  {:<14} exit={:<8} ${:.4}  {}", run.model, exit, run.cost_usd, run.id);
        }
    }

    for intervention in store.list_pending_interventions(pipeline_id).await? {
        println!();
        println!("Pending intervention {}:", intervention.id);
        println!("  {}", intervention.question);
        println!("  Answer with: operon answer {} \"<response>\"", intervention.id);
    }
    for consultation in store.list_pending_consultations(pipeline_id).await? {
        println!();
        println!("Pending consultation {}:", consultation.id);
        println!("  {}", consultation.question);
        println!("  Answer with: operon answer {} \"<response>\"", consultation.id);
    }

    let tools = store.list_tools_for_pipeline(pipeline_id).await?;
    if !tools.is_empty() {
        println!();
        println!("Generated tools:");
        for tool in &tools {
            println!("  {}", tool.name);
        }
    }
    Ok(())
}

async fn cmd_review(
    pipeline_id: String,
    decision: CliDecision,
    feedback: Option<String>,
) -> Result<()> {
    let services = connect().await?;
    let prompter = spawn_gate_prompter(&services.engine);

    let reviewed = services
        .engine
        .handle_plan_review(&pipeline_id, decision.into(), feedback)
        .await?;
    println!("Review recorded; pipeline is {}", reviewed.state);

    let driven = services.engine.run(&pipeline_id).await?;
    prompter.abort();
    report_pipeline(&services.engine, &driven).await
}

async fn cmd_answer(gate_id: String, response: String) -> Result<()> {
    let services = connect().await?;
    let gates = services.engine.gates();

    match gates.resolve_intervention(&gate_id, &response).await {
        Ok(intervention) => {
            println!("Intervention {} resolved", intervention.id);
            Ok(())
        }
        Err(intervention_err) => match gates.answer_consultation(&gate_id, &response).await {
            Ok(consultation) => {
                println!("Consultation {} answered", consultation.id);
                Ok(())
            }
            Err(consultation_err) => anyhow::bail!(
                "No open gate with id {}: {}; {}",
                gate_id,
                intervention_err,
                consultation_err
            ),
        },
    }
}

async fn cmd_pause(pipeline_id: String) -> Result<()> {
    let services = connect().await?;
    let paused = services.engine.pause(&pipeline_id).await?;
    let from = paused
        .paused_from_state
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!("Pipeline {} paused (was {})", paused.id, from);
    Ok(())
}

async fn cmd_resume(pipeline_id: String) -> Result<()> {
    let services = connect().await?;
    let prompter = spawn_gate_prompter(&services.engine);

    let driven = services.engine.resume(&pipeline_id).await?;
    prompter.abort();
    report_pipeline(&services.engine, &driven).await
}

async fn cmd_cancel(pipeline_id: String) -> Result<()> {
    let services = connect().await?;
    let cancelled = services.engine.cancel(&pipeline_id).await?;
    println!("Pipeline {} is {}", cancelled.id, cancelled.state);
    Ok(())
}

async fn cmd_recover() -> Result<()> {
    let services = connect().await?;
    let prompter = spawn_gate_prompter(&services.engine);

    let ids = services.engine.recover_all().await?;
    if ids.is_empty() {
        prompter.abort();
        println!("No unfinished pipelines");
        return Ok(());
    }
    info!(count = ids.len(), "Recovery started");
    println!("Recovering {} pipeline(s)", ids.len());

    // The resumed runs are in-process tasks; wait until each pipeline
    // has parked, paused, or reached a terminal state.
    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let mut settled = true;
        for id in &ids {
            let pipeline = services.engine.store().load_pipeline(id).await?;
            if pipeline.state.is_active() && !pipeline.state.requires_human() {
                settled = false;
                break;
            }
        }
        if settled {
            break;
        }
    }
    prompter.abort();

    for id in &ids {
        let pipeline = services.engine.store().load_pipeline(id).await?;
        report_pipeline(&services.engine, &pipeline).await?;
    }
    Ok(())
}

async fn cmd_evolution(action: EvolutionCommands) -> Result<()> {
    let services = connect().await?;
    let store = services.engine.store();

    match action {
        EvolutionCommands::List => {
            let project = current_project(&services).await?;
            let entries = store.list_evolution_for_project(&project.id).await?;
            if entries.is_empty() {
                println!("No evolution entries yet");
                return Ok(());
            }

            println!("Evolution log:");
            for entry in entries {
                let flag = if entry.rolled_back { " (rolled back)" } else { "" };
                println!("  {}  {:?}{}", entry.id, entry.kind, flag);
                for line in entry.description.lines().take(2) {
                    println!("      {}", line);
                }
            }
        }

        EvolutionCommands::Rollback { id } => {
            let entry = store.mark_evolution_rolled_back(&id).await?;
            println!("Rolled back evolution entry {}", entry.id);
            println!("Previous value:");
            for line in entry.previous.lines().take(10) {
                println!("  {}", line);
            }
        }
    }
    Ok(())
}
