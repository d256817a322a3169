mod echo;

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use hivemind_core::config::{ExecutionMode, GraphSpec, HivemindConfig};
use hivemind_core::error::HivemindError;
use hivemind_core::event::StartFrom;
use hivemind_core::frame::{Channel, ControlType, Frame};
use hivemind_core::types::ExecutionId;
use hivemind_engine::{
    ApprovalGate, DagOrchestrator, ExecutionGraph, ExecutionResult, ExecutionStatus, GraphNode,
};

use echo::{EchoAgent, FileWriteTool};

#[derive(Parser)]
#[command(name = "hivemind", version, about = "Swarm execution engine for cooperating agents")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "hivemind.toml", env = "HIVEMIND_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a graph file and print its levels
    Validate {
        /// Graph file (TOML, [[nodes]] tables)
        #[arg(long)]
        graph: PathBuf,
    },
    /// Run a task (or a graph) with echo agents, streaming frames as JSON lines
    Run {
        /// Task to run when no graph is given
        #[arg(long, required_unless_present = "graph")]
        task: Option<String>,
        /// Graph file to execute instead of planning from the task
        #[arg(long)]
        graph: Option<PathBuf>,
        /// sequential, parallel, or auto (defaults to engine.mode)
        #[arg(long)]
        mode: Option<ExecutionMode>,
        /// Approve every gated tool call
        #[arg(long)]
        auto_approve: bool,
        /// Save each agent's output here through the gated file_write tool
        #[arg(long)]
        out: Option<PathBuf>,
        /// Execution id (auto-generated if not provided)
        #[arg(long)]
        execution_id: Option<String>,
    },
    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("hivemind=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Validate { graph } = &cli.command {
        return validate(graph);
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Run {
            task,
            graph,
            mode,
            auto_approve,
            out,
            execution_id,
        } => {
            let execution_id = execution_id
                .map(|id| ExecutionId::from_str(&id))
                .unwrap_or_default();
            let options = RunOptions {
                task,
                graph,
                mode,
                auto_approve,
                out,
            };
            run(config, execution_id, options).await
        }
        Commands::Validate { .. } => Ok(()),
    }
}

fn load_config(path: &Path) -> anyhow::Result<HivemindConfig> {
    if path.exists() {
        let config = HivemindConfig::load(path)?;
        info!(path = %path.display(), agents = config.agents.len(), "Loaded config");
        Ok(config)
    } else {
        warn!(path = %path.display(), "No config file found, using defaults");
        Ok(HivemindConfig::default())
    }
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let spec = GraphSpec::load(path)?;
    match ExecutionGraph::from_spec(&spec) {
        Ok(graph) => {
            println!("{} nodes, {} levels", graph.len(), graph.levels().len());
            for (i, level) in graph.levels().iter().enumerate() {
                println!("  level {}: {}", i + 1, level.join(", "));
            }
            Ok(())
        }
        Err(HivemindError::GraphCycle { cycle }) => {
            println!("cycle: {}", cycle.join(" -> "));
            anyhow::bail!("graph contains a cycle")
        }
        Err(e) => Err(e.into()),
    }
}

struct RunOptions {
    task: Option<String>,
    graph: Option<PathBuf>,
    mode: Option<ExecutionMode>,
    auto_approve: bool,
    out: Option<PathBuf>,
}

async fn run(
    config: HivemindConfig,
    execution_id: ExecutionId,
    options: RunOptions,
) -> anyhow::Result<()> {
    let mode = options.mode.unwrap_or(config.engine.mode);
    let timeout_secs = config.approval.timeout_secs;
    let save_output = options.out.is_some();

    let mut orchestrator = DagOrchestrator::new(config.clone());
    if config.agents.is_empty() {
        orchestrator.register_agent(Arc::new(
            EchoAgent::new("assistant", "Assistant").saving_output(save_output),
        ));
    }
    for profile in &config.agents {
        orchestrator.register_agent(Arc::new(
            EchoAgent::new(&profile.id, &profile.role).saving_output(save_output),
        ));
    }
    if let Some(dir) = options.out {
        orchestrator.tools().register(Arc::new(FileWriteTool::new(dir))).await;
    }
    let orchestrator = Arc::new(orchestrator);
    info!(
        agents = orchestrator.agent_ids().len(),
        mode = %mode,
        "Swarm ready"
    );

    // Subscribe before the first frame so the printer sees everything.
    orchestrator.hub().open(&execution_id).await;
    let frames = orchestrator
        .hub()
        .subscribe(&execution_id, &Channel::ALL, StartFrom::Start)
        .await?;
    let printer = tokio::spawn(print_frames(
        frames,
        orchestrator.approvals().clone(),
        options.auto_approve,
        timeout_secs,
    ));

    let interrupt = {
        let orchestrator = orchestrator.clone();
        let execution_id = execution_id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(execution_id = %execution_id, "Interrupted, cancelling execution");
                orchestrator.cancel(&execution_id).await;
            }
        })
    };

    let result = match (options.graph, options.task) {
        (Some(path), _) => {
            let spec = GraphSpec::load(&path)?;
            let graph = orchestrator.build_graph(spec.nodes.iter().map(GraphNode::from).collect())?;
            orchestrator
                .execute_with_mode(&execution_id, &graph, mode)
                .await
        }
        (None, Some(task)) => orchestrator.run_task(&execution_id, &task, mode).await,
        (None, None) => anyhow::bail!("either --task or --graph is required"),
    };
    interrupt.abort();

    let result = match result {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Execution could not start");
            orchestrator.hub().delete_now(&execution_id).await;
            printer.abort();
            return Err(e.into());
        }
    };
    if let Err(e) = printer.await {
        warn!(error = %e, "Frame printer stopped early");
    }

    report(&result)?;
    match result.status {
        ExecutionStatus::Completed | ExecutionStatus::Partial => Ok(()),
        status => anyhow::bail!("execution {}", status),
    }
}

/// Print every frame as one JSON line, and answer approval requests.
async fn print_frames(
    mut frames: hivemind_core::event::Subscription,
    approvals: Arc<ApprovalGate>,
    auto_approve: bool,
    timeout_secs: u64,
) {
    let mut stdout = io::stdout();
    while let Some(entry) = frames.next().await {
        match serde_json::to_string(&entry.frame) {
            Ok(line) => {
                writeln!(stdout, "{}", line).ok();
                stdout.flush().ok();
            }
            Err(e) => warn!(error = %e, "Failed to encode frame"),
        }

        let Frame::Control(ref control) = entry.frame else {
            continue;
        };
        if control.kind != ControlType::ApprovalRequested {
            continue;
        }
        let Some(id) = control.payload["approval_id"].as_str() else {
            continue;
        };
        let tool = control.payload["tool"].as_str().unwrap_or("?");
        if auto_approve {
            let settled = approvals
                .resolve_approval(id, true, None, Some("auto-approved".into()))
                .await;
            eprintln!("[APPROVAL] {} auto-approved ({})", tool, settled);
        } else {
            eprintln!(
                "[APPROVAL] {} needs a decision; it times out in {}s (use --auto-approve)",
                tool, timeout_secs
            );
        }
    }
}

fn report(result: &ExecutionResult) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(&serde_json::json!({ "result": result }))?);

    eprintln!(
        "\n[{}] {} nodes, mode {} ({}), {}ms",
        result.status,
        result.nodes.len(),
        result.mode.mode,
        result.mode.reason,
        result.elapsed_ms
    );
    for (node, reason) in result.failures() {
        eprintln!("  {}: {}", node, reason);
    }
    if let Some(ref output) = result.output {
        eprintln!("\n{}", output);
    }
    Ok(())
}
