//! CLI binary for running and validating Weir agent flow graphs.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_stream::StreamExt;

use weir_engine::{build, execute_graph, validate, ExecutorConfig, Severity};
use weir_types::{FlowEvent, RunLog};

#[derive(Parser)]
#[command(name = "weir", version, about = "Reactive runner for agent flow graphs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a flow graph from a JSON file
    Run {
        /// Path to the graph JSON file
        graph: PathBuf,

        /// The request message seeded into the graph's entry node
        #[arg(short, long, default_value = "")]
        message: String,

        /// Force debug mode on, regardless of the graph's setting
        #[arg(long)]
        debug: bool,

        /// Print debug records as JSON lines
        #[arg(long)]
        show_debug: bool,

        /// Per-node input timeout in seconds
        #[arg(long, default_value = "60")]
        input_timeout: u64,

        /// Maximum concurrently executing nodes
        #[arg(long, default_value = "10")]
        max_concurrent: usize,
    },

    /// Validate a flow graph JSON file
    Validate {
        /// Path to the graph JSON file
        graph: PathBuf,
    },

    /// Show information about a flow graph
    Info {
        /// Path to the graph JSON file
        graph: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            graph,
            message,
            debug,
            show_debug,
            input_timeout,
            max_concurrent,
        } => {
            cmd_run(
                &graph,
                &message,
                debug,
                show_debug,
                input_timeout,
                max_concurrent,
            )
            .await
        }
        Commands::Validate { graph } => cmd_validate(&graph),
        Commands::Info { graph } => cmd_info(&graph),
    }
}

fn load_spec(path: &Path) -> anyhow::Result<weir_schema::GraphSpec> {
    let text = std::fs::read_to_string(path)
        .map_err(|err| anyhow::anyhow!("cannot read {}: {err}", path.display()))?;
    Ok(weir_schema::parse(&text)?)
}

async fn cmd_run(
    path: &Path,
    message: &str,
    force_debug: bool,
    show_debug: bool,
    input_timeout: u64,
    max_concurrent: usize,
) -> anyhow::Result<()> {
    let mut spec = load_spec(path)?;
    if force_debug {
        spec.debug = true;
    }

    let graph = build(spec, message, None)?;
    let config = ExecutorConfig::default()
        .with_input_timeout(Duration::from_secs(input_timeout))
        .with_max_concurrent(max_concurrent);

    let mut stream = execute_graph(graph, RunLog::new(), config);
    let mut stdout = std::io::stdout();
    let mut summary = None;

    while let Some(event) = stream.next().await {
        match event {
            FlowEvent::Content { content, .. } => {
                // LLM deltas carry their text under "content"; other chunks
                // print as-is.
                let text = content
                    .get("content")
                    .and_then(|c| c.as_str())
                    .map(String::from)
                    .unwrap_or_else(|| match &content {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    });
                write!(stdout, "{text}")?;
                stdout.flush()?;
            }
            FlowEvent::Debug {
                content,
                event_type,
            } => {
                if show_debug {
                    let line = serde_json::json!({
                        "kind": "debug",
                        "event_type": event_type,
                        "content": content,
                    });
                    eprintln!("{line}");
                }
            }
            FlowEvent::LoopProgress { content } => {
                tracing::info!(
                    loop_id = %content.loop_id,
                    current = content.current,
                    total = content.total,
                    progress = content.progress,
                    "loop progress"
                );
            }
            FlowEvent::DebugSummary { content } => {
                summary = Some(content);
            }
        }
    }
    writeln!(stdout)?;

    if let Some(summary) = summary {
        eprintln!(
            "execution {}: {} nodes, {} executed, {} bypassed, {} failed",
            summary["execution_id"].as_str().unwrap_or("?"),
            summary["total_nodes"],
            summary["executed_nodes"],
            summary["bypassed_nodes"],
            summary["failed_nodes"],
        );
    }
    Ok(())
}

fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    let spec = load_spec(path)?;
    let diagnostics = validate(&spec);

    if diagnostics.is_empty() {
        println!("OK: {} nodes, {} edges", spec.nodes.len(), spec.edges.len());
        return Ok(());
    }

    let mut errors = 0;
    for diagnostic in &diagnostics {
        let label = match diagnostic.severity {
            Severity::Error => {
                errors += 1;
                "error"
            }
            Severity::Warning => "warning",
        };
        println!("{label}: [{}] {}", diagnostic.kind, diagnostic.message);
    }
    println!(
        "{} diagnostics ({errors} errors, {} warnings)",
        diagnostics.len(),
        diagnostics.len() - errors
    );

    if errors > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_info(path: &Path) -> anyhow::Result<()> {
    let spec = load_spec(path)?;

    println!("graph type : {}", spec.graph_type);
    println!("debug      : {}", spec.debug);
    println!("nodes      : {}", spec.nodes.len());
    println!("edges      : {}", spec.edges.len());

    let mut by_kind: BTreeMap<&str, usize> = BTreeMap::new();
    for node in &spec.nodes {
        *by_kind.entry(node.kind.as_str()).or_default() += 1;
    }
    for (kind, count) in by_kind {
        println!("  {kind:<14} {count}");
    }

    Ok(())
}
