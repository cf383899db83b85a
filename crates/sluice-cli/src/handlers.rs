//! Command handlers.

use crate::commands::TaskArgs;
use crate::config::{CliConfig, OutputFormat};
use anyhow::{Context, bail};
use console::style;
use sluice_core::node::{NodeKind, NodeTree};
use sluice_core::pipeline::PipelineDefinition;
use sluice_core::task::LocalTask;
use sluice_runner::{BollardRuntime, DirPluginResolver, LocalTaskExecutor};
use sluice_scheduler::{ExecutionGraph, GraphCompiler};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

fn load_graph(path: &Path) -> anyhow::Result<ExecutionGraph> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    compile_str(&content)
}

fn compile_str(content: &str) -> anyhow::Result<ExecutionGraph> {
    let definition: PipelineDefinition = serde_yaml::from_str(content)?;
    let tree = NodeTree::from_definition(&definition)?;
    let graph = GraphCompiler::new().compile(&tree)?;
    debug!(pipeline = %definition.name, nodes = graph.len(), "Pipeline compiled");
    Ok(graph)
}

/// Validate a pipeline file.
pub fn validate(path: &Path) -> anyhow::Result<()> {
    let graph = load_graph(path)?;
    let definition = graph.definition();

    println!(
        "{} Pipeline \"{}\" is valid",
        style("✓").green(),
        definition.name
    );
    println!("  Stages: {}", definition.stages.len());
    for stage in &definition.stages {
        println!("    - {} ({} steps)", stage.name, stage.steps.len());
    }
    println!("  Graph nodes: {}", graph.len());

    let conditions = graph.conditions();
    if !conditions.is_empty() {
        println!("  Conditions: {}", conditions.len());
    }
    let plugins = graph.plugins();
    if !plugins.is_empty() {
        println!(
            "  Plugins: {}",
            plugins.into_iter().collect::<Vec<_>>().join(", ")
        );
    }
    Ok(())
}

/// Print the compiled graph.
pub fn graph(path: &Path, format: OutputFormat) -> anyhow::Result<()> {
    let graph = load_graph(path)?;
    match format {
        OutputFormat::Table => print!("{}", graph_table(&graph)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&graph.snapshot())?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(&graph.snapshot())?),
    }
    Ok(())
}

fn kind_label(kind: NodeKind) -> &'static str {
    match kind {
        NodeKind::Flow => "flow",
        NodeKind::Stage => "stage",
        NodeKind::Step => "step",
    }
}

/// Nodes in execution order with the nodes they wait for.
fn graph_table(graph: &ExecutionGraph) -> String {
    let rows: Vec<(String, &str, String)> = graph
        .topological_order()
        .iter()
        .map(|&idx| {
            let node = &graph[idx];
            let parents = graph
                .parents(idx)
                .into_iter()
                .map(|p| graph[p].path().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            (node.path().to_string(), kind_label(node.node.kind), parents)
        })
        .collect();

    let width = rows
        .iter()
        .map(|(path, _, _)| path.len())
        .max()
        .unwrap_or(0)
        .max("NODE".len());

    let mut out = format!("{:<width$}  {:<5}  AFTER\n", "NODE", "KIND");
    for (path, kind, parents) in rows {
        let parents = if parents.is_empty() { "-".to_string() } else { parents };
        out.push_str(&format!("{path:<width$}  {kind:<5}  {parents}\n"));
    }
    out
}

/// Print the pipeline JSON schema.
pub fn schema() -> anyhow::Result<()> {
    let schema = schemars::schema_for!(PipelineDefinition);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

fn parse_env(pair: &str) -> anyhow::Result<(String, String)> {
    match pair.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => bail!("expected KEY=VALUE, got '{pair}'"),
    }
}

/// Run one task on the local docker daemon.
pub async fn run_task(config: &CliConfig, args: TaskArgs) -> anyhow::Result<()> {
    let name = args.plugin.clone().unwrap_or_else(|| "task".to_string());
    let mut task = LocalTask::new(name).with_timeout(args.timeout);
    task.script = args.script;
    task.plugin = args.plugin;
    if let Some(image) = args.image {
        task = task.with_image(image);
    }
    for pair in &args.env {
        let (key, value) = parse_env(pair)?;
        task = task.with_input(key, value);
    }

    let runtime = BollardRuntime::connect()?;
    let mut executor = LocalTaskExecutor::new(Arc::new(runtime), config.executor.clone());
    if let Some(dir) = args.plugin_dir.or_else(|| config.plugin_dir.clone()) {
        executor = executor.with_plugins(Arc::new(DirPluginResolver::new(dir)));
    }

    let (cancel, signal) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping task");
            cancel.send_replace(true);
        }
    });

    println!("{} Running {}", style("▶").cyan(), style(&task.name).bold());
    let result = executor.execute(task, signal).await?;

    if !result.stdout.is_empty() {
        println!("{}", result.stdout);
    }
    if !result.stderr.is_empty() {
        eprintln!("{}", style(&result.stderr).dim());
    }

    if result.is_success() {
        println!(
            "{} Finished in {}ms",
            style("✓").green(),
            result.duration_ms()
        );
        Ok(())
    } else {
        let detail = result.error.unwrap_or_default();
        bail!(
            "task ended with {} (exit code {}) {}",
            result.status,
            result.exit_code,
            detail
        )
    }
}

/// Show configuration.
pub fn show_config(config: &CliConfig) {
    println!("Current configuration:");
    println!("  output_format: {:?}", config.output_format);
    println!(
        "  plugin_dir: {}",
        config
            .plugin_dir
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(not set)".to_string())
    );
    println!("  executor.default_image: {}", config.executor.default_image);
    println!("  executor.kill_grace_secs: {}", config.executor.kill_grace_secs);
    println!("  executor.max_output_bytes: {}", config.executor.max_output_bytes);
    println!("  executor.server_url: {}", config.executor.server_url);

    if let Ok(path) = CliConfig::config_path() {
        println!("\nConfig file: {}", path.display());
    }
}

/// Set configuration.
pub fn set_config(key: &str, value: &str) -> anyhow::Result<()> {
    let mut config = CliConfig::load().unwrap_or_default();
    config.set(key, value)?;
    config.save()?;

    println!("{} Set {} = {}", style("✓").green(), key, value);
    Ok(())
}
