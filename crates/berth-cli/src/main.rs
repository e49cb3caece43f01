//! Berth CLI
//!
//! The `berth` command sizes deployments and drives rollouts.
//!
//! ## Commands
//!
//! - `plan`: Size a channel mix into servers and price it per provider
//! - `cost`: Print only the monthly cost estimates
//! - `presets`: List the built-in sizing presets
//! - `verify`: Probe build/artifact/GitOps/cluster health over HTTP
//! - `simulate`: Drive one request end to end against simulated systems

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};

use berth_core::{
    CallContext, ChannelRequirements, Complexity, CostEstimate, DeploymentRequest,
    DeploymentSpan, EngineConfig, HealthStatus, InfraReport, NewDeployment, Preset,
    ResourceCalculationInput, ResourcePlan, ResourcePlanner, ServiceType, SystemName,
    TargetEnvironment, METRICS,
};
use berth_rollout::simulated::{
    SimulatedArtifacts, SimulatedBuild, SimulatedGitOps, StaticAnalyzer, StaticProbe,
};
use berth_rollout::{
    Collaborators, DispatchStep, HealthProbe, HttpHealthProbe, InfraVerifier, WorkflowEngine,
};
use berth_state::{
    DeploymentStore, IssueSink, MemoryDeploymentStore, MemoryIssueSink, SurrealStateStore,
};

#[derive(Parser)]
#[command(name = "berth")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Deployment resource planning and rollout orchestration", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON log lines and JSON command output
    #[arg(long, global = true)]
    json: bool,

    /// Engine configuration file (TOML)
    #[arg(long, global = true, env = "BERTH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug, Clone)]
struct DemandArgs {
    /// Sizing preset: small, standard or large
    #[arg(long, conflicts_with = "channels")]
    preset: Option<String>,

    /// Channel counts, e.g. `callbot=10,chatbot=20`
    #[arg(long)]
    channels: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Size a channel mix into servers and price it
    Plan {
        #[command(flatten)]
        demand: DemandArgs,
    },

    /// Print monthly cost estimates only
    Cost {
        #[command(flatten)]
        demand: DemandArgs,
    },

    /// List sizing presets
    Presets,

    /// Check subsystem health over HTTP
    Verify {
        /// Target environment
        #[arg(long, default_value = "staging")]
        env: String,

        /// Probe endpoint as `system=url` (build, artifact, gitops, cluster)
        #[arg(long = "endpoint", value_name = "SYSTEM=URL")]
        endpoints: Vec<String>,

        /// Bearer token sent to the probes
        #[arg(long, env = "BERTH_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },

    /// Run one request end to end against simulated subsystems
    Simulate {
        /// Project name
        #[arg(long)]
        project: String,

        /// Repository URL
        #[arg(long)]
        repo: String,

        /// Target environment
        #[arg(long, default_value = "staging")]
        env: String,

        /// Branch to build
        #[arg(long, default_value = "main")]
        branch: String,

        /// Services the simulated analysis detects (default: all)
        #[arg(long, value_delimiter = ',')]
        services: Vec<String>,

        /// Report a subsystem as unreachable
        #[arg(long, value_name = "SYSTEM")]
        unhealthy: Vec<String>,

        /// Make one dispatch step fail every attempt (build, push, sync)
        #[arg(long, value_name = "STEP")]
        fail_step: Option<String>,

        /// SurrealDB URL for request state (default: in-memory)
        #[arg(long, env = "BERTH_DB_URL")]
        db_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    berth_core::init_tracing(cli.json, level);

    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };

    let result = match cli.command {
        Commands::Plan { demand } => cmd_plan(&demand, cli.json),
        Commands::Cost { demand } => cmd_cost(&demand, cli.json),
        Commands::Presets => cmd_presets(cli.json),
        Commands::Verify {
            env,
            endpoints,
            token,
        } => cmd_verify(&config, &env, &endpoints, token, cli.json).await,
        Commands::Simulate {
            project,
            repo,
            env,
            branch,
            services,
            unhealthy,
            fail_step,
            db_url,
        } => {
            let opts = SimulateOptions {
                project,
                repo,
                env,
                branch,
                services,
                unhealthy,
                fail_step,
                db_url,
            };
            cmd_simulate(config, opts, cli.json).await
        }
    };
    METRICS.flush();
    result
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn demand_input(demand: &DemandArgs) -> Result<ChannelRequirements> {
    match (&demand.preset, &demand.channels) {
        (Some(preset), _) => {
            let preset: Preset = preset.parse()?;
            Ok(preset.requirements())
        }
        (None, Some(list)) => Ok(ChannelRequirements::parse_list(list)?),
        (None, None) => Ok(Preset::Standard.requirements()),
    }
}

fn plan_for(demand: &DemandArgs) -> Result<ResourcePlan> {
    let requirements = demand_input(demand)?;
    let plan = ResourcePlanner::default()
        .plan(&ResourceCalculationInput::ChannelRequirements(requirements))?;
    Ok(plan)
}

fn cmd_plan(demand: &DemandArgs, json: bool) -> Result<()> {
    let plan = plan_for(demand)?;
    if json {
        return print_json(&plan);
    }

    let bundle = &plan.bundle;
    println!(
        "{:<18} {:<8} {:>9} {:>6} {:>8} {:>10} {:>5}",
        "ROLE", "TEMPLATE", "INSTANCES", "CORES", "MEM(GB)", "DISK(GB)", "GPU"
    );
    for server in &bundle.servers {
        let gpu = match (&server.gpu_type, server.gpu_count) {
            (Some(t), n) if n > 0 => format!("{}x{}", n, t),
            _ => "-".to_string(),
        };
        println!(
            "{:<18} {:<8} {:>9} {:>6} {:>8} {:>10} {:>5}",
            server.role,
            server.template,
            server.instance_count,
            server.cpu_cores,
            server.memory_gb,
            server.storage_gb,
            gpu
        );
    }
    println!();
    println!(
        "Total: {} instances, {} cores, {} GB memory, {} GB storage, {} GPU",
        bundle.instance_count(),
        bundle.cpu_cores,
        bundle.memory_gb,
        bundle.storage_gb,
        bundle.gpu_count
    );
    println!();
    print_costs(&plan.costs);
    Ok(())
}

fn print_costs(costs: &[CostEstimate]) {
    if costs.is_empty() {
        println!("No provider can host this bundle.");
        return;
    }
    for cost in costs {
        println!(
            "{:<6} {:>14} {}/month (compute {}, storage {})",
            cost.provider.as_str(),
            cost.monthly_amount,
            cost.currency,
            cost.compute_amount,
            cost.storage_amount
        );
    }
}

fn cmd_cost(demand: &DemandArgs, json: bool) -> Result<()> {
    let plan = plan_for(demand)?;
    if json {
        return print_json(&plan.costs);
    }
    print_costs(&plan.costs);
    Ok(())
}

#[derive(Serialize)]
struct PresetSummary {
    name: &'static str,
    channels: ChannelRequirements,
    instances: u32,
}

fn cmd_presets(json: bool) -> Result<()> {
    let planner = ResourcePlanner::default();
    let mut summaries = Vec::new();
    for preset in Preset::ALL {
        let channels = preset.requirements();
        let bundle = planner.bundle_for(&channels)?;
        summaries.push(PresetSummary {
            name: preset.name(),
            channels,
            instances: bundle.instance_count(),
        });
    }
    if json {
        return print_json(&summaries);
    }
    for summary in &summaries {
        let channels = summary
            .channels
            .iter()
            .map(|r| format!("{}={}", r.service_type, r.channel_count))
            .collect::<Vec<_>>()
            .join(",");
        println!(
            "{:<9} {:>3} instances  {}",
            summary.name, summary.instances, channels
        );
    }
    Ok(())
}

/// Split a `system=url` endpoint argument.
fn parse_endpoint(raw: &str) -> Result<(SystemName, String)> {
    let (system, url) = raw
        .split_once('=')
        .with_context(|| format!("expected SYSTEM=URL, got '{}'", raw))?;
    let system: SystemName = system.parse()?;
    let url = url.trim();
    if url.is_empty() {
        bail!("empty URL for {}", system);
    }
    Ok((system, url.to_string()))
}

async fn cmd_verify(
    config: &EngineConfig,
    env: &str,
    endpoints: &[String],
    token: Option<String>,
    json: bool,
) -> Result<()> {
    let environment: TargetEnvironment = env.parse()?;
    let timeout = config.timeouts.health_check();
    let mut verifier = InfraVerifier::new(timeout);
    for raw in endpoints {
        let (system, url) = parse_endpoint(raw)?;
        let probe = HttpHealthProbe::new(url, timeout)?;
        verifier = verifier.with_probe(system, Arc::new(probe));
    }

    let mut ctx = CallContext::new("cli");
    if let Some(token) = token {
        ctx = ctx.with_token(token);
    }
    let report = verifier.verify(&ctx, environment).await;
    if json {
        print_json(&report)?;
    } else {
        print_report(&report);
    }
    if !report.all_ready {
        bail!(
            "infrastructure not ready: {}",
            report
                .unready()
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    Ok(())
}

fn print_report(report: &InfraReport) {
    println!("Environment: {}", report.environment);
    for entry in &report.entries {
        let status = match entry.status {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unreachable => "unreachable",
        };
        match &entry.detail {
            Some(detail) => println!("  {:<9} {:<12} {}", entry.system_name, status, detail),
            None => println!("  {:<9} {}", entry.system_name, status),
        }
    }
    println!("All ready: {}", report.all_ready);
}

struct SimulateOptions {
    project: String,
    repo: String,
    env: String,
    branch: String,
    services: Vec<String>,
    unhealthy: Vec<String>,
    fail_step: Option<String>,
    db_url: Option<String>,
}

fn parse_step(raw: &str) -> Result<DispatchStep> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "build" => Ok(DispatchStep::Build),
        "push" => Ok(DispatchStep::Push),
        "sync" => Ok(DispatchStep::Sync),
        other => bail!("unknown dispatch step '{}'", other),
    }
}

fn simulated_collaborators(opts: &SimulateOptions) -> Result<Collaborators> {
    let services = if opts.services.is_empty() {
        ServiceType::ALL.to_vec()
    } else {
        opts.services
            .iter()
            .map(|s| s.parse::<ServiceType>())
            .collect::<Result<Vec<_>, _>>()?
    };

    let mut probes: BTreeMap<SystemName, Arc<dyn HealthProbe>> = BTreeMap::new();
    for system in SystemName::ALL {
        probes.insert(system, Arc::new(StaticProbe::healthy()));
    }
    for raw in &opts.unhealthy {
        let system: SystemName = raw.parse()?;
        probes.insert(system, Arc::new(StaticProbe::new(HealthStatus::Unreachable)));
    }

    let failing = opts.fail_step.as_deref().map(parse_step).transpose()?;
    let mut build = SimulatedBuild::new();
    let mut artifacts = SimulatedArtifacts::new();
    let mut gitops = SimulatedGitOps::new();
    match failing {
        Some(DispatchStep::Build) => build = build.always_failing(),
        Some(DispatchStep::Push) => artifacts = artifacts.always_failing(),
        Some(DispatchStep::Sync) => gitops = gitops.always_failing(),
        None => {}
    }

    Ok(Collaborators {
        analyzer: Arc::new(StaticAnalyzer::detecting(&services, Complexity::Medium)),
        probes,
        build: Arc::new(build),
        artifacts: Arc::new(artifacts),
        gitops: Arc::new(gitops),
    })
}

async fn cmd_simulate(config: EngineConfig, opts: SimulateOptions, json: bool) -> Result<()> {
    let environment: TargetEnvironment = opts.env.parse()?;
    let collaborators = simulated_collaborators(&opts)?;

    let store: Arc<dyn DeploymentStore>;
    let issues: Arc<dyn IssueSink>;
    match &opts.db_url {
        Some(url) => {
            let surreal = Arc::new(
                SurrealStateStore::connect(url)
                    .await
                    .context("Failed to connect to Berth database")?,
            );
            store = surreal.clone();
            issues = surreal;
        }
        None => {
            store = Arc::new(MemoryDeploymentStore::new());
            issues = Arc::new(MemoryIssueSink::new());
        }
    }

    let engine = WorkflowEngine::new(config, store, issues, collaborators);
    let ctx = CallContext::new("cli");
    let submission = NewDeployment::new(&opts.project, &opts.repo, &opts.branch, environment);
    let request = engine.submit(&ctx, submission).await?;
    info!(deployment_id = %request.id, "simulating rollout");

    let outcome = engine.run_until_checkpoint(&ctx, request.id).await;
    let current = engine.get(request.id).await?;
    let raised = engine.issues_for(request.id).await?;

    if json {
        print_json(&serde_json::json!({
            "request": &current,
            "issues": &raised,
        }))?;
    } else {
        print_request(&current);
        for issue in &raised {
            println!("Issue {} [{:?}] {}", issue.id, issue.severity, issue.message);
        }
    }

    outcome?;
    Ok(())
}

fn print_request(request: &DeploymentRequest) {
    let _span = DeploymentSpan::enter(request.id);
    println!("Request:  {}", request.id);
    println!("Project:  {}", request.project_name);
    println!("Target:   {}", request.target_environment);
    if let Some(config) = &request.config {
        println!(
            "Namespace: {}/{} ({:?})",
            config.cluster, config.namespace, config.strategy
        );
    }
    println!();
    for entry in &request.stage_history {
        println!(
            "  {:<20} {:<8} retries={} inputs=v{} at {}",
            entry.stage.as_str(),
            format!("{:?}", entry.status).to_lowercase(),
            entry.retry_count,
            entry.inputs_version,
            entry.completed_at.format("%H:%M:%S%.3f"),
        );
    }
    println!();
    match &request.failure {
        Some(failure) => println!(
            "Failed at {} ({}): {}",
            failure.stage,
            failure.kind.as_str(),
            failure.message
        ),
        None => println!("Stage: {}", request.stage),
    }
}
