//! # compliance-lake
//!
//! Command-line interface for provisioning the compliance data lake.
//!
//! ## Usage
//!
//! ```bash
//! # Show what an apply would change
//! compliance-lake --config stack.yaml plan
//!
//! # Apply the stack with AWS Cloud Control
//! compliance-lake --config stack.yaml apply
//!
//! # Dry run against the in-memory backend
//! compliance-lake --config stack.yaml --backend memory apply
//!
//! # Tear the stack down (retained resources stay)
//! compliance-lake --config stack.yaml destroy
//!
//! # Print the compiled trail table with its projection parameters
//! compliance-lake --config stack.yaml render-table
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use compliance_lake::config::LogFormat;
use compliance_lake::constants::DEFAULT_LOG_FILTER;
use compliance_lake::control_plane::CloudControlPlane;
use compliance_lake::engine::preview;
use compliance_lake::observability::metrics;
use compliance_lake::projection::{compile, layout::cloudtrail_table};
use compliance_lake::{
    build_stack, ControlPlane, DeploymentState, Environment, MemoryControlPlane, Provisioner,
    ProvisionerConfig, StackConfig,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Account used by the memory backend when none is configured
const PLACEHOLDER_ACCOUNT: &str = "000000000000";

/// Compliance data-lake provisioner
#[derive(Parser)]
#[command(name = "compliance-lake")]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), "-", env!("BUILD_GIT_HASH"), " (built ", env!("BUILD_DATETIME"), ")"))]
#[command(
    about = "Provision an encrypted, audited and governed data lake on AWS",
    long_about = None,
    after_help = "\
Examples:
  compliance-lake --config stack.yaml plan
  compliance-lake --config stack.yaml apply
  compliance-lake --config stack.yaml --backend memory apply
  compliance-lake --config stack.yaml render-table
"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Stack configuration (YAML)
    #[arg(short, long, global = true, default_value = "stack.yaml")]
    config: PathBuf,

    /// Control plane to apply against
    #[arg(short, long, global = true, value_enum, default_value_t = Backend::CloudControl)]
    backend: Backend,

    /// Deployment state file (overrides COMPLIANCE_LAKE_STATE_FILE)
    #[arg(short, long, global = true)]
    state: Option<PathBuf>,

    /// Target account (overrides the configuration and the caller identity)
    #[arg(long, global = true)]
    account: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compare the stack with deployment state without changing anything
    Plan,
    /// Create or update every resource of the stack
    Apply,
    /// Delete the stack's resources in reverse dependency order
    Destroy,
    /// Print the compiled trail table definition
    #[command(name = "render-table")]
    RenderTable,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// In-memory control plane; nothing leaves the process
    Memory,
    /// AWS Cloud Control API
    #[value(name = "cloud-control")]
    CloudControl,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = ProvisionerConfig::from_env().context("Invalid provisioner settings")?;
    init_tracing(&settings);

    if let Some(path) = &cli.state {
        settings.state_file.clone_from(path);
    }
    if settings.metrics_enabled {
        metrics::register_metrics().context("Failed to register metrics")?;
    }

    let config = StackConfig::load(&cli.config)?;
    let env = resolve_environment(&cli, &config).await?;
    info!(
        version = concat!(env!("CARGO_PKG_VERSION"), "-", env!("BUILD_GIT_HASH")),
        account = %env.account,
        region = %env.region,
        backend = cli.backend.as_str(),
        "Resolved target environment"
    );

    let result = match cli.command {
        Commands::Plan => plan_command(&config, env, &settings),
        Commands::Apply => apply_command(&cli, &config, env, &settings).await,
        Commands::Destroy => destroy_command(&cli, &config, env, &settings).await,
        Commands::RenderTable => render_table_command(&config, &env),
    };

    if settings.metrics_enabled {
        eprintln!("{}", metrics::render()?);
    }
    result
}

impl Backend {
    fn as_str(self) -> &'static str {
        match self {
            Backend::Memory => "memory",
            Backend::CloudControl => "cloud-control",
        }
    }
}

fn init_tracing(settings: &ProvisionerConfig) {
    let filter = tracing_subscriber::EnvFilter::try_new(&settings.log_filter)
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match settings.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Account and execution role from flags, configuration or the caller identity
async fn resolve_environment(cli: &Cli, config: &StackConfig) -> Result<Environment> {
    let mut config = config.clone();
    if let Some(account) = &cli.account {
        config.account = Some(account.clone());
    }
    if config.account.is_some() && (config.execution_role_arn.is_some() || cli.backend == Backend::Memory) {
        return config.environment(None);
    }
    if cli.backend == Backend::Memory {
        warn!(account = PLACEHOLDER_ACCOUNT, "No account configured, using placeholder");
        return config.environment(Some(PLACEHOLDER_ACCOUNT));
    }

    let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(config.region.clone()))
        .load()
        .await;
    let identity = aws_sdk_sts::Client::new(&sdk_config)
        .get_caller_identity()
        .send()
        .await
        .context("Failed to resolve caller identity. Ensure AWS credentials are configured.")?;

    if config.execution_role_arn.is_none() {
        config.execution_role_arn = identity.arn().and_then(execution_role_from_caller);
    }
    let account = identity
        .account()
        .ok_or_else(|| anyhow!("caller identity carried no account"))?;
    config.environment(Some(account))
}

/// IAM role ARN behind an assumed-role session ARN
fn execution_role_from_caller(arn: &str) -> Option<String> {
    let rest = arn.strip_prefix("arn:")?;
    let mut parts = rest.splitn(5, ':');
    let partition = parts.next()?;
    let service = parts.next()?;
    let _region = parts.next()?;
    let account = parts.next()?;
    let resource = parts.next()?;
    if service != "sts" {
        return None;
    }
    let role = resource.strip_prefix("assumed-role/")?.split('/').next()?;
    if role.is_empty() {
        return None;
    }
    Some(format!("arn:{partition}:iam::{account}:role/{role}"))
}

async fn control_plane(
    backend: Backend,
    env: &Environment,
    settings: &ProvisionerConfig,
) -> Arc<dyn ControlPlane> {
    match backend {
        Backend::Memory => Arc::new(MemoryControlPlane::new(env.clone())),
        Backend::CloudControl => Arc::new(CloudControlPlane::new(&env.region, settings).await),
    }
}

/// Deployment state; the memory backend always starts empty and is never persisted
fn load_state(backend: Backend, settings: &ProvisionerConfig) -> Result<DeploymentState> {
    match backend {
        Backend::Memory => Ok(DeploymentState::new()),
        Backend::CloudControl => DeploymentState::load(&settings.state_file),
    }
}

fn save_state(backend: Backend, settings: &ProvisionerConfig, state: &DeploymentState) -> Result<()> {
    if backend == Backend::Memory {
        return Ok(());
    }
    state
        .save(&settings.state_file)
        .with_context(|| format!("Failed to save state to {}", settings.state_file.display()))
}

fn plan_command(config: &StackConfig, env: Environment, settings: &ProvisionerConfig) -> Result<()> {
    let stack = build_stack(config, env)?;
    let state = DeploymentState::load(&settings.state_file)?;
    let changes = preview(&stack.graph, &state)?;
    println!("{}", serde_json::to_string_pretty(&changes)?);
    Ok(())
}

fn cancel_on_ctrl_c(provisioner: &Provisioner) {
    let cancel = provisioner.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping before the next wave");
            cancel.cancel();
        }
    });
}

async fn apply_command(
    cli: &Cli,
    config: &StackConfig,
    env: Environment,
    settings: &ProvisionerConfig,
) -> Result<()> {
    let control_plane = control_plane(cli.backend, &env, settings).await;
    let stack = build_stack(config, env)?;
    let mut state = load_state(cli.backend, settings)?;
    let provisioner = Provisioner::new(control_plane, settings.clone());
    cancel_on_ctrl_c(&provisioner);

    let result = provisioner.apply(&stack.graph, &mut state).await;
    save_state(cli.backend, settings, &state)?;
    let report = result.context("Apply failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn destroy_command(
    cli: &Cli,
    config: &StackConfig,
    env: Environment,
    settings: &ProvisionerConfig,
) -> Result<()> {
    let control_plane = control_plane(cli.backend, &env, settings).await;
    let stack = build_stack(config, env)?;
    let mut state = load_state(cli.backend, settings)?;
    let provisioner = Provisioner::new(control_plane, settings.clone());
    cancel_on_ctrl_c(&provisioner);

    let result = provisioner.destroy(&stack.graph, &mut state).await;
    save_state(cli.backend, settings, &state)?;
    let report = result.context("Destroy failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn render_table_command(config: &StackConfig, env: &Environment) -> Result<()> {
    let definition = cloudtrail_table(
        config.catalog.table_name.clone(),
        &env.account,
        config.projection.regions(),
        (config.projection.start_year, config.projection.end_year),
    );
    let table = compile(&definition)?;
    let bucket = format!("cloudtrail-bucket-{}", env.account);
    let rendered = json!({
        "name": table.name(),
        "database": config.catalog.database_name,
        "location": table.location(&bucket),
        "parameters": table.parameters(&bucket),
        "columns": table.columns(),
        "partitionKeys": table.partition_keys(),
    });
    println!("{}", serde_json::to_string_pretty(&rendered)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assumed_role_session_maps_to_role() {
        assert_eq!(
            execution_role_from_caller("arn:aws:sts::123456789012:assumed-role/cdk-exec/session-1"),
            Some("arn:aws:iam::123456789012:role/cdk-exec".to_string())
        );
        assert_eq!(
            execution_role_from_caller("arn:aws-cn:sts::123456789012:assumed-role/deployer/ci"),
            Some("arn:aws-cn:iam::123456789012:role/deployer".to_string())
        );
    }

    #[test]
    fn users_and_malformed_arns_have_no_role() {
        assert_eq!(execution_role_from_caller("arn:aws:iam::123456789012:user/rodrigo"), None);
        assert_eq!(execution_role_from_caller("arn:aws:sts::123456789012:federated-user/x"), None);
        assert_eq!(execution_role_from_caller("not-an-arn"), None);
    }

    #[test]
    fn cli_parses_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["compliance-lake", "apply", "--backend", "memory", "--config", "lake.yaml"]);
        assert!(matches!(cli.command, Commands::Apply));
        assert!(cli.backend == Backend::Memory);
        assert_eq!(cli.config, PathBuf::from("lake.yaml"));
    }
}
