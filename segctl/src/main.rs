mod batch;

use anyhow::{Context, Result};
use capsules_container_exec::RuntimeProbe;
use capsules_segmentation::{CaseId, Pipeline, PipelineConfig, RequestWorkspace, SourcePaths};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "segctl", version, about = "Prostate MRI segmentation runner")]
struct Cli {
    /// Pipeline config YAML; environment overrides are applied on top
    #[arg(long, global = true, env = "SEGMENTATION_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the container runtime answers
    Probe {
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Segment one case and print the result bundle as JSON
    Run {
        #[arg(long, value_name = "FILE")]
        t2w: PathBuf,
        #[arg(long, value_name = "FILE")]
        adc: PathBuf,
        #[arg(long, value_name = "FILE")]
        hbv: PathBuf,
        /// Defaults to a generated `case_<hex>` identifier
        #[arg(long)]
        case_id: Option<String>,
        /// Directory to stage into; a temporary one is used when omitted
        #[arg(long, value_name = "DIR")]
        workspace: Option<PathBuf>,
        /// Keep the temporary workspace after the run
        #[arg(long)]
        keep_workspace: bool,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Segment every case listed in a YAML manifest
    Batch {
        #[arg(long, value_name = "FILE")]
        manifest: PathBuf,
        #[arg(long, default_value_t = 2)]
        concurrency: usize,
        /// Per-case workspaces are created under this directory
        #[arg(long, value_name = "DIR")]
        workspace_root: Option<PathBuf>,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Print the effective configuration as YAML
    Config {
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Print version and exit
    Version,
}

#[derive(Args, Debug, Default)]
struct Overrides {
    /// Model image reference
    #[arg(long)]
    image: Option<String>,
    /// Container runtime binary
    #[arg(long)]
    runtime: Option<String>,
    /// Wall-clock bound on the container, e.g. `300s` or `10m`
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,
}

fn init_tracing() {
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(path: Option<&Path>, overrides: &Overrides) -> Result<PipelineConfig> {
    let mut config = match path {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => PipelineConfig::from_env().context("Invalid segmentation environment")?,
    };
    if let Some(image) = &overrides.image {
        config.image = image.clone();
    }
    if let Some(runtime) = &overrides.runtime {
        config.runtime = runtime.clone();
    }
    if let Some(timeout) = overrides.timeout {
        config.timeout = timeout;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    let ok = match cli.cmd {
        Commands::Probe { overrides } => {
            let config = load_config(config_path, &overrides)?;
            probe(&config)
        }
        Commands::Run {
            t2w,
            adc,
            hbv,
            case_id,
            workspace,
            keep_workspace,
            overrides,
        } => {
            let config = load_config(config_path, &overrides)?;
            let request = RunRequest {
                sources: SourcePaths::new(t2w, adc, hbv),
                case_id,
                workspace,
                keep_workspace,
            };
            let pipeline = Pipeline::new(config);
            tokio::task::spawn_blocking(move || run_case(&pipeline, request))
                .await
                .context("Segmentation worker panicked")??
        }
        Commands::Batch {
            manifest,
            concurrency,
            workspace_root,
            overrides,
        } => {
            let config = load_config(config_path, &overrides)?;
            let cases = batch::load_manifest(&manifest)?;
            let entries = batch::run_batch(
                Arc::new(Pipeline::new(config)),
                cases,
                concurrency,
                workspace_root,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
            entries.iter().all(batch::BatchEntry::is_success)
        }
        Commands::Config { overrides } => {
            let config = load_config(config_path, &overrides)?;
            print!("{}", serde_yaml::to_string(&config)?);
            true
        }
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            true
        }
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

fn probe(config: &PipelineConfig) -> bool {
    let probe = RuntimeProbe::new(config.runtime.clone()).with_timeout(config.probe_timeout);
    let version = probe.runtime_version();
    let available = version.is_some();
    let report = serde_json::json!({
        "runtime": config.runtime,
        "available": available,
        "version": version,
    });
    println!("{}", report);
    available
}

struct RunRequest {
    sources: SourcePaths,
    case_id: Option<String>,
    workspace: Option<PathBuf>,
    keep_workspace: bool,
}

/// Prints either the result bundle or the error report; returns whether the
/// case succeeded. The workspace is released before returning.
fn run_case(pipeline: &Pipeline, request: RunRequest) -> Result<bool> {
    let workspace = match &request.workspace {
        Some(dir) => RequestWorkspace::claim(dir),
        None => RequestWorkspace::temporary(),
    };
    let case_id = match &request.case_id {
        Some(raw) => CaseId::parse(raw),
        None => Ok(CaseId::generate()),
    };

    let (workspace, outcome) = match (workspace, case_id) {
        (Ok(workspace), Ok(case_id)) => {
            let outcome = pipeline.run(&case_id, &request.sources, &workspace);
            (Some(workspace), outcome)
        }
        (Err(err), _) | (_, Err(err)) => (None, Err(err)),
    };

    let ok = match &outcome {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(result)?);
            true
        }
        Err(err) => {
            println!("{}", serde_json::to_string_pretty(&err.to_report())?);
            false
        }
    };

    if let Some(workspace) = workspace {
        if request.keep_workspace && request.workspace.is_none() {
            let root = workspace.persist();
            info!(workspace = %root.display(), "kept temporary workspace");
        }
    }
    Ok(ok)
}
