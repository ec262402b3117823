use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use resfilter::config::EngineConfig;
use resfilter::context::{describe_timeout, RunContext};
use resfilter::filters::FilterRegistry;
use resfilter::provider::{FixtureProvider, GcpProvider, ProviderClient};
use resfilter::resource::Registry;
use resfilter::{PolicyReport, PolicyRunner, VERSION};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriterExt;

/// Filter cloud resources with declarative policies and act on the matches
#[derive(Parser, Debug)]
#[command(name = "resfilter", version = VERSION, about, long_about = None)]
struct Args {
    /// GCP project to use
    #[arg(short, long, global = true)]
    project: Option<String>,

    /// GCP zone to use ("all" for every zone)
    #[arg(short, long, global = true)]
    zone: Option<String>,

    /// Extra resource definition file, merged over the built-in ones
    #[arg(long, global = true)]
    resources_file: Vec<PathBuf>,

    /// Log level for debugging
    #[arg(long, value_enum, default_value = "off", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every policy in a file
    Run {
        /// Policy YAML file
        #[arg(long)]
        policy: PathBuf,

        /// Serve provider calls from a fixture JSON file instead of GCP
        #[arg(long)]
        fixtures: Option<PathBuf>,

        /// Fetch and filter, but do not run actions
        #[arg(long)]
        dry_run: bool,

        /// Include matched resources in the output
        #[arg(long)]
        show_resources: bool,
    },
    /// Validate a policy file without fetching anything
    Validate {
        #[arg(long)]
        policy: PathBuf,
    },
    /// List resource types with their filters and actions
    Resources,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Option<Level> {
        match self {
            LogLevel::Off => None,
            LogLevel::Error => Some(Level::ERROR),
            LogLevel::Warn => Some(Level::WARN),
            LogLevel::Info => Some(Level::INFO),
            LogLevel::Debug => Some(Level::DEBUG),
            LogLevel::Trace => Some(Level::TRACE),
        }
    }
}

fn setup_logging(level: LogLevel) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let Some(tracing_level) = level.to_tracing_level() else {
        return Ok(None);
    };

    let log_path = get_log_path();

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file {:?}", log_path))?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    tracing_subscriber::fmt()
        .with_max_level(tracing_level)
        .with_writer(non_blocking.with_max_level(tracing_level))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("resfilter {} started with log level: {:?}", VERSION, level);
    tracing::info!("Log file: {:?}", log_path);

    Ok(Some(guard))
}

fn get_log_path() -> PathBuf {
    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("resfilter").join("resfilter.log");
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".resfilter").join("resfilter.log");
    }
    PathBuf::from("resfilter.log")
}

/// Built-in definitions plus any files from config or CLI
fn load_registry(config: &EngineConfig, extra: &[PathBuf]) -> Result<Registry> {
    let mut registry = Registry::builtin()?;
    for path in config.resource_files.iter().chain(extra) {
        registry.merge_file(path)?;
    }
    Ok(registry)
}

async fn build_provider(config: &EngineConfig, fixtures: Option<&Path>) -> Result<Arc<dyn ProviderClient>> {
    if let Some(path) = fixtures {
        tracing::info!("Using fixtures from {:?}", path);
        return Ok(Arc::new(FixtureProvider::from_file(path)?));
    }

    let project = config.effective_project();
    if project.is_empty() {
        anyhow::bail!("No GCP project configured. Pass --project or run 'gcloud config set project'");
    }
    let zone = config.effective_zone();
    tracing::info!("Using GCP project {} in {}", project, zone);
    Ok(Arc::new(GcpProvider::new(&project, &zone).await?))
}

fn print_reports(reports: &[PolicyReport], show_resources: bool) -> Result<()> {
    let mut reports = reports.to_vec();
    if !show_resources {
        for report in &mut reports {
            report.resources.clear();
        }
    }
    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let _log_guard = setup_logging(args.log_level)?;

    let mut config = EngineConfig::load();
    let remember = args.project.is_some() || args.zone.is_some();
    if let Some(project) = &args.project {
        config.project_id = Some(project.clone());
    }
    if let Some(zone) = &args.zone {
        config.zone = Some(zone.clone());
    }

    let registry = Arc::new(load_registry(&config, &args.resources_file)?);
    let runner = PolicyRunner::new(registry.clone(), FilterRegistry::builtin());

    match args.command {
        Command::Validate { policy } => {
            let policies = runner.load_file(&policy)?;
            for p in &policies {
                println!(
                    "{}: {} (filters: [{}], actions: [{}])",
                    p.name(),
                    p.resource_type(),
                    p.filter_kinds().join(", "),
                    p.action_names().join(", ")
                );
            }
            println!("{} policies valid", policies.len());
        },
        Command::Resources => {
            let filters = FilterRegistry::builtin();
            for key in registry.keys() {
                let Some(def) = registry.get(key) else {
                    continue;
                };
                let actions: Vec<&str> = def.actions.iter().map(|a| a.key.as_str()).collect();
                println!("{} ({}, service {})", key, def.display_name, def.service);
                println!("  actions: {}", actions.join(", "));
            }
            println!("filters: {}", filters.types().join(", "));
        },
        Command::Run {
            policy,
            fixtures,
            dry_run,
            show_resources,
        } => {
            // Validate everything before touching the provider
            let policies = runner.load_file(&policy)?;
            let provider = build_provider(&config, fixtures.as_deref()).await?;

            let cancel = CancellationToken::new();
            let ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupted, cancelling run");
                    ctrl_c.cancel();
                }
            });

            tracing::info!(
                "Running {} policies (dry_run={}, call timeout {})",
                policies.len(),
                dry_run,
                describe_timeout(config.call_timeout())
            );
            let run = RunContext::new(provider, config.clone()).with_cancellation(cancel);
            let reports = runner.run_all(&run, &policies, dry_run).await?;
            print_reports(&reports, show_resources)?;

            if remember && fixtures.is_none() {
                if let Err(e) = config.save() {
                    tracing::warn!("Failed to save config: {}", e);
                }
            }
        },
    }

    Ok(())
}
