//! claw-watch - Clawbernetes pod fleet watcher
//!
//! Polls the fleet, detects and classifies changes, and sends batched
//! notifications.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use claw_watch::{
    BatchScheduler, Destination, Dispatcher, FileSource, KubectlSource, LogDispatcher,
    LogTransport, MailDispatcher, Monitor, ObservationSource, SchedulerHandle, ShutdownRx,
    ShutdownTx, WatchConfig,
};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "claw-watch")]
#[command(about = "Clawbernetes pod fleet watcher")]
#[command(version)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true, env = "CLAW_WATCH_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the watcher until interrupted
    Run {
        /// Path to config file (defaults are used when absent)
        #[arg(short, long, env = "CLAW_WATCH_CONFIG")]
        config: Option<PathBuf>,

        /// Read pods from a JSON file instead of kubectl
        #[arg(long)]
        pods_file: Option<PathBuf>,

        /// Only watch one namespace
        #[arg(short, long)]
        namespace: Option<String>,

        /// kubeconfig context to use
        #[arg(long)]
        context: Option<String>,
    },

    /// Validate a config file and print the effective settings
    CheckConfig {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/claw-watch/config.json")]
        config: PathBuf,
    },

    /// Write a config file with every default filled in
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "/etc/claw-watch/config.json")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json)?;

    match cli.command {
        Commands::Run {
            config,
            pods_file,
            namespace,
            context,
        } => {
            run_watch(config, pods_file, namespace, context).await?;
        }

        Commands::CheckConfig { config } => {
            check_config(&config)?;
        }

        Commands::InitConfig { output, force } => {
            init_config(&output, force)?;
        }
    }

    Ok(())
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("claw_watch=info".parse()?);
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
    Ok(())
}

async fn run_watch(
    config_path: Option<PathBuf>,
    pods_file: Option<PathBuf>,
    namespace: Option<String>,
    context: Option<String>,
) -> anyhow::Result<()> {
    let config = match &config_path {
        Some(path) => {
            info!(config = %path.display(), "loading config");
            WatchConfig::from_file(path)?
        }
        None => {
            info!("no config file given, using defaults");
            WatchConfig::default()
        }
    };

    let dispatcher = build_dispatcher(&config);
    info!(dispatcher = %dispatcher.name(), routes = config.routes.len(), "starting claw-watch");
    let (scheduler, scheduler_task) = BatchScheduler::spawn(config.scheduler_config(), dispatcher);

    let (shutdown_tx, shutdown_rx): (ShutdownTx, ShutdownRx) = tokio::sync::broadcast::channel(1);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received Ctrl-C, shutting down"),
            Err(e) => warn!(error = %e, "failed to listen for Ctrl-C, shutting down"),
        }
        let _ = shutdown_tx.send(());
    });

    if let Some(path) = pods_file {
        run_with(config, FileSource::new(path), scheduler, shutdown_rx).await?;
    } else {
        let mut source = KubectlSource::new();
        if let Some(namespace) = namespace {
            source = source.with_namespace(namespace);
        }
        if let Some(context) = context {
            source = source.with_context(context);
        }
        run_with(config, source, scheduler, shutdown_rx).await?;
    }

    let stats = scheduler_task.await?;
    info!(
        batches = stats.batches_dispatched,
        events = stats.events_dispatched,
        failures = stats.dispatch_failures,
        "claw-watch stopped"
    );
    Ok(())
}

async fn run_with<S: ObservationSource>(
    config: WatchConfig,
    source: S,
    scheduler: SchedulerHandle,
    shutdown: ShutdownRx,
) -> anyhow::Result<()> {
    Monitor::new(config, source, scheduler).run(shutdown).await?;
    Ok(())
}

fn build_dispatcher(config: &WatchConfig) -> Arc<dyn Dispatcher> {
    match &config.mail {
        Some(mail) => {
            let dispatcher = mail.recipients.iter().fold(
                MailDispatcher::new("mail", mail.from.clone(), LogTransport),
                |dispatcher, (destination, to)| {
                    dispatcher.with_recipients(Destination::new(destination.clone()), to.clone())
                },
            );
            Arc::new(dispatcher)
        }
        None => Arc::new(LogDispatcher::default()),
    }
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = WatchConfig::from_file(path)?;

    println!("Config OK: {}", path.display());
    println!();
    println!("  Poll interval:      {}s", config.poll_interval_secs);
    println!("  Observe timeout:    {}s", config.observe_timeout_secs);
    println!("  Mass threshold:     {}", config.mass_threshold);
    println!("  Restart cooldown:   {}s", config.restart_cooldown_secs);
    println!(
        "  Batch windows:      warning {}s, info {}s (cap {}s, {:?})",
        config.batch_window_secs.warning,
        config.batch_window_secs.info,
        config.max_batch_lifetime_secs,
        config.window_policy
    );
    match &config.state_dir {
        Some(dir) => println!("  State dir:          {}", dir.display()),
        None => println!("  State dir:          (in memory)"),
    }
    println!("  Routes:");
    for route in &config.routes {
        println!("    {} (>= {})", route.destination, route.min_priority);
    }
    if !config.excluded_namespaces.is_empty() {
        println!("  Excluded namespaces: {}", config.excluded_namespaces.join(", "));
    }
    if !config.excluded_owners.is_empty() {
        println!("  Excluded owners:    {}", config.excluded_owners.join(", "));
    }

    Ok(())
}

fn init_config(output: &Path, force: bool) -> anyhow::Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{} already exists, pass --force to overwrite", output.display());
    }

    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let config = WatchConfig {
        state_dir: Some(PathBuf::from("/var/lib/claw-watch")),
        ..WatchConfig::default()
    };
    std::fs::write(output, config.to_json_pretty()?)?;

    println!("Wrote config to {}", output.display());
    Ok(())
}
