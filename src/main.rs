//! Keet worklet CLI.
//!
//! `worklet` runs the backend worklet on stdin/stdout (the host spawns this).
//! `host` starts a worklet as a child process and talks to it.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use keet_worklet::host::{self, Supervisor, SupervisorOptions, Worklet, WorkletClient, WorkletCommand};
use keet_worklet::{env::Environment, worklet, Config, StartupArgs};
use mimalloc::MiMalloc;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "keet-worklet")]
#[command(version, about = "Keet worklet bootstrap and RPC bridge")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the backend worklet over stdin/stdout
    Worklet {
        /// Storage directory (a `file://` prefix is stripped)
        storage: String,
        /// Mode; `experimental` enables the experimental backend
        mode: Option<String>,
    },
    /// Start a worklet and query it
    Host {
        /// Storage directory override
        #[arg(long)]
        storage: Option<String>,
        /// Mode override
        #[arg(long)]
        mode: Option<String>,
        #[command(subcommand)]
        command: HostCommand,
    },
    /// Print the effective configuration
    Config {
        /// Write the effective configuration to disk
        #[arg(long)]
        save: bool,
    },
}

#[derive(Subcommand)]
enum HostCommand {
    /// Print the backend's public key
    Identity,
    /// Stream network status until interrupted
    Network,
    /// Control the remote inspector
    Inspector {
        #[command(subcommand)]
        action: InspectorAction,
    },
    /// Stream worklet crash reports until interrupted
    Crashes,
}

#[derive(Subcommand, Clone, Copy)]
enum InspectorAction {
    /// Start the inspector and print its key
    Enable,
    /// Stop the inspector
    Disable,
    /// Print the inspector key, if running
    Key,
}

fn init_logging(file_name: &str) -> Result<()> {
    // stdout is the IPC pipe in worklet mode, so logs always go to a file.
    let log_path = if let Ok(path) = std::env::var("KEET_WORKLET_LOG_FILE") {
        std::path::PathBuf::from(path)
    } else {
        Config::config_dir()?.join(file_name)
    };
    let log_file = std::fs::File::create(&log_path)
        .with_context(|| format!("Failed to create log file at {}", log_path.display()))?;
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(Environment::current().default_log_filter()),
    )
    .target(env_logger::Target::Pipe(Box::new(log_file)))
    .format_timestamp_secs()
    .init();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_file = match cli.command {
        Commands::Worklet { .. } => "worklet.log",
        _ => "keet-worklet.log",
    };
    init_logging(log_file)?;

    // Set up panic hook to log panics
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        log::error!("PANIC: {:?}", panic_info);
        default_hook(panic_info);
    }));

    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
    let config = Config::load()?;

    match cli.command {
        Commands::Worklet { storage, mode } => {
            let mut argv = vec![storage];
            argv.extend(mode);
            let args = StartupArgs::from_argv(argv)?;
            runtime.block_on(worklet::run(args, &config))?;
        }
        Commands::Host {
            storage,
            mode,
            command,
        } => {
            let mut args = config.startup_args();
            if let Some(storage) = storage {
                args.storage_path = keet_worklet::startup::normalize_storage_path(&storage);
            }
            if let Some(mode) = mode {
                args.mode = mode;
            }
            runtime.block_on(run_host(&config, args, command))?;
        }
        Commands::Config { save } => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            if save {
                config.save()?;
                println!("Saved to {}", Config::config_dir()?.display());
            }
        }
    }

    Ok(())
}

async fn run_host(config: &Config, args: StartupArgs, command: HostCommand) -> Result<()> {
    let launch = WorkletCommand::current_exe()?;

    match command {
        HostCommand::Identity => {
            let worklet = Worklet::start(&launch, &args, config.request_timeout())?;
            let result = worklet.client().identity().await;
            worklet.shutdown().await?;
            println!("{}", result?);
        }
        HostCommand::Inspector { action } => {
            let worklet = Worklet::start(&launch, &args, config.request_timeout())?;
            let result = inspector(worklet.client(), action).await;
            worklet.shutdown().await?;
            result?;
        }
        HostCommand::Network => {
            watch(config, launch, args, |client| async move {
                let mut statuses = client.network_status()?;
                while let Some(status) = statuses.recv().await {
                    let status = status?;
                    println!(
                        "{}:{} online={} peers={} dht={}",
                        status.host, status.port, status.online, status.peer_count, status.dht_version
                    );
                }
                anyhow::Ok(())
            })
            .await?;
        }
        HostCommand::Crashes => {
            watch(config, launch, args, |client| async move {
                let mut reports = client.crash_reports()?;
                while let Some(report) = reports.recv().await {
                    let report = report?;
                    println!("{}\n{}", report.message, report.stack);
                }
                anyhow::Ok(())
            })
            .await?;
        }
    }

    Ok(())
}

async fn inspector(client: &WorkletClient, action: InspectorAction) -> Result<()> {
    match action {
        InspectorAction::Enable => println!("{}", client.inspector_enable().await?),
        InspectorAction::Disable => client.inspector_disable().await?,
        InspectorAction::Key => match client.inspector_key().await? {
            Some(key) => println!("{key}"),
            None => println!("Inspector disabled"),
        },
    }
    Ok(())
}

/// Run a supervised worklet and re-attach `follow` to each published client
/// until Ctrl-C.
async fn watch<F, Fut>(config: &Config, launch: WorkletCommand, args: StartupArgs, follow: F) -> Result<()>
where
    F: Fn(WorkletClient) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let supervisor = Supervisor::new(
        launch,
        args,
        SupervisorOptions {
            max_restarts: config.max_restarts,
            restart_delay: config.restart_delay(),
            request_timeout: config.request_timeout(),
        },
    );
    let shutdown = supervisor.shutdown_token();
    let mut supervised = tokio::spawn(supervisor.run());

    let follow_all = async {
        loop {
            let Some(client) = host::client() else {
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            };
            if let Err(e) = follow(client.clone()).await {
                log::warn!("[Host] Stream ended: {e}");
            }
            // Wait for the supervisor to withdraw this client.
            client.closed().await;
            while host::client().is_some_and(|c| c.is_closed()) {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    };

    let interrupted = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            true
        }
        result = &mut supervised => {
            result??;
            false
        }
        _ = follow_all => false,
    };
    if interrupted {
        shutdown.cancel();
        supervised.await??;
    }
    Ok(())
}
