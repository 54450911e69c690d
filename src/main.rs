use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use grove::discovery::{self, tasks, ActivityDetector};
use grove::health::HealthMonitor;
use grove::{Config, Registry, Workspace};

#[derive(Parser)]
#[command(name = "grove")]
#[command(version)]
#[command(about = "Track dev servers across git worktrees")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file to use instead of the default
    #[arg(long, global = true, env = "GROVE_CONFIG")]
    config: Option<PathBuf>,

    /// Registry file to use instead of the configured one
    #[arg(long, global = true, env = "GROVE_REGISTRY")]
    registry: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered workspaces
    List {
        /// Only show workspaces with an active server
        #[arg(short, long)]
        running: bool,
    },
    /// Discover worktrees and register them
    Discover {
        /// Repository, or directory to scan with --recursive
        #[arg(default_value = ".")]
        path: PathBuf,
        /// Walk the directory tree for repositories
        #[arg(short, long)]
        recursive: bool,
        /// Maximum directory depth for --recursive
        #[arg(long)]
        depth: Option<usize>,
    },
    /// Drop workspaces whose path is gone and mark dead servers stopped
    Cleanup,
    /// Refresh git, agent and editor activity for every workspace
    Activity,
    /// Show the port assigned to a name
    Port {
        name: String,
        /// Skip ports that are registered or already bound
        #[arg(short, long)]
        fallback: bool,
    },
    /// Probe running servers
    Health {
        /// Keep probing on the configured interval
        #[arg(short, long)]
        watch: bool,
    },
    /// Show or update the in-progress task of a worktree
    Task {
        #[arg(default_value = ".")]
        path: PathBuf,
        /// Set the status of a task: --set ID STATUS
        #[arg(long, num_args = 2, value_names = ["ID", "STATUS"])]
        set: Option<Vec<String>>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    let registry_path = match cli.registry {
        Some(path) => path,
        None => config.registry_path()?,
    };

    match cli.command {
        Commands::List { running } => {
            let registry = Registry::load_from(&registry_path)?;
            let workspaces = if running {
                registry.list_running()
            } else {
                registry.list()
            };
            print_workspaces(&workspaces);
        }
        Commands::Discover {
            path,
            recursive,
            depth,
        } => {
            let timeout = config.command_timeout();
            let worktrees = if recursive {
                let depth = depth.unwrap_or(config.discovery.max_depth);
                discovery::find_all(&path, Some(depth), timeout).await?
            } else {
                discovery::discover(&path, timeout).await?
            };

            let registry = Registry::load_from(&registry_path)?;
            registry.merge_worktrees(&worktrees)?;
            for wt in &worktrees {
                println!("{:<30} {:<30} {}", wt.name, wt.branch, wt.path.display());
            }
            println!("{} worktree(s) registered", worktrees.len());
        }
        Commands::Cleanup => {
            let registry = Registry::load_from(&registry_path)?;
            let report = registry.cleanup()?;
            if report.is_empty() {
                println!("Nothing to clean up");
            }
            for name in &report.stopped {
                println!("stopped  {}", name);
            }
            for name in &report.removed {
                println!("removed  {}", name);
            }
        }
        Commands::Activity => {
            let registry = Registry::load_from(&registry_path)?;
            let detector = ActivityDetector::new(config.command_timeout())?;
            registry.update_activities(&detector).await?;
            for ws in registry.list() {
                let agent = ws
                    .agent
                    .as_ref()
                    .map(|a| format!("{} ({})", a.agent_type, a.pid))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<30} dirty={:<5} editor={:<5} agent={}",
                    ws.name, ws.git_dirty, ws.has_editor, agent
                );
            }
        }
        Commands::Port { name, fallback } => {
            let name = discovery::sanitize_name(&name);
            if name.is_empty() {
                bail!("name must contain at least one of [a-z0-9-]");
            }
            let allocator = config.allocator()?;
            let port = if fallback {
                let registry = Registry::load_from(&registry_path)?;
                allocator.allocate_with_fallback(&name, &registry.used_ports())?
            } else {
                allocator.allocate(&name)
            };
            println!("{} {}", port, config.server_url(&name, port));
        }
        Commands::Health { watch } => {
            let registry = Arc::new(Registry::load_from(&registry_path)?);
            let mut monitor = HealthMonitor::new(
                registry,
                config.health_interval(),
                config.health_timeout(),
            )?;

            if !watch {
                for report in monitor.check_once().await {
                    println!("{} {:<30} {}", report.health.symbol(), report.name, report.health);
                }
                return Ok(());
            }

            let mut reports = monitor.subscribe();
            let handle = monitor.start();
            loop {
                tokio::select! {
                    Some(report) = reports.recv() => {
                        println!(
                            "{} {} {:<30} {}",
                            report.checked_at.format("%H:%M:%S"),
                            report.health.symbol(),
                            report.name,
                            report.health
                        );
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            handle.abort();
        }
        Commands::Task { path, set } => {
            run_task_command(&path, set)?;
        }
    }

    Ok(())
}

fn run_task_command(path: &Path, set: Option<Vec<String>>) -> Result<()> {
    let task_dir = tasks::find_task_dir(path)
        .with_context(|| format!("No task store found above {}", path.display()))?;

    if let Some(args) = set {
        let [id, status] = args.as_slice() else {
            bail!("--set takes a task id and a status");
        };
        let task = tasks::update_task_status(&task_dir, id, status)?;
        println!("{} -> {}", task.id, task.status);
        return Ok(());
    }

    match tasks::active_task(path) {
        Some(task) => println!("{}  {}", task.id, task.description),
        None => println!("No task in progress"),
    }
    Ok(())
}

fn print_workspaces(workspaces: &[Workspace]) {
    if workspaces.is_empty() {
        println!("No workspaces registered");
        return;
    }

    println!(
        "{:<30} {:<10} {:<6} {:<10} {:<8} {}",
        "NAME", "STATUS", "PORT", "HEALTH", "UPTIME", "PATH"
    );
    for ws in workspaces {
        let (status, port, health) = match &ws.server {
            Some(server) => (
                server.status.to_string(),
                server.port.to_string(),
                server.health.to_string(),
            ),
            None => ("-".to_string(), "-".to_string(), "-".to_string()),
        };
        println!(
            "{:<30} {:<10} {:<6} {:<10} {:<8} {}",
            ws.name,
            status,
            port,
            health,
            ws.uptime_display(),
            ws.display_path()
        );
    }
}
