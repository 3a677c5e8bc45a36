//! labrune - per-user lab containers
//!
//! This is the main CLI entry point for labrune.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use labrune::config::Settings;
use labrune::container::DockerRuntime;
use labrune::lab::LabManager;
use labrune::store::{InstanceStore, Lab, LabInstance, MemoryStore, NewLab, SqliteStore};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// labrune - per-user lab container manager
#[derive(Parser)]
#[command(name = "labrune")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Provision and reclaim per-user lab containers", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Settings file (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database file, overrides the settings file
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Keep records in memory for this invocation only
    #[arg(long, global = true, conflicts_with = "database")]
    memory: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema
    Init,

    /// Manage labs
    Lab {
        #[command(subcommand)]
        command: LabCommands,
    },

    /// Manage users
    User {
        #[command(subcommand)]
        command: UserCommands,
    },

    /// Get a user's instance of a lab, starting one if needed
    Acquire {
        /// Lab ID
        #[arg(long)]
        lab: i64,
        /// User ID
        #[arg(long)]
        user: i64,
    },

    /// Stop an instance
    Stop {
        /// Instance ID
        instance: i64,
    },

    /// Replace an instance with a fresh one
    Reset {
        /// Instance ID
        instance: i64,
    },

    /// Show instance logs
    Logs {
        /// Instance ID
        instance: i64,
        /// Number of lines to show
        #[arg(short = 'n', long)]
        tail: Option<usize>,
    },

    /// Show instance resource usage
    Stats {
        /// Instance ID
        instance: i64,
    },

    /// List active instances
    #[command(name = "ps")]
    Ps {
        /// Only instances of this user
        #[arg(short, long)]
        user: Option<i64>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Stop expired instances
    Sweep {
        /// Keep sweeping every N seconds
        #[arg(short, long)]
        interval: Option<u64>,
    },
}

#[derive(Subcommand)]
enum LabCommands {
    /// Add a lab
    Add {
        /// Lab name
        name: String,
        /// Flag injected into instances
        #[arg(long)]
        flag: String,
        /// Image to run
        #[arg(short, long)]
        image: Option<String>,
        /// Compose file describing the lab
        #[arg(long)]
        compose: Option<PathBuf>,
        /// Service port inside the container
        #[arg(short, long)]
        port: Option<u16>,
        /// Instances never expire
        #[arg(long)]
        no_time_limit: bool,
    },

    /// List labs
    #[command(name = "ls")]
    List,
}

#[derive(Subcommand)]
enum UserCommands {
    /// Add a user
    Add {
        /// Username
        username: String,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_labs(labs: &[Lab]) {
    println!(
        "{:<6} {:<24} {:<30} {:<8} {:<10}",
        "ID", "NAME", "IMAGE", "PORT", "EXPIRES"
    );
    for lab in labs {
        let image = match (&lab.docker_compose, &lab.docker_image) {
            (Some(_), _) => "(compose)".to_string(),
            (None, Some(image)) => image.clone(),
            (None, None) => "-".to_string(),
        };
        println!(
            "{:<6} {:<24} {:<30} {:<8} {:<10}",
            lab.id,
            lab.name,
            image,
            lab.target_port.map_or("-".to_string(), |p| p.to_string()),
            if lab.time_limit { "yes" } else { "no" }
        );
    }
}

fn print_instances(instances: &[LabInstance]) {
    println!(
        "{:<6} {:<6} {:<6} {:<14} {:<26} {:<16} {:<7} {:<20}",
        "ID", "LAB", "USER", "CONTAINER ID", "NAME", "ADDRESS", "PORT", "EXPIRES"
    );
    for i in instances {
        let container = i
            .container_id
            .as_deref()
            .map_or("-", |id| id.get(..12).unwrap_or(id));
        println!(
            "{:<6} {:<6} {:<6} {:<14} {:<26} {:<16} {:<7} {:<20}",
            i.id,
            i.lab_id,
            i.user_id,
            container,
            i.container_name.as_deref().unwrap_or("-"),
            i.container_ip.as_deref().unwrap_or("-"),
            i.container_port.map_or("-".to_string(), |p| p.to_string()),
            i.expires_at
                .map_or("never".to_string(), |e| e.format("%Y-%m-%d %H:%M:%S").to_string())
        );
    }
}

fn open_store(cli: &Cli, settings: &Settings) -> Result<Arc<dyn InstanceStore>> {
    if cli.memory {
        return Ok(Arc::new(MemoryStore::new()));
    }

    let path = cli
        .database
        .clone()
        .unwrap_or_else(|| settings.database_path());
    let store = SqliteStore::open(&path)
        .with_context(|| format!("Failed to open database {}", path.display()))?;
    Ok(Arc::new(store))
}

async fn connect_manager(settings: &Settings, store: Arc<dyn InstanceStore>) -> LabManager {
    let runtime = DockerRuntime::connect(settings.runtime.clone()).await;
    LabManager::new(Arc::new(runtime), store, settings.lab.clone())
}

async fn sweep_forever(manager: &LabManager, interval: u64) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));
    info!("Sweeping expired instances every {}s", interval.max(1));

    loop {
        tokio::select! {
            _ = ticker.tick() => match manager.sweep_expired().await {
                Ok(report) if report.stopped.is_empty() && report.failed.is_empty() => {}
                Ok(report) => info!(
                    "Sweep stopped {} instances, {} failed",
                    report.stopped.len(),
                    report.failed.len()
                ),
                Err(e) => error!("Sweep failed: {}", e),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping sweeper");
                break;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = match &cli.config {
        Some(path) => Settings::load(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => Settings::default(),
    };

    let store = open_store(&cli, &settings)?;

    match cli.command {
        Commands::Init => {
            println!("Instance store ready ({} active instances)", store.active_count()?);
        }

        Commands::Lab { command } => match command {
            LabCommands::Add {
                name,
                flag,
                image,
                compose,
                port,
                no_time_limit,
            } => {
                let mut lab = NewLab::new(&name, &flag).time_limit(!no_time_limit);
                if let Some(image) = image {
                    lab = lab.image(&image);
                }
                if let Some(path) = compose {
                    let definition = std::fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read {}", path.display()))?;
                    lab = lab.compose(&definition);
                }
                if let Some(port) = port {
                    lab = lab.target_port(port);
                }
                print_json(&store.insert_lab(lab)?)?;
            }
            LabCommands::List => print_labs(&store.labs()?),
        },

        Commands::User { command } => match command {
            UserCommands::Add { username } => print_json(&store.insert_user(&username)?)?,
        },

        Commands::Ps { user, json } => {
            let instances = match user {
                Some(user_id) => store.user_active_instances(user_id)?,
                None => store.active_instances()?,
            };
            if json {
                print_json(&instances)?;
            } else {
                print_instances(&instances);
            }
        }

        Commands::Acquire { lab, user } => {
            let manager = connect_manager(&settings, store).await;
            print_json(&manager.acquire(lab, user).await?)?;
        }

        Commands::Stop { instance } => {
            let manager = connect_manager(&settings, store).await;
            print_json(&manager.stop(instance).await?)?;
        }

        Commands::Reset { instance } => {
            let manager = connect_manager(&settings, store).await;
            print_json(&manager.reset(instance).await?)?;
        }

        Commands::Logs { instance, tail } => {
            let manager = connect_manager(&settings, store).await;
            println!("{}", manager.logs(instance, tail).await?);
        }

        Commands::Stats { instance } => {
            let manager = connect_manager(&settings, store).await;
            match manager.stats(instance).await? {
                Some(stats) => print_json(&stats)?,
                None => println!("Stats not available"),
            }
        }

        Commands::Sweep { interval } => {
            let manager = connect_manager(&settings, store).await;
            match interval {
                Some(secs) => sweep_forever(&manager, secs).await,
                None => print_json(&manager.sweep_expired().await?)?,
            }
        }
    }

    Ok(())
}
