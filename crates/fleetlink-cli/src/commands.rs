use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use serde_json::json;
use tracing::info;

use crate::logging::{self, LogFormat};

use fleetlink_agent::agent::Agent;
use fleetlink_agent::loopback::{LoopbackConnector, ScriptedCoordinator};
use fleetlink_core::config::AgentConfig;
use fleetlink_core::stop::StopToken;
use fleetlink_core::time::utc_now;

#[derive(Parser)]
#[command(
    name = "fleetlink",
    version,
    about = "Node-side registration and heartbeat agent for fleet coordinators"
)]
pub struct Cli {
    /// Log format: human or json
    #[arg(long, global = true, value_enum, default_value = "human")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent against an in-process coordinator and report the outcome
    Simulate {
        /// Agent config file (defaults apply when omitted)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
        /// Stop after this many answered heartbeats
        #[arg(long, default_value = "5")]
        heartbeats: u64,
        /// Pause between heartbeats in milliseconds (overrides the config)
        #[arg(long)]
        interval_ms: Option<u64>,
        /// Sequence id the coordinator assigns at registration
        #[arg(long, default_value = "0")]
        initial_id: i64,
        /// Skip one id in the Nth heartbeat reply
        #[arg(long, value_name = "N")]
        desync_at: Option<u64>,
        /// Set restartAgent on the Nth heartbeat reply
        #[arg(long, value_name = "N")]
        restart_at: Option<u64>,
        /// Reject the first registration with this log message
        #[arg(long, value_name = "LOG")]
        reject: Option<String>,
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect agent configuration
    Config {
        #[command(subcommand)]
        action: ConfigCmd,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ConfigCmd {
    /// Print the effective config (file plus environment overrides)
    Show {
        #[arg(long, short = 'c')]
        config: PathBuf,
        /// Print as JSON instead of TOML
        #[arg(long)]
        json: bool,
    },
    /// Check that a config file parses and passes validation
    Validate {
        #[arg(long, short = 'c')]
        config: PathBuf,
    },
}

/// Parse arguments, run the selected command and return the process exit code.
pub fn run() -> Result<i32> {
    let cli = Cli::parse();
    logging::init(cli.log_format);

    match cli.command {
        Commands::Simulate {
            config,
            heartbeats,
            interval_ms,
            initial_id,
            desync_at,
            restart_at,
            reject,
            json,
        } => cmd_simulate(SimulateOptions {
            config,
            heartbeats,
            interval: interval_ms.map(Duration::from_millis),
            initial_id,
            desync_at,
            restart_at,
            reject,
            json,
        }),
        Commands::Config { action } => match action {
            ConfigCmd::Show { config, json } => cmd_config_show(&config, json).map(|_| 0),
            ConfigCmd::Validate { config } => cmd_config_validate(&config).map(|_| 0),
        },
        Commands::Completions { shell } => cmd_completions(shell).map(|_| 0),
    }
}

// ============================================================================
// Simulate
// ============================================================================

struct SimulateOptions {
    config: Option<PathBuf>,
    heartbeats: u64,
    interval: Option<Duration>,
    initial_id: i64,
    desync_at: Option<u64>,
    restart_at: Option<u64>,
    reject: Option<String>,
    json: bool,
}

fn cmd_simulate(opts: SimulateOptions) -> Result<i32> {
    let config = match &opts.config {
        Some(path) => AgentConfig::from_file(path)?,
        None => AgentConfig::for_server("localhost"),
    };

    let coordinator = Arc::new(ScriptedCoordinator::new(opts.initial_id));
    if let Some(n) = opts.desync_at {
        coordinator.skew_heartbeat(n, 1);
    }
    if let Some(n) = opts.restart_at {
        coordinator.restart_at_heartbeat(n);
    }
    if let Some(log) = &opts.reject {
        coordinator.reply_to_registration(json!({
            "id": opts.initial_id,
            "exitstatus": 1,
            "log": log,
        }));
    }
    let connector = Arc::new(LoopbackConnector::new(coordinator.clone()));

    let stop = StopToken::new();
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || handler_stop.cancel())
        .context("Failed to install Ctrl-C handler")?;

    let mut agent = Agent::new(&config, connector.clone(), stop.clone());
    if let Some(interval) = opts.interval {
        agent = agent.with_heartbeat_interval(interval);
    }

    let watcher = {
        let coordinator = coordinator.clone();
        let stop = stop.clone();
        let target = opts.heartbeats;
        let poll = config.stop_poll();
        thread::spawn(move || {
            while !stop.wait_timeout(poll) {
                if coordinator.heartbeat_count() >= target {
                    info!(heartbeats = target, "Heartbeat target reached, stopping");
                    stop.cancel();
                }
            }
        })
    };

    info!(url = %config.connection_url(), "Simulating against loopback coordinator");
    let exit_code = agent.run();
    stop.cancel();
    watcher
        .join()
        .map_err(|_| anyhow::anyhow!("Heartbeat watcher thread panicked"))?;

    let summary = json!({
        "heartbeats": coordinator.heartbeat_count(),
        "connections": connector.connection_count(),
        "response_id": agent.heartbeat().response_id(),
        "restart_reason": agent.restart().requested(),
        "exit_code": exit_code,
        "finished_at": utc_now(),
    });

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("Heartbeats answered: {}", coordinator.heartbeat_count());
        println!("Connections opened:  {}", connector.connection_count());
        println!("Last response id:    {}", agent.heartbeat().response_id());
        match agent.restart().requested() {
            Some(reason) => println!("Restart requested:   {}", reason),
            None => println!("Restart requested:   no"),
        }
    }
    Ok(exit_code)
}

// ============================================================================
// Config
// ============================================================================

fn cmd_config_show(path: &Path, json: bool) -> Result<()> {
    let config = AgentConfig::from_file(path)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&config)?);
    } else {
        let rendered = toml::to_string_pretty(&config).context("Failed to render config")?;
        print!("{}", rendered);
    }
    Ok(())
}

fn cmd_config_validate(path: &Path) -> Result<()> {
    let config = AgentConfig::from_file(path)?;
    println!(
        "Config OK: {} (coordinator {})",
        path.display(),
        config.connection_url()
    );
    Ok(())
}

fn cmd_completions(shell: clap_complete::Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "fleetlink", &mut std::io::stdout());
    Ok(())
}
