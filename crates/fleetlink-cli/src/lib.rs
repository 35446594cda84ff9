// fleetlink-cli: Clap commands, logging setup
// Depends on fleetlink-core, fleetlink-agent

pub mod commands;
pub mod logging;

pub use commands::{Cli, run};
