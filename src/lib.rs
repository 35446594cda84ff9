//! # fleetlink: node-side registration and heartbeat agent
//!
//! Facade crate that re-exports the fleetlink workspace crates so consumers
//! can depend on a single `fleetlink` library.
//!
//! ## Crate breakdown
//!
//! | Module | Crate | Purpose |
//! |--------|-------|---------|
//! | [`core`] | fleetlink-core | Wire records, error taxonomy, config, stop token |
//! | [`agent`] | fleetlink-agent | Correlation gateway, dispatch registry, lifecycle, heartbeat loop |
//! | [`cli`] | fleetlink-cli | Clap commands and logging setup |

pub use fleetlink_agent as agent;
pub use fleetlink_cli as cli;
pub use fleetlink_core as core;
