// fleetlink-core: Wire records, errors, config, utilities
// No internal fleetlink dependencies; this is the foundation crate.

pub mod config;
pub mod error;
pub mod protocol;
pub mod stop;
pub mod time;
