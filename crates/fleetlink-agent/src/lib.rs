// fleetlink-agent: Registration handshake, correlation gateway, heartbeat loop
// Depends on fleetlink-core

pub mod agent;
pub mod cache;
pub mod context;
pub mod gateway;
pub mod heartbeat;
pub mod lifecycle;
pub mod listeners;
pub mod loopback;
pub mod registration;
pub mod registry;
pub mod restart;
pub mod transport;
