//! Jarvis hub: activates protocol processes, routes envelopes between them and
//! the browser side, and correlates requests with their responses.

pub mod comms;
pub mod config;
pub mod hub;
pub mod logger;

pub use hub::{Hub, HubCommand};
