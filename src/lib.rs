pub mod bus;
pub mod commands;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod plugin;
pub mod state;
pub mod xml;

/// Control-message protocol version this engine accepts.
pub const PROTOCOL_VERSION: &str = "1";
