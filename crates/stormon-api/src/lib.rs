pub mod auth;
pub mod config;
pub mod error;
pub mod rest;
pub mod stats;
pub mod swagger;
pub mod zapi;

#[cfg(test)]
mod mock;

pub use auth::Credentials;
pub use config::{AuthStyle, ConnectionConfig, ScriptConfig};
pub use stats::Stats;
