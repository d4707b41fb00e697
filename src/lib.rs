pub mod cloud;
pub mod config;
pub mod controller;
pub mod error;
pub mod model;
pub mod server;
pub mod state;

#[cfg(test)]
mod fixtures;

// Re-export for main.rs
pub use crate::config::Config;
pub use crate::controller::{Context, Engine, Event};
pub use crate::error::{ReadinessError, Result};
