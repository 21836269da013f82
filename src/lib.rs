//! Custobot - mention-triggered transaction pipeline
//!
//! Turns free-text social mentions into authorized, idempotent, audited
//! financial operations against custodial agent wallets.

pub mod audit;
pub mod auth;
pub mod cli;
pub mod collab;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod store;
pub mod vault;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
