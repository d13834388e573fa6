//! Bootstrap helpers for bringing a service process up
//!
//! This module handles:
//! - `.env` loading
//! - Configuration file discovery and loading

pub mod config;

pub use config::load_config;
