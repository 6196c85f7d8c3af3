//! Experiment file model for encsweep
//!
//! Handles loading the TOML experiment description and environment variable overrides.

pub mod config;

pub use config::*;
