//! Configuration
//!
//! Shared types, error taxonomy, and configuration loading.

pub mod loader;
pub mod types;
