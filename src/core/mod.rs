//! Sandbox core.
//!
//! The controller owns the child, its limit group and the two background
//! watchers (limit monitor and wall-clock watchdog). Compilation lives in
//! the judge layer.

pub mod controller;
pub mod monitor;
pub mod watchdog;

pub use controller::{LaunchRequest, SandboxedProcess};
