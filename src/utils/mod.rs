//! Utilities
//!
//! Bounded stream collection shared by the controller and the judge layer.

pub mod output;
