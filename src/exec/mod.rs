//! Execution control
//!
//! Forks children parked at a gate and enforces the launch ordering with a
//! type-state chain.

pub mod preexec;
pub mod spawn;
