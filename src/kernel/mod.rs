//! Thin wrappers around Linux kernel primitives.
//!
//! All `unsafe` code outside the fork path is concentrated here with explicit
//! SAFETY comments.
//! Dependency direction: fd -> accounting -> process -> cgroup -> notify

pub mod accounting;
pub mod cgroup;
pub mod fd;
pub mod notify;
pub mod process;
