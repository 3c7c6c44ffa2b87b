//! Resource-limited groups
//!
//! A cgroup v2 directory when the host allows it, otherwise an rlimit-based
//! fallback group.

pub mod backend;
pub mod rlimit;
pub mod v2;

pub use backend::{create_limit_group, GroupId, GroupLimits, LimitGroup};
pub use rlimit::RlimitGroup;
pub use v2::CgroupV2Group;
