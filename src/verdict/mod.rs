//! Verdict flags, statistics and feedback
//!
//! Flags are raised by whichever component observes a violation first and
//! are OR-combined with the post-hoc comparison of the reaped statistics.

pub mod feedback;
pub mod flags;
pub mod stats;

pub use feedback::FeedbackExtractor;
pub use flags::VerdictFlags;
pub use stats::{classify, ExecutionReport, ExecutionStats};
