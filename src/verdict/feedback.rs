//! Exception feedback extraction from captured stderr.
//!
//! A harness running inside the sandbox reports an uncaught exception as the
//! sentinel line followed by `<ExceptionType>:`. Large captures are skipped
//! outright so a hostile program cannot make the judge scan megabytes.

use crate::config::types::{FeedbackConfig, Result, SandboxError};
use once_cell::sync::Lazy;
use regex::bytes::Regex;

static DEFAULT_EXTRACTOR: Lazy<Option<FeedbackExtractor>> =
    Lazy::new(|| FeedbackExtractor::new(&FeedbackConfig::default()).ok());

#[derive(Clone, Debug)]
pub struct FeedbackExtractor {
    pattern: Regex,
    scan_limit: usize,
}

impl FeedbackExtractor {
    pub fn new(config: &FeedbackConfig) -> Result<Self> {
        // `.` stops at `\n`, so the capture never spans lines.
        let source = format!(r"(?-u){}\r?\n(.*?):", regex::escape(&config.sentinel));
        let pattern = Regex::new(&source)
            .map_err(|e| SandboxError::Config(format!("invalid feedback sentinel: {}", e)))?;
        Ok(Self {
            pattern,
            scan_limit: config.scan_limit,
        })
    }

    /// Extractor for `config`; the default configuration reuses one
    /// compiled pattern.
    pub fn for_config(config: &FeedbackConfig) -> Result<Self> {
        if *config == FeedbackConfig::default() {
            if let Some(extractor) = DEFAULT_EXTRACTOR.as_ref() {
                return Ok(extractor.clone());
            }
        }
        Self::new(config)
    }

    /// Exception type name reported on `stderr`, if any.
    pub fn extract(&self, stderr: &[u8]) -> Option<String> {
        if stderr.len() >= self.scan_limit {
            return None;
        }
        self.pattern
            .captures(stderr)
            .and_then(|caps| caps.get(1))
            .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
    }
}
