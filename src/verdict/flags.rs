//! Monotonic verdict flags shared by the controller, monitor and watchdog.

use std::sync::atomic::{AtomicBool, Ordering};

/// `tle`/`mle` flags. Any writer may raise a flag; nothing lowers it.
#[derive(Debug, Default)]
pub struct VerdictFlags {
    tle: AtomicBool,
    mle: AtomicBool,
}

impl VerdictFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_tle(&self) {
        self.tle.fetch_or(true, Ordering::SeqCst);
    }

    pub fn mark_mle(&self) {
        self.mle.fetch_or(true, Ordering::SeqCst);
    }

    /// OR post-hoc findings into the flags.
    pub fn merge(&self, tle: bool, mle: bool) {
        self.tle.fetch_or(tle, Ordering::SeqCst);
        self.mle.fetch_or(mle, Ordering::SeqCst);
    }

    pub fn tle(&self) -> bool {
        self.tle.load(Ordering::SeqCst)
    }

    pub fn mle(&self) -> bool {
        self.mle.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn merge_never_lowers() {
        let flags = VerdictFlags::new();
        flags.mark_tle();
        flags.merge(false, false);
        assert!(flags.tle());
        assert!(!flags.mle());
        flags.merge(false, true);
        assert!(flags.mle());
    }

    #[test]
    fn concurrent_writers_combine() {
        let flags = Arc::new(VerdictFlags::new());
        let a = {
            let flags = Arc::clone(&flags);
            std::thread::spawn(move || flags.mark_tle())
        };
        let b = {
            let flags = Arc::clone(&flags);
            std::thread::spawn(move || flags.mark_mle())
        };
        a.join().unwrap();
        b.join().unwrap();
        assert!(flags.tle() && flags.mle());
    }
}
