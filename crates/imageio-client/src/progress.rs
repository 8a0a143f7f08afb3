//! Transfer progress reporting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::io::Write;

/// Observer notified after every successful chunk.
pub trait Progress: Send + Sync {
    /// Called once when the transfer size is known.
    fn start(&self, _size: u64) {}

    /// `n` more bytes were handled (copied, zeroed, or skipped).
    fn update(&self, n: u64);
}

/// Discards all updates.
pub struct NullProgress;

impl Progress for NullProgress {
    fn update(&self, _n: u64) {}
}

/// Minimal terminal progress line, updated in whole percents.
#[derive(Default)]
pub struct TextProgress {
    size: AtomicU64,
    done: AtomicU64,
    last_percent: AtomicU64,
}

impl TextProgress {
    pub fn new() -> TextProgress {
        TextProgress::default()
    }
}

impl Progress for TextProgress {
    fn start(&self, size: u64) {
        self.size.store(size, Ordering::SeqCst);
    }

    fn update(&self, n: u64) {
        let size = self.size.load(Ordering::SeqCst);
        if size == 0 {
            return;
        }
        let done = self.done.fetch_add(n, Ordering::SeqCst) + n;
        let percent = done * 100 / size;
        if percent != self.last_percent.swap(percent, Ordering::SeqCst) {
            let mut err = std::io::stderr();
            let _ = write!(err, "\r[ {percent:3}% ] {done} of {size} bytes");
            if percent >= 100 {
                let _ = writeln!(err);
            }
            let _ = err.flush();
        }
    }
}
