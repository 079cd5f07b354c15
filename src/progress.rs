use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub total: u32,
    pub completed: u32,
    pub succeeded: u32,
    pub failed: u32,
}

/// Thread-safe tally of clone outcomes.
#[derive(Debug, Default)]
pub struct ProgressCounter {
    inner: Mutex<Progress>,
}

impl ProgressCounter {
    pub fn new(total: u32) -> Self {
        Self {
            inner: Mutex::new(Progress {
                total,
                ..Progress::default()
            }),
        }
    }

    /// Counts one more unit of work towards the total.
    pub fn register(&self) {
        self.lock().total += 1;
    }

    pub fn update(&self, success: bool) {
        let mut progress = self.lock();
        progress.completed += 1;
        if success {
            progress.succeeded += 1;
        } else {
            progress.failed += 1;
        }
    }

    pub fn snapshot(&self) -> Progress {
        *self.lock()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Progress> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
