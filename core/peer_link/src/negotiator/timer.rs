//! Cancellable handshake deadline
//!
//! One thread per pending session sleeps on a condvar until the deadline
//! passes or the deadline is cancelled. Dropping a [`Deadline`] cancels it.

use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Instant;

struct Shared {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

/// A running deadline timer
pub struct Deadline {
    shared: Arc<Shared>,
}

impl Deadline {
    /// Run `on_expire` on a timer thread once `at` passes, unless cancelled first
    pub fn start<F>(name: &str, at: Instant, on_expire: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = Arc::new(Shared {
            cancelled: Mutex::new(false),
            wake: Condvar::new(),
        });

        let timer = shared.clone();
        thread::Builder::new()
            .name(format!("deadline-{}", name))
            .spawn(move || {
                let mut cancelled = timer.cancelled.lock().unwrap_or_else(|e| e.into_inner());
                loop {
                    if *cancelled {
                        return;
                    }
                    let now = Instant::now();
                    if now >= at {
                        break;
                    }
                    cancelled = timer
                        .wake
                        .wait_timeout(cancelled, at - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|e| e.into_inner().0);
                }
                drop(cancelled);
                on_expire();
            })?;

        Ok(Deadline { shared })
    }

    /// Stop the timer. Has no effect once `on_expire` has started.
    pub fn cancel(&self) {
        let mut cancelled = self.shared.cancelled.lock().unwrap_or_else(|e| e.into_inner());
        *cancelled = true;
        self.shared.wake.notify_all();
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.cancel();
    }
}
