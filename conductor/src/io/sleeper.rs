//! Interruptible sleeping.
//!
//! Every wait in the loop (retry delays, idle polling, breaker pauses) goes
//! through [`Sleeper`] so tests can record delays instead of sleeping, and so a
//! shutdown request ends a long pause promptly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const SLICE: Duration = Duration::from_millis(250);

pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

/// Shared flag set by the signal handler.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Real sleeper; wakes early once shutdown is requested.
#[derive(Debug, Clone, Default)]
pub struct ThreadSleeper {
    shutdown: ShutdownFlag,
}

impl ThreadSleeper {
    pub fn new(shutdown: ShutdownFlag) -> Self {
        Self { shutdown }
    }
}

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.shutdown.is_requested() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(SLICE.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_cuts_sleep_short() {
        let flag = ShutdownFlag::new();
        let sleeper = ThreadSleeper::new(flag.clone());
        let waker = {
            let flag = flag.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                flag.request();
            })
        };
        let started = Instant::now();
        sleeper.sleep(Duration::from_secs(30));
        waker.join().expect("join");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn sleeps_full_duration_without_shutdown() {
        let sleeper = ThreadSleeper::default();
        let started = Instant::now();
        sleeper.sleep(Duration::from_millis(50));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }
}
