//! How the accounting loop waits out a lost compare-and-swap.
//!
//! The limiter never calls the timer directly. Production uses [`TokioSleeper`]; tests swap in
//! [`InstantSleeper`] or [`TrackingSleeper`] so retry pacing is observable without real delays.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Boxed pause future handed back by a [`Sleeper`].
pub type Pause = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Waits for the pause chosen by the contention backoff.
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration) -> Pause;
}

/// Waits on the tokio timer. A zero pause only yields to the scheduler so the competing
/// writer can finish.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pause {
        if duration.is_zero() {
            Box::pin(tokio::task::yield_now())
        } else {
            Box::pin(tokio::time::sleep(duration))
        }
    }
}

/// Returns immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

impl Sleeper for InstantSleeper {
    fn sleep(&self, _duration: Duration) -> Pause {
        Box::pin(std::future::ready(()))
    }
}

/// Returns immediately and remembers each requested pause. Clones share the log.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    pauses: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requested pauses, oldest first.
    pub fn calls(&self) -> Vec<Duration> {
        self.pauses.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Sum of every requested pause.
    pub fn total(&self) -> Duration {
        self.pauses.lock().unwrap_or_else(|e| e.into_inner()).iter().sum()
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, duration: Duration) -> Pause {
        self.pauses.lock().unwrap_or_else(|e| e.into_inner()).push(duration);
        Box::pin(std::future::ready(()))
    }
}
