//! Single-flight gate for non-idempotent reconfiguration.
//!
//! While one caller is running the guarded operation, every other caller
//! waits for it to finish and receives its result instead of running the
//! operation again.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::Notify;

/// How a caller got its result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flight<T> {
    /// This caller ran the operation.
    Led(T),
    /// Another caller was already running it; this is that caller's result
    /// (`None` if the leader panicked).
    Joined(Option<T>),
}

impl<T> Flight<T> {
    pub fn into_inner(self) -> Option<T> {
        match self {
            Self::Led(v) => Some(v),
            Self::Joined(v) => v,
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Led(_))
    }
}

#[derive(Debug)]
pub struct SingleFlight<T> {
    running: AtomicBool,
    done: Notify,
    last: Mutex<Option<T>>,
}

impl<T: Clone> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            done: Notify::new(),
            last: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run `op` unless a run is already in flight, in which case wait for it.
    pub async fn run<F, Fut>(&self, op: F) -> Flight<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        // Registered before the flag check so a leader finishing in between
        // still wakes us.
        let notified = self.done.notified();

        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            notified.await;
            let last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
            return Flight::Joined(last.clone());
        }

        let _landing = Landing { gate: self };
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = None;
        let out = op().await;
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(out.clone());
        Flight::Led(out)
    }
}

/// Clears the running flag and wakes joiners even if the leader unwinds.
struct Landing<'a, T> {
    gate: &'a SingleFlight<T>,
}

impl<T> Drop for Landing<'_, T> {
    fn drop(&mut self) {
        self.gate.running.store(false, Ordering::Release);
        self.gate.done.notify_waiters();
    }
}
