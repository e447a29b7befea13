use std::{
    fmt,
    future::Future,
    time::{Duration, Instant},
};

use serde::Serialize;
use tokio::sync::watch;
use tracing::warn;

use crate::outcome::duration_ms;

/// Returned instead of a value when an operation outlives its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeoutSignal {
    #[serde(with = "duration_ms")]
    pub deadline: Duration,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

impl fmt::Display for TimeoutSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "deadline of {}ms exceeded after {}ms",
            self.deadline.as_millis(),
            self.elapsed.as_millis()
        )
    }
}

/// Handed to a guarded operation so it can stop cooperatively.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the guard gives up on the operation.
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                // Guard dropped without cancelling; the operation can never be cancelled.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Races an operation against a deadline. On expiry the operation is told to
/// stop, given `grace` to wind down, then aborted.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutGuard {
    default_deadline: Duration,
    grace: Duration,
}

impl TimeoutGuard {
    pub fn new(default_deadline: Duration, grace: Duration) -> Self {
        Self {
            default_deadline,
            grace,
        }
    }

    pub fn default_deadline(&self) -> Duration {
        self.default_deadline
    }

    pub fn deadline_for(&self, step_override: Option<Duration>) -> Duration {
        step_override.unwrap_or(self.default_deadline)
    }

    pub async fn run_with_deadline<F, Fut, T>(
        &self,
        deadline: Duration,
        operation: F,
    ) -> Result<T, TimeoutSignal>
    where
        F: FnOnce(CancelSignal) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let started = Instant::now();
        let mut handle = tokio::spawn(operation(CancelSignal { rx: cancel_rx }));

        tokio::select! {
            joined = &mut handle => match joined {
                Ok(value) => Ok(value),
                Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                Err(_) => Err(TimeoutSignal {
                    deadline,
                    elapsed: started.elapsed(),
                }),
            },
            _ = tokio::time::sleep(deadline) => {
                let _ = cancel_tx.send(true);
                if tokio::time::timeout(self.grace, &mut handle).await.is_err() {
                    handle.abort();
                }
                let signal = TimeoutSignal {
                    deadline,
                    elapsed: started.elapsed(),
                };
                warn!(deadline_ms = deadline.as_millis() as u64, "operation timed out");
                Err(signal)
            }
        }
    }
}
