use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Spawns background jobs (ping aggregation, full sync pacing) onto a tokio
/// runtime owned by the application.
#[derive(Debug, Clone)]
pub struct TaskRunner {
    handle: Handle,
}

impl TaskRunner {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Runner for the runtime the caller is on, if any.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }

    pub fn spawn<F>(&self, future: F) -> ScheduledJob<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        ScheduledJob {
            handle: self.handle.spawn(future),
        }
    }
}

/// Handle to a spawned job. Dropping it detaches the job.
#[derive(Debug)]
pub struct ScheduledJob<T> {
    handle: JoinHandle<T>,
}

impl<T> ScheduledJob<T> {
    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the job. `None` when it was cancelled or panicked.
    pub async fn join(self) -> Option<T> {
        match self.handle.await {
            Ok(value) => Some(value),
            Err(e) if e.is_panic() => {
                log::error!("Background job panicked: {}", e);
                None
            }
            Err(_) => None,
        }
    }
}

/// Calls `tick` every `interval` after an initial `delay` until it breaks.
pub async fn repeat_every<T>(
    delay: Duration,
    interval: Duration,
    mut tick: impl FnMut() -> ControlFlow<T>,
) -> T {
    tokio::time::sleep(delay).await;

    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let ControlFlow::Break(value) = tick() {
            return value;
        }
    }
}
