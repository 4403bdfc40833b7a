//! Background task scheduling.
//!
//! Repositories and expiration strategies never spawn threads themselves;
//! they ask a [`Scheduler`] and keep the returned [`TaskHandle`] so they can
//! cancel the work when they close.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

/// Work submitted once. The token fires when the handle is cancelled;
/// long-running tasks must poll it.
pub type OneShotTask = Box<dyn FnOnce(CancellationToken) + Send + 'static>;

/// Work run repeatedly at a fixed rate.
pub type PeriodicTask = Arc<dyn Fn() + Send + Sync + 'static>;

/// Submit-once and fixed-rate scheduling of blocking background work.
pub trait Scheduler: Send + Sync {
    /// Run `task` once in the background.
    fn submit(&self, name: &str, task: OneShotTask) -> TaskHandle;

    /// Run `task` every `period` until the handle is cancelled.
    ///
    /// Implementations must never run one scheduled task concurrently with
    /// itself. The guarantee is per handle: after a cancel, a run already in
    /// progress may overlap the first run of a task scheduled again under
    /// the same name, so callers that reschedule serialize their runs.
    fn schedule_at_fixed_rate(&self, name: &str, task: PeriodicTask, period: Duration)
    -> TaskHandle;
}

/// Cancellable handle to a scheduled task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    name: Arc<str>,
    token: CancellationToken,
}

impl TaskHandle {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            token: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Token observed by the task.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Request cancellation. Calling it again has no effect.
    ///
    /// A run already in progress completes; no further run starts.
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            debug!(task = %self.name, "Cancelling background task");
            self.token.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Scheduler backed by a tokio runtime.
///
/// Tasks are blocking, so every run goes through `spawn_blocking`. A
/// periodic task awaits each run before waiting for the next tick.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    runtime: Handle,
}

impl TokioScheduler {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// Use the runtime of the calling context, if there is one.
    pub fn try_current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl Scheduler for TokioScheduler {
    fn submit(&self, name: &str, task: OneShotTask) -> TaskHandle {
        let handle = TaskHandle::new(name);
        let token = handle.token();
        let task_name = name.to_string();

        self.runtime.spawn_blocking(move || {
            trace!(task = %task_name, "Running submitted task");
            task(token);
        });

        handle
    }

    fn schedule_at_fixed_rate(
        &self,
        name: &str,
        task: PeriodicTask,
        period: Duration,
    ) -> TaskHandle {
        let handle = TaskHandle::new(name);
        let token = handle.token();
        let task_name = name.to_string();
        let period = period.max(Duration::from_millis(1));

        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                task = %task_name,
                period_ms = period.as_millis() as u64,
                "Periodic task scheduled"
            );

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let run = Arc::clone(&task);
                        if let Err(e) = tokio::task::spawn_blocking(move || run()).await {
                            error!(task = %task_name, error = %e, "Periodic task run failed");
                        }
                    }
                }
            }

            debug!(task = %task_name, "Periodic task stopped");
        });

        handle
    }
}

#[cfg(any(test, feature = "testing"))]
pub use manual::ManualScheduler;

#[cfg(any(test, feature = "testing"))]
mod manual {
    use parking_lot::Mutex;

    use super::*;

    struct Periodic {
        name: String,
        task: PeriodicTask,
        period: Duration,
        handle: TaskHandle,
    }

    /// Deterministic scheduler for tests: nothing runs until asked.
    #[derive(Default)]
    pub struct ManualScheduler {
        submitted: Mutex<Vec<(String, OneShotTask, TaskHandle)>>,
        periodic: Mutex<Vec<Periodic>>,
    }

    impl ManualScheduler {
        pub fn new() -> Self {
            Self::default()
        }

        /// Run every pending one-shot task that was not cancelled.
        /// Tasks submitted while running are left for the next call.
        pub fn run_submitted(&self) -> usize {
            let pending: Vec<_> = std::mem::take(&mut *self.submitted.lock());
            let mut ran = 0;
            for (_, task, handle) in pending {
                if !handle.is_cancelled() {
                    task(handle.token());
                    ran += 1;
                }
            }
            ran
        }

        /// Take the pending one-shot tasks without running them.
        pub fn take_submitted(&self) -> Vec<(String, OneShotTask, TaskHandle)> {
            std::mem::take(&mut *self.submitted.lock())
        }

        pub fn submitted_names(&self) -> Vec<String> {
            self.submitted
                .lock()
                .iter()
                .map(|(name, _, _)| name.clone())
                .collect()
        }

        /// Run one round of every live periodic task with this name.
        pub fn tick(&self, name: &str) -> usize {
            let due: Vec<PeriodicTask> = self
                .periodic
                .lock()
                .iter()
                .filter(|p| p.name == name && !p.handle.is_cancelled())
                .map(|p| Arc::clone(&p.task))
                .collect();
            for task in &due {
                task();
            }
            due.len()
        }

        /// Names of periodic tasks that have not been cancelled.
        pub fn live_periodic(&self) -> Vec<String> {
            self.periodic
                .lock()
                .iter()
                .filter(|p| !p.handle.is_cancelled())
                .map(|p| p.name.clone())
                .collect()
        }

        /// Period of the live periodic task with this name.
        pub fn period_of(&self, name: &str) -> Option<Duration> {
            self.periodic
                .lock()
                .iter()
                .find(|p| p.name == name && !p.handle.is_cancelled())
                .map(|p| p.period)
        }
    }

    impl Scheduler for ManualScheduler {
        fn submit(&self, name: &str, task: OneShotTask) -> TaskHandle {
            let handle = TaskHandle::new(name);
            self.submitted
                .lock()
                .push((name.to_string(), task, handle.clone()));
            handle
        }

        fn schedule_at_fixed_rate(
            &self,
            name: &str,
            task: PeriodicTask,
            period: Duration,
        ) -> TaskHandle {
            let handle = TaskHandle::new(name);
            self.periodic.lock().push(Periodic {
                name: name.to_string(),
                task,
                period,
                handle: handle.clone(),
            });
            handle
        }
    }
}
