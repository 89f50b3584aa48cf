//! Delayed-task schedulers used by the broadcast core's flush debounce.
//!
//! - [`TokioScheduler`]: production scheduler on a tokio runtime. The delay
//!   runs as an async sleep; the task itself runs on the blocking pool since
//!   flushes perform synchronous session I/O.
//! - [`ManualScheduler`]: virtual clock for deterministic tests. Tasks run
//!   only when the clock is advanced.

use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;

/// Boxed task handed to a scheduler.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs a task once after a delay.
pub trait Scheduler: Send + Sync + 'static {
    /// Schedules `task` to run once `delay` has elapsed. Never blocks.
    fn schedule(&self, delay: Duration, task: Task);
}

// ---------------------------------------------------------------------------
// TokioScheduler
// ---------------------------------------------------------------------------

/// Scheduler backed by a tokio runtime handle.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: tokio::runtime::Handle,
}

impl TokioScheduler {
    /// Uses the given runtime handle.
    #[must_use]
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime of the calling context.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    #[must_use]
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }

    /// Uses the runtime of the calling context, if there is one.
    #[must_use]
    pub fn try_current() -> Option<Self> {
        tokio::runtime::Handle::try_current().ok().map(Self::new)
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: Task) {
        let handle = self.handle.clone();
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = handle.spawn_blocking(task).await {
                tracing::error!("scheduled task failed: {e}");
            }
        });
    }
}

// ---------------------------------------------------------------------------
// ManualScheduler
// ---------------------------------------------------------------------------

struct PendingTask {
    due: Duration,
    order: u64,
    task: Task,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    next_order: u64,
    pending: Vec<PendingTask>,
}

/// Deterministic scheduler driven by [`advance`](ManualScheduler::advance).
#[derive(Default)]
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

impl ManualScheduler {
    /// Creates a scheduler with its clock at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time.
    #[must_use]
    pub fn now(&self) -> Duration {
        self.state.lock().now
    }

    /// Number of tasks not yet run.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Moves the clock forward and runs every task that became due, in due
    /// order. Tasks scheduled by those tasks run too if they fall within the
    /// new time. Returns the number of tasks run.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.state.lock().now + by;
        let mut ran = 0;
        loop {
            let next = {
                let mut state = self.state.lock();
                let due = state
                    .pending
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.due <= target)
                    .min_by_key(|(_, t)| (t.due, t.order))
                    .map(|(i, _)| i);
                match due {
                    Some(i) => {
                        let task = state.pending.swap_remove(i);
                        state.now = state.now.max(task.due);
                        Some(task.task)
                    }
                    None => {
                        state.now = target;
                        None
                    }
                }
            };
            match next {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    /// Runs every pending task regardless of its due time.
    pub fn run_pending(&self) -> usize {
        let far = {
            let state = self.state.lock();
            state
                .pending
                .iter()
                .map(|t| t.due)
                .max()
                .unwrap_or(state.now)
                .saturating_sub(state.now)
        };
        self.advance(far)
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: Task) {
        let mut state = self.state.lock();
        let order = state.next_order;
        state.next_order += 1;
        let due = state.now + delay;
        state.pending.push(PendingTask { due, order, task });
    }
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ManualScheduler")
            .field("now", &state.now)
            .field("pending", &state.pending.len())
            .finish()
    }
}
