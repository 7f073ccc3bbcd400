//! Bounded-concurrency, priority-ordered execution of fetch tasks.
//!
//! Upstream sources would otherwise spawn as much parallel work as tiles
//! are requested. The scheduler keeps at most `n_concurrent_tasks` tasks
//! running on a dedicated rayon pool and holds the rest in a min-heap
//! keyed by [`Priority`]. Queued tasks can be cancelled; running tasks
//! cannot.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::{TileError, TileResult};
use crate::source::{LayerId, StackId};

/// Task ordering key; smaller runs first.
///
/// Non-prefetch tasks sort before prefetch ones, then smaller `recency`
/// (the negated request timestamp, so newer requests) first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Priority {
    pub prefetch: bool,
    pub recency: i64,
}

impl Priority {
    pub fn new(prefetch: bool, timestamp: u64) -> Self {
        Self {
            prefetch,
            recency: -(timestamp as i64),
        }
    }
}

/// Identity of a viewport sharing the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewportId(pub u64);

/// What a task fetches, used for queue pruning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskTag {
    pub viewport: ViewportId,
    pub stack_id: StackId,
    pub tile: usize,
    pub layer: LayerId,
}

/// Why a queued task was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Removed by [`TaskScheduler::clear`].
    Cleared,
    /// Its tile left the visible set or its stack is no longer current.
    OutOfView,
    /// A newer queued task fetches the same thing.
    Superseded,
}

impl CancelReason {
    /// Whether the target tile must be marked dirty so it is fetched again.
    pub fn marks_dirty(self) -> bool {
        !matches!(self, CancelReason::Superseded)
    }
}

/// Lifecycle of a submitted task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Finished,
    Failed(String),
    Cancelled(CancelReason),
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Queued | TaskState::Running)
    }
}

struct TaskStatus {
    state: Mutex<TaskState>,
    changed: Condvar,
}

impl TaskStatus {
    fn new() -> Self {
        Self {
            state: Mutex::new(TaskState::Queued),
            changed: Condvar::new(),
        }
    }

    fn set(&self, state: TaskState) {
        *self.state.lock() = state;
        self.changed.notify_all();
    }
}

/// Completion channel of a submitted task.
#[derive(Clone)]
pub struct TaskHandle {
    status: Arc<TaskStatus>,
}

impl TaskHandle {
    pub fn state(&self) -> TaskState {
        self.status.state.lock().clone()
    }

    /// Block until the task finishes, fails or is cancelled.
    pub fn wait(&self) -> TaskState {
        let mut state = self.status.state.lock();
        while !state.is_terminal() {
            self.status.changed.wait(&mut state);
        }
        state.clone()
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> TaskState {
        let mut state = self.status.state.lock();
        if !state.is_terminal() {
            self.status
                .changed
                .wait_while_for(&mut state, |s| !s.is_terminal(), timeout);
        }
        state.clone()
    }
}

type Job = Box<dyn FnOnce() -> TileResult<()> + Send>;
type CancelFn = Box<dyn FnOnce(CancelReason) + Send>;

struct Task {
    priority: Priority,
    seq: u64,
    tag: TaskTag,
    job: Job,
    on_cancel: Option<CancelFn>,
    status: Arc<TaskStatus>,
}

impl Task {
    fn key(&self) -> (Priority, u64) {
        (self.priority, self.seq)
    }

    fn cancel(mut self, reason: CancelReason) {
        if let Some(on_cancel) = self.on_cancel.take() {
            on_cancel(reason);
        }
        // the job is dropped unrun
        drop(self.job);
        self.status.set(TaskState::Cancelled(reason));
    }
}

// BinaryHeap is a max-heap; reverse so the smallest key pops first.
impl Ord for Task {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.key().cmp(&self.key())
    }
}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Task {}

#[derive(Default)]
struct QueueState {
    queue: BinaryHeap<Task>,
    active: usize,
    next_seq: u64,
    failures: u64,
    cleared: u64,
}

struct SchedulerInner {
    pool: rayon::ThreadPool,
    n_concurrent: usize,
    state: Mutex<QueueState>,
    next_viewport: AtomicU64,
}

/// Priority request buffer in front of a fixed-size worker pool.
///
/// Shared by reference between every `TileProvider` of one application.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

impl TaskScheduler {
    /// Create a scheduler running at most `n_concurrent_tasks` at once.
    pub fn new(n_concurrent_tasks: i64) -> TileResult<Self> {
        if n_concurrent_tasks <= 0 {
            return Err(TileError::Configuration(format!(
                "n_concurrent_tasks must be positive, got {n_concurrent_tasks}"
            )));
        }
        let n_concurrent = n_concurrent_tasks as usize;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(n_concurrent)
            .thread_name(|idx| format!("tile-fetch-{idx}"))
            .build()
            .map_err(|e| TileError::Configuration(format!("failed to build fetch pool: {e}")))?;

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                pool,
                n_concurrent,
                state: Mutex::new(QueueState::default()),
                next_viewport: AtomicU64::new(0),
            }),
        })
    }

    /// Allocate an id for a viewport that will submit tasks.
    pub fn register_viewport(&self) -> ViewportId {
        ViewportId(self.inner.next_viewport.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Queue `job` and start as many queued tasks as free slots allow.
    ///
    /// `on_cancel` runs only if the task is dropped before it starts.
    pub fn submit<F, C>(&self, job: F, priority: Priority, tag: TaskTag, on_cancel: C) -> TaskHandle
    where
        F: FnOnce() -> TileResult<()> + Send + 'static,
        C: FnOnce(CancelReason) + Send + 'static,
    {
        let status = Arc::new(TaskStatus::new());
        {
            let mut state = self.inner.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.queue.push(Task {
                priority,
                seq,
                tag,
                job: Box::new(job),
                on_cancel: Some(Box::new(on_cancel)),
                status: Arc::clone(&status),
            });
        }
        SchedulerInner::dispatch(&self.inner);
        TaskHandle { status }
    }

    /// Cancel every queued task. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let cancelled: Vec<Task> = {
            let mut state = self.inner.state.lock();
            let tasks: Vec<Task> = state.queue.drain().collect();
            state.cleared += tasks.len() as u64;
            tasks
        };
        let n = cancelled.len();
        for task in cancelled {
            task.cancel(CancelReason::Cleared);
        }
        if n > 0 {
            debug!(cancelled = n, "cleared fetch queue");
        }
        n
    }

    /// Prune queued tasks of `viewport` that are no longer useful.
    ///
    /// Tasks of other viewports are left alone. For this viewport, a task
    /// is cancelled when its stack is not `stack_id` or its tile is not in
    /// `keep_tiles`, and also when a newer queued task fetches the same
    /// (stack, tile, layer); the latter does not mark the tile dirty.
    /// Returns how many were removed.
    pub fn clear_vp_res(
        &self,
        viewport: ViewportId,
        stack_id: &StackId,
        keep_tiles: &HashSet<usize>,
    ) -> usize {
        let mut cancelled: Vec<(Task, CancelReason)> = Vec::new();
        {
            let mut state = self.inner.state.lock();
            let mut tasks = std::mem::take(&mut state.queue).into_vec();
            // best (newest) first so the survivor of each key is the newest
            tasks.sort_by_key(Task::key);

            let mut seen: HashSet<(StackId, usize, LayerId)> = HashSet::new();
            let mut kept = Vec::with_capacity(tasks.len());
            for task in tasks {
                if task.tag.viewport != viewport {
                    kept.push(task);
                } else if task.tag.stack_id != *stack_id || !keep_tiles.contains(&task.tag.tile) {
                    cancelled.push((task, CancelReason::OutOfView));
                } else if !seen.insert((task.tag.stack_id.clone(), task.tag.tile, task.tag.layer)) {
                    cancelled.push((task, CancelReason::Superseded));
                } else {
                    kept.push(task);
                }
            }
            state.queue = BinaryHeap::from(kept);
            state.cleared += cancelled.len() as u64;
        }

        let n = cancelled.len();
        for (task, reason) in cancelled {
            task.cancel(reason);
        }
        if n > 0 {
            debug!(viewport = viewport.0, cancelled = n, "pruned fetch queue");
        }
        n
    }

    pub fn active_count(&self) -> usize {
        self.inner.state.lock().active
    }

    pub fn queued_count(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn failure_count(&self) -> u64 {
        self.inner.state.lock().failures
    }

    /// Total tasks removed by `clear` and `clear_vp_res`.
    pub fn cleared_count(&self) -> u64 {
        self.inner.state.lock().cleared
    }

    pub fn n_concurrent_tasks(&self) -> usize {
        self.inner.n_concurrent
    }
}

impl SchedulerInner {
    /// Move queued tasks into free slots, highest priority first.
    fn dispatch(this: &Arc<Self>) {
        let ready: Vec<Task> = {
            let mut state = this.state.lock();
            let mut ready = Vec::new();
            while state.active < this.n_concurrent {
                let Some(task) = state.queue.pop() else { break };
                state.active += 1;
                ready.push(task);
            }
            ready
        };

        for task in ready {
            let inner = Arc::clone(this);
            this.pool.spawn(move || Self::run(inner, task));
        }
    }

    fn run(this: Arc<Self>, task: Task) {
        let Task {
            tag, job, status, ..
        } = task;
        status.set(TaskState::Running);

        let outcome = match panic::catch_unwind(AssertUnwindSafe(job)) {
            Ok(Ok(())) => TaskState::Finished,
            Ok(Err(e)) => TaskState::Failed(e.to_string()),
            Err(payload) => TaskState::Failed(panic_message(payload.as_ref())),
        };

        if let TaskState::Failed(reason) = &outcome {
            warn!(
                layer = %tag.layer,
                tile = tag.tile,
                error = %reason,
                "fetch task failed"
            );
        }

        {
            let mut state = this.state.lock();
            state.active -= 1;
            if matches!(outcome, TaskState::Failed(_)) {
                state.failures += 1;
            }
        }
        status.set(outcome);

        Self::dispatch(&this);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic".to_string()
    }
}
