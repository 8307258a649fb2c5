//! The shared maintenance scheduler.
//!
//! One process-wide thread dispatches the periodic maintenance of every
//! active pool. The first pool to register a task starts the thread; the
//! last one to cancel its task stops it and the stop is joined, so teardown
//! is observable deterministically. Each task carries the Tokio runtime
//! handle its pool was built under, and its job future is spawned onto that
//! runtime, so maintenance always runs in the environment the pool came
//! from.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use futures_core::future::BoxFuture;
use tokio::runtime::Handle;
use tracing::trace;

pub(crate) type MaintenanceJob = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct Task {
    period: Duration,
    next_due: Instant,
    runtime: Handle,
    job: MaintenanceJob,
}

struct SchedulerInner {
    tasks: HashMap<u64, Task>,
    shutdown: bool,
}

struct SchedulerState {
    inner: Mutex<SchedulerInner>,
    wakeup: Condvar,
}

struct Scheduler {
    state: Arc<SchedulerState>,
    thread: Option<thread::JoinHandle<()>>,
}

static SCHEDULER: Mutex<Option<Scheduler>> = Mutex::new(None);
static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to one scheduled maintenance task. Dropping it cancels the task;
/// cancelling the last task shuts the scheduler thread down.
pub(crate) struct EvictorRegistration {
    id: u64,
}

impl Drop for EvictorRegistration {
    fn drop(&mut self) {
        deregister(self.id);
    }
}

pub(crate) fn register(
    period: Duration,
    runtime: Handle,
    job: MaintenanceJob,
) -> EvictorRegistration {
    let id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
    let mut slot = SCHEDULER.lock().unwrap();
    let scheduler = slot.get_or_insert_with(Scheduler::spawn);
    {
        let mut inner = scheduler.state.inner.lock().unwrap();
        inner.tasks.insert(
            id,
            Task {
                period,
                next_due: Instant::now() + period,
                runtime,
                job,
            },
        );
    }
    scheduler.state.wakeup.notify_one();
    EvictorRegistration { id }
}

fn deregister(id: u64) {
    let finished = {
        let mut slot = SCHEDULER.lock().unwrap();
        let Some(scheduler) = slot.as_mut() else {
            return;
        };
        let now_empty = {
            let mut inner = scheduler.state.inner.lock().unwrap();
            inner.tasks.remove(&id);
            inner.tasks.is_empty()
        };
        if now_empty {
            let scheduler = slot.take().expect("scheduler present");
            scheduler.state.inner.lock().unwrap().shutdown = true;
            scheduler.state.wakeup.notify_one();
            Some(scheduler)
        } else {
            scheduler.state.wakeup.notify_one();
            None
        }
    };
    if let Some(mut scheduler) = finished {
        if let Some(handle) = scheduler.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Whether the shared scheduler thread currently exists.
pub fn is_running() -> bool {
    SCHEDULER.lock().unwrap().is_some()
}

#[cfg(test)]
pub(crate) fn task_count() -> usize {
    SCHEDULER
        .lock()
        .unwrap()
        .as_ref()
        .map_or(0, |scheduler| scheduler.state.inner.lock().unwrap().tasks.len())
}

/// Serializes tests that touch the process-wide scheduler.
#[cfg(test)]
pub(crate) fn test_guard() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl Scheduler {
    fn spawn() -> Scheduler {
        let state = Arc::new(SchedulerState {
            inner: Mutex::new(SchedulerInner {
                tasks: HashMap::new(),
                shutdown: false,
            }),
            wakeup: Condvar::new(),
        });
        let thread_state = Arc::clone(&state);
        let thread = thread::Builder::new()
            .name("corral-evictor".into())
            .spawn(move || run(thread_state))
            .expect("failed to spawn evictor thread");
        Scheduler {
            state,
            thread: Some(thread),
        }
    }
}

fn run(state: Arc<SchedulerState>) {
    let mut inner = state.inner.lock().unwrap();
    loop {
        if inner.shutdown {
            trace!("evictor scheduler shutting down");
            return;
        }

        let now = Instant::now();
        let mut due: Vec<(Handle, MaintenanceJob)> = Vec::new();
        let mut next: Option<Instant> = None;
        for task in inner.tasks.values_mut() {
            if task.next_due <= now {
                due.push((task.runtime.clone(), Arc::clone(&task.job)));
                task.next_due = now + task.period;
            }
            next = Some(next.map_or(task.next_due, |soonest| soonest.min(task.next_due)));
        }

        if !due.is_empty() {
            // Dispatch with the lock released; jobs may take pool locks.
            drop(inner);
            for (runtime, job) in due {
                runtime.spawn(job());
            }
            inner = state.inner.lock().unwrap();
            continue;
        }

        inner = match next {
            Some(at) => {
                let wait = at.saturating_duration_since(now);
                state.wakeup.wait_timeout(inner, wait).unwrap().0
            }
            None => state.wakeup.wait(inner).unwrap(),
        };
    }
}
