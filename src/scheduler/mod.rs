//! Cooperative worker-thread task pool.
//!
//! A [`Task`] is a unit of work with a declared `max_threads()`: the most
//! workers that may register onto it and run its body concurrently. Workers
//! pull from a shared FIFO queue, trying to register onto the head task and
//! moving on to the next one if it refuses (already full, or finished), so
//! a task's completion (and any error inside it) is visible to whoever is
//! waiting on it via [`ScheduledTask::wait`].

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::error::{Result, StorageError};

/// Cooperative cancellation flag threaded through a task's `run`. A task
/// should poll [`CancelToken::check`] at its natural break points (morsel
/// boundaries) rather than mid-unit-of-work, so cancellation finishes the
/// current morsel before returning.
#[derive(Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// Sets the flag. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// `true` once `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns `Err(StorageError::Interrupted)` if cancelled, `Ok(())`
    /// otherwise. Intended to be called at morsel boundaries inside `run`.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(StorageError::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// A unit of work submitted to the [`TaskScheduler`].
///
/// `run` may be called from any worker thread, and from up to
/// `max_threads()` of them concurrently, so it must be safe to invoke
/// concurrently with itself as well as with other tasks' `run`.
pub trait Task: Send + Sync {
    /// Executes the task's work. Called once per registered worker; check
    /// `cancel` at natural break points to cooperate with cancellation.
    fn run(&self, cancel: &CancelToken) -> Result<()>;

    /// Maximum number of workers that may register onto this task and run
    /// its body concurrently. Most tasks are single-threaded.
    fn max_threads(&self) -> usize {
        1
    }

    /// Subtasks that must run to completion, in order, before this task's
    /// own `run` is scheduled. `TaskScheduler::submit_and_wait` runs these
    /// first, sequentially, and stops at the first one that errors without
    /// ever scheduling this task.
    fn dependencies(&self) -> Vec<Box<dyn Task>> {
        Vec::new()
    }

    /// Runs once, with the task's lock held, after the last worker
    /// deregisters — a hook for state that `run` accumulated but can only
    /// safely be folded together once every worker is done (e.g. merging
    /// per-worker partial results). The default does nothing.
    fn finalize(&self) {}
}

impl<Func: Fn(&CancelToken) -> Result<()> + Send + Sync> Task for Func {
    fn run(&self, cancel: &CancelToken) -> Result<()> {
        (self)(cancel)
    }
}

/// A task's lifecycle. Guarded by a single per-task mutex
/// (`ScheduledTask::inner`): every transition happens with that lock held,
/// mirroring the registration/deregistration protocol `TaskScheduler`'s
/// workers follow.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum TaskState {
    /// No worker has registered yet.
    Pending,
    /// A worker is in the middle of registering (checking capacity and
    /// bumping the registered count).
    Registering,
    /// At least one worker is registered and may be running `run`.
    Running,
    /// The last registered worker has deregistered and is running
    /// `finalize` with the lock held.
    Finalizing,
    /// Every registrant finished and no one reported an error.
    Completed,
    /// Every registrant finished and at least one reported an error.
    Failed,
}

struct TaskInner {
    state: TaskState,
    registered: usize,
    error: Option<String>,
    interrupted: bool,
}

/// Handle to a task submitted to the scheduler; clone freely, join once.
pub struct ScheduledTask {
    task: Box<dyn Task>,
    inner: Mutex<TaskInner>,
    done: Condvar,
    cancel: CancelToken,
}

impl ScheduledTask {
    fn new(task: Box<dyn Task>) -> Arc<Self> {
        Arc::new(Self {
            task,
            inner: Mutex::new(TaskInner {
                state: TaskState::Pending,
                registered: 0,
                error: None,
                interrupted: false,
            }),
            done: Condvar::new(),
            cancel: CancelToken::new(),
        })
    }

    /// Attempts to join this task's execution as one more worker. Returns
    /// `false` if the task has already finished or is already at
    /// `max_threads` registrants — the caller should move on to the next
    /// queued task rather than block waiting for this one.
    fn try_register(self: &Arc<Self>) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            TaskState::Completed | TaskState::Failed | TaskState::Finalizing => false,
            TaskState::Pending | TaskState::Registering | TaskState::Running => {
                if inner.registered >= self.task.max_threads() {
                    return false;
                }
                inner.state = TaskState::Registering;
                inner.registered += 1;
                inner.state = TaskState::Running;
                true
            }
        }
    }

    /// Runs the task body, then deregisters; the last worker to leave
    /// finalizes the task's terminal state.
    fn execute(self: &Arc<Self>) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.task.run(&self.cancel)));
        self.deregister_and_finalize_if_last(result);
    }

    fn deregister_and_finalize_if_last(self: &Arc<Self>, result: std::thread::Result<Result<()>>) {
        let mut inner = self.inner.lock();
        match result {
            Ok(Ok(())) => {}
            Ok(Err(StorageError::Interrupted)) => {
                inner.interrupted = true;
                inner.error.get_or_insert_with(|| "interrupted".into());
            }
            Ok(Err(err)) => {
                inner.error.get_or_insert_with(|| err.to_string());
            }
            Err(_) => {
                inner.error.get_or_insert_with(|| "task panicked".into());
            }
        }
        inner.registered -= 1;
        if inner.registered > 0 {
            return;
        }
        inner.state = TaskState::Finalizing;
        if inner.error.is_none() {
            self.task.finalize();
        }
        inner.state = if inner.error.is_some() {
            TaskState::Failed
        } else {
            TaskState::Completed
        };
        drop(inner);
        self.done.notify_all();
    }

    /// Sets this task's cooperative cancellation flag. A running `run` that
    /// polls `CancelToken::check` at its next morsel boundary returns
    /// `Err(StorageError::Interrupted)`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Blocks until this task finishes, returning its error if it failed.
    pub fn wait(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        while !matches!(inner.state, TaskState::Completed | TaskState::Failed) {
            self.done.wait(&mut inner);
        }
        if inner.interrupted {
            Err(StorageError::Interrupted)
        } else if let Some(message) = &inner.error {
            Err(StorageError::TransactionError(message.clone()))
        } else {
            Ok(())
        }
    }

    /// `true` once the task has finished (successfully or not).
    pub fn is_finished(&self) -> bool {
        let inner = self.inner.lock();
        matches!(inner.state, TaskState::Completed | TaskState::Failed)
    }
}

struct SchedulerState {
    queue: VecDeque<Arc<ScheduledTask>>,
    shutdown: bool,
}

/// A fixed-size pool of worker threads draining a shared task queue.
pub struct TaskScheduler {
    state: Arc<Mutex<SchedulerState>>,
    work_available: Arc<Condvar>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskScheduler {
    /// Spawns `num_threads` worker threads, each looping: find a task at
    /// the front of the queue it can register onto, run it, repeat, until
    /// [`TaskScheduler::shutdown`] is called.
    pub fn new(num_threads: usize) -> Result<Self> {
        if num_threads == 0 {
            return Err(StorageError::ConfigError(
                "task scheduler requires at least one thread".into(),
            ));
        }
        let state = Arc::new(Mutex::new(SchedulerState {
            queue: VecDeque::new(),
            shutdown: false,
        }));
        let work_available = Arc::new(Condvar::new());

        let workers = (0..num_threads)
            .map(|worker_id| {
                let state = Arc::clone(&state);
                let work_available = Arc::clone(&work_available);
                std::thread::Builder::new()
                    .name(format!("strata-worker-{worker_id}"))
                    .spawn(move || worker_loop(worker_id, state, work_available))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Ok(Self {
            state,
            work_available,
            workers,
        })
    }

    /// Submits `task` for execution by some worker thread and returns a
    /// handle to wait on it. Does not schedule `task.dependencies()` — use
    /// [`TaskScheduler::submit_and_wait`] when a task's declared
    /// dependencies must run first.
    pub fn submit(&self, task: impl Task + 'static) -> Arc<ScheduledTask> {
        self.submit_boxed(Box::new(task))
    }

    fn submit_boxed(&self, task: Box<dyn Task>) -> Arc<ScheduledTask> {
        let scheduled = ScheduledTask::new(task);
        let mut state = self.state.lock();
        state.queue.push_back(Arc::clone(&scheduled));
        drop(state);
        self.work_available.notify_one();
        scheduled
    }

    /// Schedules `task`'s dependencies one after another — not
    /// concurrently — then `task` itself, propagating the first error any
    /// of them raises. If a dependency errors, neither it, any dependency
    /// after it, nor `task` itself ends up running further.
    pub fn submit_and_wait(&self, task: impl Task + 'static) -> Result<()> {
        self.submit_and_wait_boxed(Box::new(task))
    }

    fn submit_and_wait_boxed(&self, task: Box<dyn Task>) -> Result<()> {
        for dependency in task.dependencies() {
            self.submit_and_wait_boxed(dependency)?;
        }
        self.submit_boxed(task).wait()
    }

    /// Number of worker threads in the pool.
    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }

    /// Signals every worker to stop once its current task (if any) and the
    /// queue drain, then joins all worker threads.
    pub fn shutdown(mut self) {
        {
            let mut state = self.state.lock();
            state.shutdown = true;
        }
        self.work_available.notify_all();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("strata worker thread panicked during shutdown");
            }
        }
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        {
            let mut state = self.state.lock();
            state.shutdown = true;
        }
        self.work_available.notify_all();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("strata worker thread panicked while dropping scheduler");
            }
        }
    }
}

fn worker_loop(worker_id: usize, state: Arc<Mutex<SchedulerState>>, work_available: Arc<Condvar>) {
    loop {
        let task = {
            let mut guard = state.lock();
            loop {
                let mut index = 0;
                let mut registered = None;
                while index < guard.queue.len() {
                    if guard.queue[index].is_finished() {
                        guard.queue.remove(index);
                        continue;
                    }
                    if guard.queue[index].try_register() {
                        registered = Some(Arc::clone(&guard.queue[index]));
                        break;
                    }
                    index += 1;
                }
                if let Some(task) = registered {
                    break Some(task);
                }
                if guard.shutdown {
                    break None;
                }
                work_available.wait(&mut guard);
            }
        };
        match task {
            Some(task) => task.execute(),
            None => {
                debug!(worker_id, "strata worker exiting");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Mutex as StdMutex;

    #[test]
    fn runs_submitted_tasks() {
        let scheduler = TaskScheduler::new(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            handles.push(scheduler.submit(move |_cancel: &CancelToken| {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(())
            }));
        }
        for handle in handles {
            handle.wait().unwrap();
        }
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 10);
        scheduler.shutdown();
    }

    #[test]
    fn propagates_task_error() {
        let scheduler = TaskScheduler::new(1).unwrap();
        let err = scheduler
            .submit_and_wait(|_cancel: &CancelToken| Err(StorageError::TransactionError("boom".into())))
            .unwrap_err();
        assert!(matches!(err, StorageError::TransactionError(_)));
        scheduler.shutdown();
    }

    #[test]
    fn catches_panicking_task() {
        let scheduler = TaskScheduler::new(1).unwrap();
        let handle = scheduler.submit(|_cancel: &CancelToken| panic!("deliberate"));
        assert!(handle.wait().is_err());
        scheduler.shutdown();
    }

    #[test]
    fn zero_threads_rejected() {
        assert!(TaskScheduler::new(0).is_err());
    }

    struct CountingTask {
        max_threads: usize,
        registrants_seen: Arc<AtomicUsize>,
        barrier: Arc<std::sync::Barrier>,
    }

    impl Task for CountingTask {
        fn run(&self, _cancel: &CancelToken) -> Result<()> {
            self.registrants_seen.fetch_add(1, AtomicOrdering::SeqCst);
            self.barrier.wait();
            Ok(())
        }

        fn max_threads(&self) -> usize {
            self.max_threads
        }
    }

    #[test]
    fn multiple_workers_register_onto_one_task_up_to_max_threads() {
        let scheduler = TaskScheduler::new(3).unwrap();
        let registrants_seen = Arc::new(AtomicUsize::new(0));
        let task = CountingTask {
            max_threads: 2,
            registrants_seen: Arc::clone(&registrants_seen),
            barrier: Arc::new(std::sync::Barrier::new(2)),
        };
        scheduler.submit_and_wait(task).unwrap();
        assert_eq!(registrants_seen.load(AtomicOrdering::SeqCst), 2);
        scheduler.shutdown();
    }

    struct RecordingTask {
        name: &'static str,
        log: Arc<StdMutex<Vec<&'static str>>>,
        deps: Vec<RecordingTask>,
    }

    impl Task for RecordingTask {
        fn run(&self, _cancel: &CancelToken) -> Result<()> {
            self.log.lock().unwrap().push(self.name);
            Ok(())
        }

        fn dependencies(&self) -> Vec<Box<dyn Task>> {
            self.deps
                .iter()
                .map(|dep| {
                    Box::new(RecordingTask {
                        name: dep.name,
                        log: Arc::clone(&self.log),
                        deps: Vec::new(),
                    }) as Box<dyn Task>
                })
                .collect()
        }
    }

    #[test]
    fn dependencies_run_before_the_task_that_declares_them() {
        let scheduler = TaskScheduler::new(2).unwrap();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let task = RecordingTask {
            name: "parent",
            log: Arc::clone(&log),
            deps: vec![RecordingTask {
                name: "child",
                log: Arc::clone(&log),
                deps: Vec::new(),
            }],
        };
        scheduler.submit_and_wait(task).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["child", "parent"]);
        scheduler.shutdown();
    }

    #[test]
    fn a_dependency_error_prevents_the_parent_from_running() {
        let scheduler = TaskScheduler::new(1).unwrap();
        let log = Arc::new(StdMutex::new(Vec::new()));

        struct FailingChild;
        impl Task for FailingChild {
            fn run(&self, _cancel: &CancelToken) -> Result<()> {
                Err(StorageError::TransactionError("child failed".into()))
            }
        }

        struct ParentWithFailingChild {
            log: Arc<StdMutex<Vec<&'static str>>>,
        }
        impl Task for ParentWithFailingChild {
            fn run(&self, _cancel: &CancelToken) -> Result<()> {
                self.log.lock().unwrap().push("parent");
                Ok(())
            }
            fn dependencies(&self) -> Vec<Box<dyn Task>> {
                vec![Box::new(FailingChild)]
            }
        }

        let err = scheduler
            .submit_and_wait(ParentWithFailingChild { log: Arc::clone(&log) })
            .unwrap_err();
        assert!(matches!(err, StorageError::TransactionError(_)));
        assert!(log.lock().unwrap().is_empty(), "parent must not run after a dependency fails");
        scheduler.shutdown();
    }

    #[test]
    fn cancel_is_observed_at_the_next_morsel_boundary() {
        let scheduler = TaskScheduler::new(1).unwrap();
        let handle = scheduler.submit(|cancel: &CancelToken| {
            for _ in 0..1000 {
                cancel.check()?;
                std::thread::yield_now();
            }
            Ok(())
        });
        handle.cancel();
        assert!(matches!(handle.wait(), Err(StorageError::Interrupted)));
        scheduler.shutdown();
    }
}
