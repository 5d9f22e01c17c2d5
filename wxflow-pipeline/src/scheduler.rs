//! Task schedulers that sources submit their computations to.
//!
//! The core never waits on a result. A source wraps "compute, store, emit a
//! completion" into one task and hands it to a [`Scheduler`]; when and where
//! it runs is the scheduler's business.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::watch;
use wxflow_core::{SchedulerConfig, SourceError, WxflowResult};

/// Name of the multi-threaded scheduler registered by the pipeline context.
pub const MULTI_THREAD: &str = "MultiThread";

/// Name of the inline scheduler registered by the pipeline context.
pub const SINGLE_THREAD: &str = "SingleThread";

/// A unit of work submitted by a source.
pub type Task = BoxFuture<'static, ()>;

/// Executes source tasks.
pub trait Scheduler: Send + Sync {
    fn name(&self) -> &str;

    /// Run `task` eventually. Never blocks waiting for other tasks.
    fn schedule(&self, task: Task);

    /// Whether any task is currently running.
    fn is_busy(&self) -> bool;

    /// Watch channel flipping to `true` when the scheduler starts processing
    /// and back to `false` once it is idle.
    fn busy_updates(&self) -> watch::Receiver<bool>;
}

// ============================================================================
// ACTIVITY TRACKING
// ============================================================================

struct Activity {
    running: AtomicUsize,
    busy: watch::Sender<bool>,
}

impl Activity {
    fn new() -> Arc<Self> {
        let (busy, _) = watch::channel(false);
        Arc::new(Self {
            running: AtomicUsize::new(0),
            busy,
        })
    }

    fn start(self: &Arc<Self>) -> ActivityGuard {
        if self.running.fetch_add(1, Ordering::AcqRel) == 0 {
            self.busy.send_replace(true);
        }
        ActivityGuard {
            activity: Arc::clone(self),
        }
    }

    fn is_busy(&self) -> bool {
        self.running.load(Ordering::Acquire) > 0
    }
}

/// Decrements the running count when a task ends, including by panic.
struct ActivityGuard {
    activity: Arc<Activity>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        if self.activity.running.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.activity.busy.send_replace(false);
        }
    }
}

// ============================================================================
// WORKER SCHEDULER
// ============================================================================

/// Runs tasks on a multi-threaded tokio runtime.
pub struct WorkerScheduler {
    name: String,
    handle: Handle,
    /// Present when the scheduler owns its runtime.
    runtime: Option<Runtime>,
    activity: Arc<Activity>,
}

impl WorkerScheduler {
    /// Build a scheduler with its own worker runtime.
    pub fn new(name: impl Into<String>, config: &SchedulerConfig) -> WxflowResult<Self> {
        let name = name.into();
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .thread_name(config.thread_name.clone())
            .enable_all()
            .build()
            .map_err(|e| SourceError::SchedulerUnavailable {
                scheduler: name.clone(),
                reason: e.to_string(),
            })?;
        tracing::debug!(
            scheduler = %name,
            worker_threads = config.worker_threads,
            "Worker scheduler started"
        );
        Ok(Self {
            name,
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
            activity: Activity::new(),
        })
    }

    /// Use an existing runtime, e.g. the one an application already runs on.
    pub fn from_handle(name: impl Into<String>, handle: Handle) -> Self {
        Self {
            name: name.into(),
            handle,
            runtime: None,
            activity: Activity::new(),
        }
    }

    /// Use the runtime of the calling context.
    pub fn current(name: impl Into<String>) -> WxflowResult<Self> {
        let name = name.into();
        let handle = Handle::try_current().map_err(|e| SourceError::SchedulerUnavailable {
            scheduler: name.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self::from_handle(name, handle))
    }

    pub fn active_tasks(&self) -> usize {
        self.activity.running.load(Ordering::Acquire)
    }
}

impl Scheduler for WorkerScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn schedule(&self, task: Task) {
        let guard = self.activity.start();
        tracing::trace!(scheduler = %self.name, "worker.spawn");
        self.handle.spawn(async move {
            let _guard = guard;
            task.await;
        });
    }

    fn is_busy(&self) -> bool {
        self.activity.is_busy()
    }

    fn busy_updates(&self) -> watch::Receiver<bool> {
        self.activity.busy.subscribe()
    }
}

impl Drop for WorkerScheduler {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for WorkerScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerScheduler")
            .field("name", &self.name)
            .field("owns_runtime", &self.runtime.is_some())
            .field("active_tasks", &self.active_tasks())
            .finish()
    }
}

// ============================================================================
// IMMEDIATE SCHEDULER
// ============================================================================

/// Runs each task to completion on the calling thread before `schedule`
/// returns.
///
/// Tasks must not depend on the caller's runtime making progress while they
/// run; source tasks only await other source computations, which this
/// scheduler also runs inline.
pub struct ImmediateScheduler {
    name: String,
    activity: Arc<Activity>,
}

impl ImmediateScheduler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            activity: Activity::new(),
        }
    }
}

impl Default for ImmediateScheduler {
    fn default() -> Self {
        Self::new(SINGLE_THREAD)
    }
}

impl Scheduler for ImmediateScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn schedule(&self, task: Task) {
        let _guard = self.activity.start();
        tracing::trace!(scheduler = %self.name, "inline.run");
        futures::executor::block_on(task);
    }

    fn is_busy(&self) -> bool {
        self.activity.is_busy()
    }

    fn busy_updates(&self) -> watch::Receiver<bool> {
        self.activity.busy.subscribe()
    }
}

impl std::fmt::Debug for ImmediateScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImmediateScheduler")
            .field("name", &self.name)
            .finish()
    }
}
