//! Cooperative shutdown primitives: the crate-wide stop signal and a
//! small supervisor that owns the long-running tasks of a process.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, Notify};

use crate::error::Result;
use crate::logger::{LogLevel, Logger};

/// How long [`Supervisor::start`] waits for tasks to return after
/// shutdown is requested before abandoning them.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Shared cancellation flag with a wakeup.
///
/// Cloning yields another handle onto the same signal. Once triggered a
/// signal stays triggered.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<SignalState>,
}

#[derive(Default)]
struct SignalState {
    triggered: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        ShutdownSignal::default()
    }

    /// Request shutdown and wake every waiter.
    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Resolve once the signal has been triggered, immediately if it
    /// already was.
    pub async fn triggered(&self) {
        while !self.is_triggered() {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register the waiter before re-checking the flag, otherwise
            // a trigger landing in between is lost.
            notified.as_mut().enable();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

type TaskFn = Box<dyn FnOnce(ShutdownSignal) -> BoxFuture<'static, Result<()>> + Send>;

/// Owns a set of named long-running tasks and drives their orderly
/// shutdown.
///
/// Tasks receive a [`ShutdownSignal`] and are expected to return soon
/// after it fires. [`start`](Supervisor::start) blocks until shutdown is
/// requested (via [`shutdown`](Supervisor::shutdown), Ctrl-C, or the
/// first task failure) and then waits a bounded grace period for the
/// remaining tasks; stragglers are abandoned.
pub struct Supervisor {
    tasks: Mutex<Vec<(String, TaskFn)>>,
    stop: ShutdownSignal,
    grace: Duration,
    logger: Logger,
}

impl Default for Supervisor {
    fn default() -> Self {
        Supervisor::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Supervisor {
            tasks: Mutex::new(Vec::new()),
            stop: ShutdownSignal::new(),
            grace: DEFAULT_SHUTDOWN_GRACE,
            logger: crate::logger::noop(),
        }
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    /// Register a task to be launched by [`start`](Supervisor::start).
    pub fn add_runner<F, Fut>(&self, name: impl Into<String>, runner: F)
    where
        F: FnOnce(ShutdownSignal) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let task: TaskFn = Box::new(move |signal| Box::pin(runner(signal)));
        self.tasks.lock().expect("supervisor tasks lock").push((name.into(), task));
    }

    /// Request shutdown of every running task. Safe to call from
    /// anywhere, including from inside a message handler.
    pub fn shutdown(&self) {
        self.stop.trigger();
    }

    /// Launch all registered tasks and block until they have shut down.
    /// Returns the first task error, if any.
    pub async fn start(&self) -> Result<()> {
        let tasks: Vec<(String, TaskFn)> = self
            .tasks
            .lock()
            .expect("supervisor tasks lock")
            .drain(..)
            .collect();

        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let mut running = 0usize;
        for (name, task) in tasks {
            let signal = self.stop.clone();
            let done = done_tx.clone();
            running += 1;
            tokio::spawn(async move {
                let result = task(signal).await;
                let _ = done.send((name, result));
            });
        }
        drop(done_tx);

        {
            let stop = self.stop.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    stop.trigger();
                }
            });
        }

        let mut first_error = None;
        while running > 0 && !self.stop.is_triggered() {
            tokio::select! {
                _ = self.stop.triggered() => break,
                finished = done_rx.recv() => match finished {
                    Some((name, result)) => {
                        running -= 1;
                        self.reap(&name, result, &mut first_error);
                    }
                    None => break,
                },
            }
        }
        self.stop.trigger();

        let grace = tokio::time::sleep(self.grace);
        tokio::pin!(grace);
        while running > 0 {
            tokio::select! {
                _ = &mut grace => {
                    self.log(
                        LogLevel::Error,
                        &format!("shutdown grace elapsed, abandoning {running} task(s)"),
                    );
                    break;
                }
                finished = done_rx.recv() => match finished {
                    Some((name, result)) => {
                        running -= 1;
                        self.reap(&name, result, &mut first_error);
                    }
                    None => break,
                },
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn reap(&self, name: &str, result: Result<()>, first_error: &mut Option<crate::ConsumerError>) {
        match result {
            Ok(()) => self.log(LogLevel::Debug, &format!("task {name} finished")),
            Err(err) => {
                self.log(LogLevel::Error, &format!("task {name} failed: {err}"));
                if first_error.is_none() {
                    *first_error = Some(err);
                }
                // One failed task brings the process down.
                self.stop.trigger();
            }
        }
    }

    fn log(&self, level: LogLevel, message: &str) {
        (self.logger)(level, &[("component", "supervisor")], message);
    }
}
