//! Bounded-concurrency task execution with fail-fast cancellation.
//!
//! Every multi-step provisioning flow (per-registry setup, per-node
//! configuration) submits its independent steps to a [`ParallelExecutor`].
//! Tasks receive a [`CancellationToken`] and are expected to poll it; the
//! executor never aborts running work.

use std::io::{self, Write};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Error, Result};

/// Lower bound for the computed default concurrency
pub const MIN_DEFAULT_CONCURRENCY: usize = 2;

/// Upper bound for the computed default concurrency
pub const MAX_DEFAULT_CONCURRENCY: usize = 8;

/// A unit of cancellation-aware work.
pub type Task = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<()>> + Send>;

/// Box an async closure into a [`Task`].
pub fn task<F, Fut>(f: F) -> Task
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    Box::new(move |token| Box::pin(f(token)))
}

/// Default concurrency: available parallelism clamped to [2, 8].
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(MIN_DEFAULT_CONCURRENCY)
        .clamp(MIN_DEFAULT_CONCURRENCY, MAX_DEFAULT_CONCURRENCY)
}

/// Runs independent tasks under a concurrency ceiling.
#[derive(Clone, Debug)]
pub struct ParallelExecutor {
    max_concurrency: usize,
}

impl Default for ParallelExecutor {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ParallelExecutor {
    /// Create an executor. Zero selects [`default_concurrency`].
    pub fn new(max_concurrency: usize) -> Self {
        let max_concurrency = if max_concurrency == 0 {
            default_concurrency()
        } else {
            max_concurrency
        };
        Self { max_concurrency }
    }

    /// Effective concurrency ceiling
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Run `tasks`, returning the first error observed.
    ///
    /// - no tasks: returns `Ok(())` immediately
    /// - one task: awaited inline with `cancel`, its result returned unmodified
    /// - two or more: run on a worker pool sharing a child of `cancel`; the
    ///   first failure cancels that child token and is returned wrapped in
    ///   [`Error::Parallel`]. Tasks not yet started when the scope is
    ///   cancelled are skipped; if that happens without a task failing, the
    ///   caller cancelled and [`Error::TaskAborted`] is returned.
    pub async fn execute(&self, cancel: &CancellationToken, mut tasks: Vec<Task>) -> Result<()> {
        match tasks.len() {
            0 => return Ok(()),
            1 => {
                if let Some(only) = tasks.pop() {
                    return only(cancel.clone()).await;
                }
                return Ok(());
            }
            _ => {}
        }

        let total = tasks.len();
        let scope = cancel.child_token();
        let slots = Arc::new(Semaphore::new(self.max_concurrency));
        let first_error: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));
        let mut running = JoinSet::new();
        let mut skipped = 0;

        for (index, work) in tasks.into_iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = scope.cancelled() => None,
                permit = slots.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                skipped = total - index;
                debug!(skipped, "Scope cancelled, not starting remaining tasks");
                break;
            };

            let scope = scope.clone();
            let first_error = first_error.clone();
            running.spawn(async move {
                let outcome = work(scope.clone()).await;
                drop(permit);
                if let Err(e) = outcome {
                    record_first(&first_error, e);
                    scope.cancel();
                }
            });
        }

        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                record_first(
                    &first_error,
                    Error::TaskAborted {
                        message: e.to_string(),
                    },
                );
                scope.cancel();
            }
        }

        let first = first_error.lock().take();
        match first {
            Some(e) => Err(e.parallel()),
            // Only the caller can have cancelled the scope
            None if skipped > 0 => Err(Error::TaskAborted {
                message: format!("{skipped} of {total} tasks not started: cancelled"),
            }
            .parallel()),
            None => Ok(()),
        }
    }
}

fn record_first(slot: &Mutex<Option<Error>>, err: Error) {
    let mut slot = slot.lock();
    if slot.is_none() {
        *slot = Some(err);
    } else {
        debug!(error = %err, "Discarding error after first failure");
    }
}

/// Serializes writes from concurrent tasks onto one sink.
///
/// Each `write` call reaches the sink as one unit; writes from different
/// tasks never interleave mid-call.
#[derive(Debug)]
pub struct SyncWriter<W> {
    inner: Mutex<W>,
}

impl<W: Write> SyncWriter<W> {
    /// Wrap a sink
    pub fn new(inner: W) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Write one line (content plus newline) atomically.
    pub fn write_line(&self, line: &str) -> io::Result<()> {
        let mut inner = self.inner.lock();
        inner.write_all(line.as_bytes())?;
        inner.write_all(b"\n")
    }

    /// Recover the sink
    pub fn into_inner(self) -> W {
        self.inner.into_inner()
    }
}

impl<W: Write> Write for &SyncWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().flush()
    }
}

/// Thread-safe collector of task values and errors.
///
/// Entries appear in completion order, not submission order.
#[derive(Debug)]
pub struct Results<T> {
    inner: Mutex<Collected<T>>,
}

#[derive(Debug)]
struct Collected<T> {
    values: Vec<T>,
    errors: Vec<Arc<Error>>,
}

impl<T> Default for Results<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Collected {
                values: Vec::new(),
                errors: Vec::new(),
            }),
        }
    }
}

impl<T> Results<T> {
    /// Create an empty collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a value
    pub fn add(&self, value: T) {
        self.inner.lock().values.push(value);
    }

    /// Record an error
    pub fn add_error(&self, err: Error) {
        self.inner.lock().errors.push(Arc::new(err));
    }

    /// Snapshot of recorded errors
    pub fn errors(&self) -> Vec<Arc<Error>> {
        self.inner.lock().errors.clone()
    }

    /// Whether any error was recorded
    pub fn has_errors(&self) -> bool {
        !self.inner.lock().errors.is_empty()
    }

    /// Consume the collector, returning values and errors
    pub fn into_parts(self) -> (Vec<T>, Vec<Arc<Error>>) {
        let collected = self.inner.into_inner();
        (collected.values, collected.errors)
    }
}

impl<T: Clone> Results<T> {
    /// Snapshot of recorded values
    pub fn values(&self) -> Vec<T> {
        self.inner.lock().values.clone()
    }
}
