//! Bounded dispatcher running work on dedicated worker threads.
//!
//! Each worker is an OS thread driving its own single-threaded tokio runtime, so
//! a worker blocked on a broker round trip never competes with the caller's
//! runtime. Work is taken from one shared FIFO queue; at most
//! `degree_of_parallelism` items execute at any instant.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::JoinHandle;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use uuid::Uuid;

use crate::context::{CorrelationStore, ExecutionContext, CONTEXT_ID};
use crate::error::{PipelineFault, RetryError};

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Sizing for a [`Dispatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    degree_of_parallelism: usize,
}

impl DispatcherConfig {
    /// Fails when `degree_of_parallelism` is zero.
    pub fn new(degree_of_parallelism: usize) -> Result<Self, RetryError> {
        if degree_of_parallelism == 0 {
            return Err("degree of parallelism must be at least 1".into());
        }
        Ok(Self { degree_of_parallelism })
    }

    pub fn degree_of_parallelism(&self) -> usize {
        self.degree_of_parallelism
    }
}

struct Shared {
    accepting: AtomicBool,
    active: AtomicUsize,
    peak: AtomicUsize,
    faults: watch::Sender<Option<PipelineFault>>,
}

impl Shared {
    fn begin(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn end(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// Keeps the first fault only and stops intake.
    fn record_fault(&self, fault: &PipelineFault) {
        self.accepting.store(false, Ordering::SeqCst);
        let first = self.faults.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(fault.clone());
                true
            } else {
                false
            }
        });
        if first {
            log::error!("[ContextId={}] Retry pipeline faulted, no further work accepted: {}", fault.correlation_id, fault.reason);
        }
    }
}

/// Resolves when a submitted work item has finished.
#[must_use = "a completion does nothing unless awaited"]
pub struct Completion<T> {
    receiver: oneshot::Receiver<Result<T, PipelineFault>>,
}

impl<T> Future for Completion<T> {
    type Output = Result<T, PipelineFault>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(PipelineFault::new("unknown", "work item was dropped before it completed"))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Fixed-size pool of dedicated workers.
///
/// Dropping the dispatcher stops intake, drains the queue and joins every worker.
pub struct Dispatcher {
    config: DispatcherConfig,
    sender: Option<mpsc::UnboundedSender<Job>>,
    workers: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
    store: Arc<CorrelationStore>,
}

impl Dispatcher {
    /// Spawns `degree_of_parallelism` workers. If any worker fails to start, the
    /// ones already running are shut down before the error is returned.
    pub fn start(config: DispatcherConfig, store: Arc<CorrelationStore>) -> Result<Self, RetryError> {
        let (sender, receiver) = mpsc::unbounded_channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let (faults, _) = watch::channel(None);

        let mut dispatcher = Self {
            config,
            sender: Some(sender),
            workers: Vec::with_capacity(config.degree_of_parallelism),
            shared: Arc::new(Shared {
                accepting: AtomicBool::new(true),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                faults,
            }),
            store,
        };

        for index in 0..config.degree_of_parallelism {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
            let receiver = Arc::clone(&receiver);
            let handle = std::thread::Builder::new()
                .name(format!("retry-worker-{}", index))
                .spawn(move || run_worker(runtime, receiver))?;
            dispatcher.workers.push(handle);
        }

        log::info!("Dispatcher started with {} dedicated workers", config.degree_of_parallelism);
        Ok(dispatcher)
    }

    pub fn config(&self) -> DispatcherConfig {
        self.config
    }

    pub fn store(&self) -> &Arc<CorrelationStore> {
        &self.store
    }

    /// Queues `work` in a fresh execution context with its own correlation id.
    pub fn submit<T, F, Fut>(&self, work: F) -> Result<Completion<T>, RetryError>
    where
        T: Send + 'static,
        F: FnOnce(ExecutionContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, RetryError>> + Send + 'static,
    {
        self.submit_with_context(self.store.execution(), work)
    }

    /// Queues `work` inside an existing logical operation. The operation's
    /// previous correlation id is restored once the work finishes, whether it
    /// succeeded, failed or panicked.
    pub fn submit_with_context<T, F, Fut>(&self, context: ExecutionContext, work: F) -> Result<Completion<T>, RetryError>
    where
        T: Send + 'static,
        F: FnOnce(ExecutionContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, RetryError>> + Send + 'static,
    {
        if !self.shared.accepting.load(Ordering::SeqCst) {
            return Err(RetryError::PipelineStopped);
        }
        let sender = self.sender.as_ref().ok_or(RetryError::PipelineStopped)?;

        let (tx, rx) = oneshot::channel();
        let shared = Arc::clone(&self.shared);
        let job: Job = Box::new(move || {
            async move {
                let correlation_id = Uuid::new_v4().to_string();
                let scope = context.scope(CONTEXT_ID, correlation_id.clone());

                shared.begin();
                let inner = context.clone();
                let result = AssertUnwindSafe(async move { work(inner).await }).catch_unwind().await;
                shared.end();
                drop(scope);

                let outcome = match result {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(PipelineFault::new(&correlation_id, e.to_string())),
                    Err(panic) => Err(PipelineFault::new(&correlation_id, panic_message(panic))),
                };
                if let Err(ref fault) = outcome {
                    shared.record_fault(fault);
                }
                // The submitter may have stopped waiting.
                let _ = tx.send(outcome);
            }
            .boxed()
        });

        sender.send(job).map_err(|_| RetryError::PipelineStopped)?;
        Ok(Completion { receiver: rx })
    }

    /// Watches for the first pipeline fault.
    pub fn faults(&self) -> watch::Receiver<Option<PipelineFault>> {
        self.shared.faults.subscribe()
    }

    pub fn fault(&self) -> Option<PipelineFault> {
        self.shared.faults.borrow().clone()
    }

    pub fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::SeqCst) && self.sender.is_some()
    }

    /// Work items executing right now.
    pub fn active(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Highest number of work items ever executing at once.
    pub fn peak_concurrency(&self) -> usize {
        self.shared.peak.load(Ordering::SeqCst)
    }

    /// Stops intake, lets queued and in-flight work finish, then joins the workers.
    pub async fn shutdown(mut self) -> Result<(), RetryError> {
        self.close();
        let workers = std::mem::take(&mut self.workers);
        tokio::task::spawn_blocking(move || join_workers(workers))
            .await
            .map_err(|e| RetryError::from(format!("failed to join dispatcher workers: {}", e)))?;
        log::info!("Dispatcher shut down");
        Ok(())
    }

    fn close(&mut self) {
        self.shared.accepting.store(false, Ordering::SeqCst);
        self.sender.take();
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.close();
        join_workers(std::mem::take(&mut self.workers));
    }
}

fn run_worker(runtime: Runtime, receiver: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>) {
    loop {
        let job = runtime.block_on(async {
            let mut receiver = receiver.lock().await;
            receiver.recv().await
        });
        match job {
            Some(job) => runtime.block_on(job()),
            None => break,
        }
    }
}

fn join_workers(workers: Vec<JoinHandle<()>>) {
    for worker in workers {
        if worker.join().is_err() {
            log::error!("A dispatcher worker thread panicked");
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("work item panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("work item panicked: {}", s)
    } else {
        "work item panicked".to_string()
    }
}
