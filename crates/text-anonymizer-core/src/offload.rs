//! Offload host: runs the pipeline on a single-use worker and relays progress
//! and the result back to an async caller.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::AnonymizeError;
use crate::options::AnonymizeOptions;
use crate::pipeline::{AnonymizeResult, Pipeline, Progress, RunControl};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Where offloaded jobs run. Each call must get a fresh execution context.
pub trait Executor: Send + Sync {
    fn execute(&self, name: String, job: Job) -> Result<(), AnonymizeError>;
}

/// Runs every job on its own named OS thread, which exits with the job.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadExecutor;

impl Executor for ThreadExecutor {
    fn execute(&self, name: String, job: Job) -> Result<(), AnonymizeError> {
        std::thread::Builder::new()
            .name(name.clone())
            .spawn(job)
            .map(|_| ())
            .map_err(|e| AnonymizeError::worker(format!("failed to start worker '{}'", name)).with_details(e.to_string()))
    }
}

enum WorkerMessage {
    Progress(Progress),
    Done(Result<AnonymizeResult, AnonymizeError>),
}

/// Cloneable handle that aborts a submitted task.
#[derive(Clone)]
pub struct Terminator {
    cancel: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Terminator {
    fn new() -> Self {
        Self {
            cancel: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// The waiter resolves to a terminated `WORKER_ERROR`; the worker stops at
    /// its next stage boundary. Any partial output is discarded.
    pub fn terminate(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_terminated(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// A submitted anonymization job.
pub struct OffloadTask {
    id: Uuid,
    rx: mpsc::UnboundedReceiver<WorkerMessage>,
    terminator: Terminator,
}

impl OffloadTask {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn terminator(&self) -> Terminator {
        self.terminator.clone()
    }

    /// Waits for the result, forwarding progress events as they arrive.
    pub async fn wait<F>(mut self, mut on_progress: F) -> Result<AnonymizeResult, AnonymizeError>
    where
        F: FnMut(Progress),
    {
        loop {
            if self.terminator.is_terminated() {
                info!("Offload task {} terminated", self.id);
                return Err(AnonymizeError::terminated());
            }

            tokio::select! {
                biased;
                _ = self.terminator.notify.notified() => continue,
                message = self.rx.recv() => match message {
                    Some(WorkerMessage::Progress(progress)) => on_progress(progress),
                    Some(WorkerMessage::Done(result)) => {
                        debug!("Offload task {} delivered its result", self.id);
                        return result;
                    }
                    None => {
                        error!("Offload task {} worker exited without a result", self.id);
                        return Err(AnonymizeError::worker("worker exited without delivering a result"));
                    }
                },
            }
        }
    }
}

impl Drop for OffloadTask {
    fn drop(&mut self) {
        // Lets an abandoned worker stop early.
        self.terminator.cancel.store(true, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct OffloadHost {
    pipeline: Arc<Pipeline>,
    executor: Arc<dyn Executor>,
    defaults: AnonymizeOptions,
}

impl Default for OffloadHost {
    fn default() -> Self {
        Self::new(Arc::new(Pipeline::default()))
    }
}

impl OffloadHost {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            pipeline,
            executor: Arc::new(ThreadExecutor),
            defaults: AnonymizeOptions::default(),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    /// Option flags applied beneath every caller's own flags.
    pub fn with_default_options(mut self, defaults: AnonymizeOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn submit(&self, text: impl Into<String>, options: AnonymizeOptions) -> Result<OffloadTask, AnonymizeError> {
        let text = text.into();
        let resolved = options.layered_over(self.defaults).resolve();
        let id = Uuid::new_v4();
        let terminator = Terminator::new();
        let (tx, rx) = mpsc::unbounded_channel();

        let pipeline = Arc::clone(&self.pipeline);
        let cancel = Arc::clone(&terminator.cancel);
        let job: Job = Box::new(move || {
            let progress_tx = tx.clone();
            let mut forward = move |progress: Progress| {
                let _ = progress_tx.send(WorkerMessage::Progress(progress));
            };

            let outcome = catch_unwind(AssertUnwindSafe(|| {
                let control = RunControl {
                    cancel: Some(cancel.as_ref()),
                    on_progress: Some(&mut forward),
                };
                pipeline.run(&text, &resolved, control)
            }));

            let result = outcome.unwrap_or_else(|payload| Err(panic_to_error(payload)));
            if tx.send(WorkerMessage::Done(result)).is_err() {
                debug!("Offload task {} finished after its caller went away", id);
            }
        });

        let short_id = id.simple().to_string();
        self.executor
            .execute(format!("anonymize-worker-{}", &short_id[..8]), job)?;
        info!("Submitted offload task {}", id);

        Ok(OffloadTask { id, rx, terminator })
    }
}

fn panic_to_error(payload: Box<dyn std::any::Any + Send>) -> AnonymizeError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());

    warn!("Anonymization worker panicked: {}", message);
    AnonymizeError::worker(format!("worker panicked: {}", message))
}

/// Runs the pipeline off the calling thread and returns the anonymized text.
pub async fn anonymize_async<F>(
    text: impl Into<String>,
    options: AnonymizeOptions,
    on_progress: F,
) -> Result<String, AnonymizeError>
where
    F: FnMut(Progress),
{
    let task = OffloadHost::default().submit(text, options)?;
    Ok(task.wait(on_progress).await?.text)
}
