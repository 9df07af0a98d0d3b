//! Worker runtime: executes user evaluation code and reports results back
//! to the master asynchronously.
//!
//! A worker is a small actor: it owns a dispatch channel, runs each job's
//! evaluation on the blocking thread pool, and pushes a completion (or a
//! failure notice) to the master's channel. An evaluation error or panic
//! never takes the worker down.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use hb_types::{Configuration, EvaluationError, HbResult, Job, JobId};

use crate::registry::NameRegistry;

/// What the evaluation function hands back for one (config, budget) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalOutcome {
    pub loss: f64,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl EvalOutcome {
    pub fn from_loss(loss: f64) -> Self {
        Self {
            loss,
            metadata: HashMap::new(),
        }
    }
}

/// User evaluation callable. Must be safe to invoke concurrently from
/// multiple workers with different configurations.
pub type EvalFn = Arc<dyn Fn(&Configuration, f64) -> Result<EvalOutcome, String> + Send + Sync>;

/// Master-to-worker control messages.
#[derive(Debug)]
pub enum WorkerCommand {
    Dispatch(Box<Job>),
    Stop,
}

/// Worker-to-master completion notice. `outcome` carries the failure
/// classification when the user callable returned an error, panicked, or
/// produced a non-finite loss.
#[derive(Debug)]
pub struct CompletionMsg {
    pub job_id: JobId,
    pub worker_id: String,
    pub outcome: Result<EvalOutcome, EvaluationError>,
}

/// How a worker executes jobs relative to its accept loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyMode {
    /// Each job runs on the blocking thread pool; the accept loop stays
    /// responsive and up to `capacity` jobs run in parallel.
    Thread,
    /// Jobs run one at a time on the accept loop itself. Control messages
    /// wait behind the running job.
    Inline,
}

/// Handle to a spawned worker: its dispatch channel and join handle.
pub struct WorkerRuntime {
    pub worker_id: String,
    pub address: String,
    pub dispatch_tx: mpsc::UnboundedSender<WorkerCommand>,
    pub handle: JoinHandle<()>,
}

impl WorkerRuntime {
    /// Ask the worker to stop. Safe to call more than once.
    pub fn stop(&self) {
        let _ = self.dispatch_tx.send(WorkerCommand::Stop);
    }
}

/// A worker process-equivalent, scoped to one run.
pub struct Worker {
    run_id: String,
    worker_id: String,
    capacity: usize,
    grace_period: Duration,
    eval_fn: Option<EvalFn>,
}

impl Worker {
    pub fn new(run_id: impl Into<String>, worker_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            run_id: run_id.into(),
            worker_id: worker_id.into(),
            capacity: capacity.max(1),
            grace_period: Duration::from_secs(5),
            eval_fn: None,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Bind the user evaluation callable. Does not execute it.
    pub fn initialize(&mut self, eval_fn: EvalFn) {
        self.eval_fn = Some(eval_fn);
    }

    /// In-process address under which this worker registers.
    pub fn address(&self) -> String {
        format!("inproc://{}/{}", self.run_id, self.worker_id)
    }

    /// Spawn the accept loop and return its runtime handle.
    ///
    /// With `asynchronous = false` jobs are executed inline regardless of
    /// `mode`, so one job blocks acceptance of the next command. On `Stop`
    /// the worker waits up to its grace period for in-flight jobs, then
    /// deregisters from `registry` (when given) and exits.
    pub fn run(
        self,
        asynchronous: bool,
        mode: ConcurrencyMode,
        completion_tx: mpsc::UnboundedSender<CompletionMsg>,
        registry: Option<Arc<NameRegistry>>,
    ) -> HbResult<WorkerRuntime> {
        let eval_fn = self
            .eval_fn
            .clone()
            .ok_or_else(|| hb_types::validation_error!(
                "worker {} has no evaluation function: call initialize() first",
                self.worker_id
            ))?;

        let (dispatch_tx, mut dispatch_rx) = mpsc::unbounded_channel();
        let worker_id = self.worker_id.clone();
        let address = self.address();
        let capacity = self.capacity;
        let grace_period = self.grace_period;
        let inline = !asynchronous || mode == ConcurrencyMode::Inline;

        let handle = tokio::spawn(async move {
            let slots = Arc::new(Semaphore::new(capacity));
            info!(worker = %worker_id, capacity, inline, "worker started");

            while let Some(command) = dispatch_rx.recv().await {
                match command {
                    WorkerCommand::Dispatch(job) => {
                        if inline {
                            let msg = evaluate(&eval_fn, &worker_id, &job).await;
                            let _ = completion_tx.send(msg);
                        } else {
                            // The permit is acquired inside the task so a
                            // full worker still accepts control messages.
                            let slots = slots.clone();
                            let eval_fn = eval_fn.clone();
                            let completion_tx = completion_tx.clone();
                            let worker_id = worker_id.clone();
                            tokio::spawn(async move {
                                let Ok(permit) = slots.acquire_owned().await else {
                                    return;
                                };
                                let msg = evaluate(&eval_fn, &worker_id, &job).await;
                                drop(permit);
                                let _ = completion_tx.send(msg);
                            });
                        }
                    }
                    WorkerCommand::Stop => {
                        debug!(worker = %worker_id, "stop received");
                        break;
                    }
                }
            }

            // Grace period: wait for in-flight jobs by draining all slots.
            let all_done = slots.acquire_many(capacity as u32);
            if tokio::time::timeout(grace_period, all_done).await.is_err() {
                warn!(worker = %worker_id, "grace period expired, abandoning in-flight jobs");
            }

            if let Some(registry) = registry {
                registry.deregister(&worker_id);
            }
            info!(worker = %worker_id, "worker stopped");
        });

        Ok(WorkerRuntime {
            worker_id: self.worker_id,
            address,
            dispatch_tx,
            handle,
        })
    }
}

/// Run the user callable on the blocking pool, converting errors, panics,
/// and non-finite losses into failure notices.
async fn evaluate(eval_fn: &EvalFn, worker_id: &str, job: &Job) -> CompletionMsg {
    let eval_fn = eval_fn.clone();
    let config = job.config.clone();
    let budget = job.budget;

    let joined = tokio::task::spawn_blocking(move || {
        catch_unwind(AssertUnwindSafe(|| eval_fn(&config, budget)))
    })
    .await;

    let outcome = match joined {
        Ok(Ok(Ok(outcome))) if outcome.loss.is_finite() => Ok(outcome),
        Ok(Ok(Ok(outcome))) => Err(EvaluationError::InvalidResult {
            message: format!("non-finite loss {}", outcome.loss),
        }),
        Ok(Ok(Err(message))) => Err(EvaluationError::Raised { message }),
        Ok(Err(panic)) => Err(EvaluationError::Panicked {
            message: panic_message(&panic),
        }),
        Err(join_err) => Err(EvaluationError::Panicked {
            message: format!("evaluation task failed: {join_err}"),
        }),
    };

    if let Err(ref error) = outcome {
        warn!(worker = %worker_id, job = %job.id, error = %error, "evaluation failed");
    }

    CompletionMsg {
        job_id: job.id,
        worker_id: worker_id.to_string(),
        outcome,
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
