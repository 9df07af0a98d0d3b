//! Job tracking: the unit of work dispatched from master to worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::params::SharedConfiguration;

/// Unique job identifier, assigned at creation time.
pub type JobId = Uuid;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Dispatched,
    Completed,
    Failed,
}

/// Provenance of the configuration carried by a job. Informational only:
/// never consulted by scheduling decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOrigin {
    /// Proposed by the optimizer's fitted model.
    ModelSampled,
    /// Random draw (cold-start phase of the optimizer).
    RandomInit,
    /// Replayed from a previous run's history.
    WarmStart,
    /// Survivor of a lower rung, resubmitted at a higher budget.
    Promoted,
}

impl std::fmt::Display for JobOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ModelSampled => "model-sampled",
            Self::RandomInit => "random",
            Self::WarmStart => "warm-start",
            Self::Promoted => "promoted",
        };
        write!(f, "{name}")
    }
}

/// Result of a completed evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub loss: f64,
    /// Extra keys returned by the evaluation function, passed through
    /// untouched.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl JobResult {
    pub fn from_loss(loss: f64) -> Self {
        Self {
            loss,
            metadata: HashMap::new(),
        }
    }
}

/// A single unit of work: one configuration evaluated at one budget.
///
/// Jobs are created and mutated only by the master; status and result
/// transitions happen strictly in response to worker callbacks. The budget
/// is fixed at creation and never changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Creation order within the run. Promotion ties are broken by this
    /// sequence number, earlier job wins.
    pub seq: u64,
    pub config: SharedConfiguration,
    pub budget: f64,
    pub status: JobStatus,
    pub result: Option<JobResult>,
    pub origin: JobOrigin,
    pub worker_id: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(seq: u64, config: SharedConfiguration, budget: f64, origin: JobOrigin) -> Self {
        Self {
            id: Uuid::new_v4(),
            seq,
            config,
            budget,
            status: JobStatus::Queued,
            result: None,
            origin,
            worker_id: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Record hand-off to a worker. A job is dispatched to exactly one
    /// worker at a time.
    pub fn mark_dispatched(&mut self, worker_id: String) {
        debug_assert_ne!(self.status, JobStatus::Dispatched, "job dispatched twice");
        self.status = JobStatus::Dispatched;
        self.started_at = Some(Utc::now());
        self.worker_id = Some(worker_id);
    }

    /// Record successful completion. The result is populated exactly once.
    pub fn mark_completed(&mut self, result: JobResult) {
        debug_assert!(self.result.is_none(), "job completed twice");
        self.status = JobStatus::Completed;
        self.finished_at = Some(Utc::now());
        self.result = Some(result);
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = JobStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
    }

    /// Loss of a completed job, if any.
    pub fn loss(&self) -> Option<f64> {
        self.result.as_ref().map(|r| r.loss)
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.status, JobStatus::Completed | JobStatus::Failed)
    }
}
