//! The master: turns an abstract iteration plan into concrete dispatch
//! decisions and drives the optimizer through ask/tell.
//!
//! The master is a single-threaded event consumer: one inbound completion
//! channel, one plain job table, no locks. Workers become eligible for
//! redispatch the moment their completion is observed, independent of the
//! rest of their rung — asynchronous successive halving, no per-rung
//! barrier.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use hb_space::Optimizer;
use hb_types::{
    HbResult, Job, JobId, JobOrigin, JobResult, RunError, RunHistory, RunResult,
    SharedConfiguration, TransportError,
};

use crate::iter::{Bracket, IterGenerator};
use crate::registry::{NameRegistry, WorkerState};
use crate::worker::{CompletionMsg, WorkerCommand};

/// Run-level knobs for the master.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub run_id: String,
    /// Global iteration budget: the number of top-level optimizer asks.
    /// Promotions do not count against it.
    pub n_iterations: usize,
    /// How long to wait for outstanding jobs once no new work can be
    /// issued. Expired jobs are marked failed.
    pub drain_timeout: Duration,
    /// Dispatch attempts per job before it degrades to a failure.
    pub max_dispatch_attempts: u32,
    /// Period of the worker liveness sweep.
    pub liveness_interval: Duration,
}

impl MasterConfig {
    pub fn new(run_id: impl Into<String>, n_iterations: usize) -> Self {
        Self {
            run_id: run_id.into(),
            n_iterations,
            drain_timeout: Duration::from_secs(60),
            max_dispatch_attempts: 3,
            liveness_interval: Duration::from_millis(500),
        }
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn with_max_dispatch_attempts(mut self, attempts: u32) -> Self {
        self.max_dispatch_attempts = attempts.max(1);
        self
    }
}

/// Master lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
    Bootstrapping,
    Dispatching,
    Draining,
    Terminated,
}

/// Master-local view of one worker.
struct WorkerLink {
    worker_id: String,
    capacity: usize,
    in_flight: usize,
    offline: bool,
    dispatch_tx: mpsc::UnboundedSender<WorkerCommand>,
}

impl WorkerLink {
    fn has_slot(&self) -> bool {
        !self.offline && self.in_flight < self.capacity
    }
}

/// Progress of one rung within an open bracket.
struct RungProgress {
    budget: f64,
    /// Jobs this rung will receive. For rung 0 this is the planned count
    /// (possibly clamped when the ask budget runs out); for higher rungs
    /// it is rewritten to the actual promotion count.
    target: usize,
    created: usize,
    completed: Vec<JobId>,
    failed: usize,
    /// Promoted configurations waiting to be turned into jobs.
    pending: VecDeque<SharedConfiguration>,
}

impl RungProgress {
    fn resolved(&self) -> bool {
        self.created == self.target
            && self.completed.len() + self.failed == self.target
            && self.pending.is_empty()
    }
}

struct BracketRun {
    index: usize,
    rungs: Vec<RungProgress>,
    /// Set when a rung promotes zero survivors: the rest of the bracket
    /// is abandoned.
    terminated: bool,
}

impl BracketRun {
    fn from_bracket(bracket: Bracket) -> Self {
        Self {
            index: bracket.index,
            rungs: bracket
                .rungs
                .into_iter()
                .map(|rung| RungProgress {
                    budget: rung.budget,
                    target: rung.n_configs,
                    created: 0,
                    completed: Vec::new(),
                    failed: 0,
                    pending: VecDeque::new(),
                })
                .collect(),
            terminated: false,
        }
    }

    fn is_done(&self) -> bool {
        self.terminated || self.rungs.iter().all(RungProgress::resolved)
    }
}

/// Sort completed rung entries into promotion order: ascending loss,
/// ties broken by creation order (earlier job wins).
fn promotion_sort<T>(entries: &mut [(f64, u64, T)]) {
    entries.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
}

/// The scheduling core for one run.
pub struct Master {
    config: MasterConfig,
    state: MasterState,
    optimizer: Box<dyn Optimizer>,
    generator: Box<dyn IterGenerator>,
    registry: Arc<NameRegistry>,
    completion_rx: mpsc::UnboundedReceiver<CompletionMsg>,
    workers: Vec<WorkerLink>,
    brackets: Vec<BracketRun>,
    jobs: HashMap<JobId, Job>,
    /// job -> (bracket slot, rung index) while the bracket is open.
    job_site: HashMap<JobId, (usize, usize)>,
    history: RunHistory,
    next_seq: u64,
    asks_used: usize,
    outstanding: usize,
    jobs_completed: usize,
    jobs_failed: usize,
    clamped: bool,
}

impl Master {
    pub fn new(
        config: MasterConfig,
        optimizer: Box<dyn Optimizer>,
        generator: Box<dyn IterGenerator>,
        registry: Arc<NameRegistry>,
        completion_rx: mpsc::UnboundedReceiver<CompletionMsg>,
    ) -> Self {
        Self {
            config,
            state: MasterState::Bootstrapping,
            optimizer,
            generator,
            registry,
            completion_rx,
            workers: Vec::new(),
            brackets: Vec::new(),
            jobs: HashMap::new(),
            job_site: HashMap::new(),
            history: RunHistory::new(),
            next_seq: 0,
            asks_used: 0,
            outstanding: 0,
            jobs_completed: 0,
            jobs_failed: 0,
            clamped: false,
        }
    }

    /// Run the dispatch loop to completion.
    pub async fn run(mut self) -> HbResult<RunResult> {
        self.bootstrap()?;
        self.state = MasterState::Dispatching;

        let drain_timeout = self.config.drain_timeout;
        let mut liveness = tokio::time::interval(self.config.liveness_interval);
        let mut drain_deadline: Option<tokio::time::Instant> = None;

        loop {
            self.fill_workers()?;
            if self.asks_used >= self.config.n_iterations {
                self.clamp_open_rungs()?;
                // Clamping can resolve rungs and queue promotions.
                self.fill_workers()?;
            }

            if self.outstanding == 0 {
                if self.has_dispatchable_work() {
                    warn!(
                        run_id = %self.config.run_id,
                        "no reachable workers remain, abandoning remaining work"
                    );
                }
                break;
            }

            let draining = self.asks_used >= self.config.n_iterations
                && !self.has_dispatchable_work();
            if draining {
                if self.state == MasterState::Dispatching {
                    self.state = MasterState::Draining;
                    info!(
                        run_id = %self.config.run_id,
                        outstanding = self.outstanding,
                        "draining: waiting for outstanding jobs"
                    );
                }
                // Pinned on entry: liveness ticks and completions must not
                // push the deadline back.
                if drain_deadline.is_none() {
                    drain_deadline = Some(tokio::time::Instant::now() + drain_timeout);
                }
            } else {
                if self.state == MasterState::Draining {
                    // A resolved rung queued promotions; back to dispatching.
                    self.state = MasterState::Dispatching;
                }
                drain_deadline = None;
            }
            let deadline = drain_deadline
                .unwrap_or_else(|| tokio::time::Instant::now() + drain_timeout);

            tokio::select! {
                maybe_msg = self.completion_rx.recv() => match maybe_msg {
                    Some(msg) => self.handle_completion(msg)?,
                    None => {
                        warn!(run_id = %self.config.run_id, "completion channel closed");
                        self.fail_outstanding("completion channel closed")?;
                        break;
                    }
                },
                _ = liveness.tick() => self.liveness_sweep()?,
                _ = tokio::time::sleep_until(deadline), if draining => {
                    warn!(
                        run_id = %self.config.run_id,
                        outstanding = self.outstanding,
                        "drain timeout expired, failing outstanding jobs"
                    );
                    self.fail_outstanding("drain timeout expired")?;
                    break;
                }
            }
        }

        self.finish()
    }

    // -- bootstrap ----------------------------------------------------------

    fn bootstrap(&mut self) -> HbResult<()> {
        let handles = self.registry.list_workers();
        if handles.is_empty() {
            return Err(hb_types::validation_error!(
                "no workers registered for run {}",
                self.config.run_id
            ));
        }
        self.workers = handles
            .into_iter()
            .map(|handle| WorkerLink {
                worker_id: handle.worker_id,
                capacity: handle.capacity,
                in_flight: 0,
                offline: false,
                dispatch_tx: handle.dispatch_tx,
            })
            .collect();

        let bracket = self.generator.next_bracket();
        bracket.validate()?;
        info!(
            run_id = %self.config.run_id,
            workers = self.workers.len(),
            rungs = bracket.rungs.len(),
            "master bootstrapped"
        );
        self.brackets.push(BracketRun::from_bracket(bracket));
        Ok(())
    }

    // -- dispatch -----------------------------------------------------------

    /// Hand work to every worker with a free slot, while any exists.
    fn fill_workers(&mut self) -> HbResult<()> {
        loop {
            let Some(worker_idx) = self.workers.iter().position(WorkerLink::has_slot) else {
                return Ok(());
            };
            match self.next_work()? {
                Some((slot, rung_idx, config, origin)) => {
                    self.create_and_dispatch(slot, rung_idx, config, origin, worker_idx)?;
                }
                None => return Ok(()),
            }
        }
    }

    /// The next configuration to evaluate, if any: promoted survivors
    /// first, then rung-0 quotas fed by optimizer asks, then a fresh
    /// bracket while the ask budget lasts.
    fn next_work(
        &mut self,
    ) -> HbResult<Option<(usize, usize, SharedConfiguration, JobOrigin)>> {
        if let Some((slot, rung_idx)) = self.find_pending_promotion() {
            let config = self.brackets[slot].rungs[rung_idx]
                .pending
                .pop_front()
                .expect("pending promotion vanished");
            return Ok(Some((slot, rung_idx, config, JobOrigin::Promoted)));
        }

        if self.asks_used >= self.config.n_iterations {
            return Ok(None);
        }

        let slot = match self.find_open_entry_rung() {
            Some(slot) => slot,
            None => {
                let bracket = self.generator.next_bracket();
                bracket.validate()?;
                debug!(
                    run_id = %self.config.run_id,
                    bracket = bracket.index,
                    rungs = bracket.rungs.len(),
                    "opened bracket"
                );
                self.brackets.push(BracketRun::from_bracket(bracket));
                self.brackets.len() - 1
            }
        };

        let (config, info) = self.optimizer.ask()?;
        self.asks_used += 1;
        Ok(Some((slot, 0, config, info.origin)))
    }

    fn find_pending_promotion(&self) -> Option<(usize, usize)> {
        for (slot, bracket) in self.brackets.iter().enumerate() {
            if bracket.terminated {
                continue;
            }
            for (rung_idx, rung) in bracket.rungs.iter().enumerate() {
                if !rung.pending.is_empty() {
                    return Some((slot, rung_idx));
                }
            }
        }
        None
    }

    fn find_open_entry_rung(&self) -> Option<usize> {
        self.brackets.iter().position(|bracket| {
            !bracket.terminated && bracket.rungs[0].created < bracket.rungs[0].target
        })
    }

    fn has_dispatchable_work(&self) -> bool {
        self.find_pending_promotion().is_some() || self.asks_used < self.config.n_iterations
    }

    /// Create a job for `(slot, rung_idx)` and dispatch it, retrying on
    /// other workers if the first is unreachable. After the retry budget
    /// the job degrades to a failure and the run continues.
    fn create_and_dispatch(
        &mut self,
        slot: usize,
        rung_idx: usize,
        config: SharedConfiguration,
        origin: JobOrigin,
        worker_idx: usize,
    ) -> HbResult<()> {
        let budget = self.brackets[slot].rungs[rung_idx].budget;
        let mut job = Job::new(self.next_seq, config, budget, origin);
        self.next_seq += 1;
        self.brackets[slot].rungs[rung_idx].created += 1;
        self.job_site.insert(job.id, (slot, rung_idx));

        let mut attempts: u32 = 0;
        let mut target_idx = worker_idx;
        loop {
            attempts += 1;
            let send_result = self.workers[target_idx]
                .dispatch_tx
                .send(WorkerCommand::Dispatch(Box::new(job.clone())));

            match send_result {
                Ok(()) => {
                    let link = &mut self.workers[target_idx];
                    job.mark_dispatched(link.worker_id.clone());
                    link.in_flight += 1;
                    if link.in_flight >= link.capacity {
                        // Advisory: the worker may have deregistered already.
                        let _ = self.registry.set_state(&link.worker_id, WorkerState::Busy);
                    }
                    self.outstanding += 1;
                    debug!(
                        job = %job.id,
                        worker = %job.worker_id.as_deref().unwrap_or(""),
                        budget,
                        origin = %origin,
                        "job dispatched"
                    );
                    self.jobs.insert(job.id, job);
                    return Ok(());
                }
                Err(_) => {
                    let worker_id = self.workers[target_idx].worker_id.clone();
                    self.workers[target_idx].offline = true;
                    self.registry.mark_offline(&worker_id);
                    if attempts >= self.config.max_dispatch_attempts {
                        break;
                    }
                    match self.workers.iter().position(WorkerLink::has_slot) {
                        Some(next_idx) => target_idx = next_idx,
                        None => break,
                    }
                }
            }
        }

        let error = TransportError::WorkerUnreachable {
            worker_id: self.workers[target_idx].worker_id.clone(),
            attempts,
        };
        warn!(job = %job.id, error = %error, "dispatch failed");
        job.mark_failed(error.to_string());
        self.jobs.insert(job.id, job);
        self.history.record_failure(budget);
        self.jobs_failed += 1;
        self.brackets[slot].rungs[rung_idx].failed += 1;
        self.check_rung(slot, rung_idx)
    }

    // -- completions --------------------------------------------------------

    fn handle_completion(&mut self, msg: CompletionMsg) -> HbResult<()> {
        if let Some(link) = self
            .workers
            .iter_mut()
            .find(|w| w.worker_id == msg.worker_id)
        {
            link.in_flight = link.in_flight.saturating_sub(1);
            if !link.offline && link.in_flight < link.capacity {
                let _ = self.registry.set_state(&link.worker_id, WorkerState::Idle);
            }
        }

        let Some(&(slot, rung_idx)) = self.job_site.get(&msg.job_id) else {
            debug!(job = %msg.job_id, "completion for retired job ignored");
            return Ok(());
        };
        let job = self
            .jobs
            .get_mut(&msg.job_id)
            .expect("job table out of sync with job_site");
        if job.is_resolved() {
            debug!(job = %msg.job_id, "late completion ignored");
            return Ok(());
        }
        self.outstanding -= 1;

        match msg.outcome {
            Ok(outcome) => {
                let budget = job.budget;
                let config = job.config.clone();
                job.mark_completed(JobResult {
                    loss: outcome.loss,
                    metadata: outcome.metadata.clone(),
                });
                // Tells are applied in completion-observed order; contract
                // errors here are master bugs and abort the run.
                self.optimizer.tell(&config, outcome.loss, budget, true)?;
                self.history.record(budget, config, outcome.loss);
                self.jobs_completed += 1;
                self.brackets[slot].rungs[rung_idx].completed.push(msg.job_id);
                debug!(job = %msg.job_id, budget, loss = outcome.loss, "job completed");
            }
            Err(error) => {
                self.history.record_failure(job.budget);
                job.mark_failed(error.to_string());
                self.jobs_failed += 1;
                self.brackets[slot].rungs[rung_idx].failed += 1;
            }
        }

        self.check_rung(slot, rung_idx)
    }

    /// If the rung just resolved, promote its survivors (or abandon the
    /// bracket when no one survives), then garbage-collect the bracket's
    /// jobs once the whole bracket is done.
    fn check_rung(&mut self, slot: usize, rung_idx: usize) -> HbResult<()> {
        if self.brackets[slot].terminated || !self.brackets[slot].rungs[rung_idx].resolved() {
            return Ok(());
        }

        let has_next = rung_idx + 1 < self.brackets[slot].rungs.len();
        if has_next {
            let mut ranked: Vec<(f64, u64, SharedConfiguration)> = self.brackets[slot].rungs
                [rung_idx]
                .completed
                .iter()
                .map(|id| {
                    let job = &self.jobs[id];
                    (
                        job.loss().expect("completed job without loss"),
                        job.seq,
                        job.config.clone(),
                    )
                })
                .collect();
            promotion_sort(&mut ranked);

            let next_rung = &self.brackets[slot].rungs[rung_idx + 1];
            let promote = next_rung.target.min(ranked.len());
            if promote == 0 {
                info!(
                    bracket = self.brackets[slot].index,
                    budget = self.brackets[slot].rungs[rung_idx].budget,
                    "no survivors, bracket terminated early"
                );
                self.brackets[slot].terminated = true;
            } else {
                let from_budget = self.brackets[slot].rungs[rung_idx].budget;
                let next_rung = &mut self.brackets[slot].rungs[rung_idx + 1];
                next_rung.target = promote;
                for (_, _, config) in ranked.into_iter().take(promote) {
                    next_rung.pending.push_back(config);
                }
                info!(
                    bracket = self.brackets[slot].index,
                    from_budget,
                    to_budget = self.brackets[slot].rungs[rung_idx + 1].budget,
                    promoted = promote,
                    "rung promoted"
                );
            }
        }

        if self.brackets[slot].is_done() {
            self.retire_bracket(slot);
        }
        Ok(())
    }

    /// Drop a finished bracket's jobs from the table. Their observations
    /// already live in the history and the optimizer.
    fn retire_bracket(&mut self, slot: usize) {
        let mut retired = 0;
        self.job_site.retain(|job_id, &mut (job_slot, _)| {
            if job_slot == slot {
                self.jobs.remove(job_id);
                retired += 1;
                false
            } else {
                true
            }
        });
        debug!(
            bracket = self.brackets[slot].index,
            jobs = retired,
            "bracket retired"
        );
    }

    // -- failure paths ------------------------------------------------------

    /// Once the ask budget is exhausted, shrink entry rungs that can never
    /// fill to the jobs actually created so they can still resolve and
    /// promote.
    fn clamp_open_rungs(&mut self) -> HbResult<()> {
        if self.clamped {
            return Ok(());
        }
        self.clamped = true;

        for slot in 0..self.brackets.len() {
            if self.brackets[slot].terminated {
                continue;
            }
            let rung = &mut self.brackets[slot].rungs[0];
            if rung.created < rung.target {
                rung.target = rung.created;
                if rung.target == 0 {
                    self.brackets[slot].terminated = true;
                } else {
                    self.check_rung(slot, 0)?;
                }
            }
        }
        Ok(())
    }

    fn liveness_sweep(&mut self) -> HbResult<()> {
        let dead: Vec<String> = self
            .workers
            .iter_mut()
            .filter(|w| !w.offline && w.dispatch_tx.is_closed())
            .map(|w| {
                w.offline = true;
                w.worker_id.clone()
            })
            .collect();

        for worker_id in dead {
            self.registry.mark_offline(&worker_id);
            let stranded: Vec<JobId> = self
                .jobs
                .values()
                .filter(|j| !j.is_resolved() && j.worker_id.as_deref() == Some(&worker_id))
                .map(|j| j.id)
                .collect();
            for job_id in stranded {
                self.fail_job(job_id, format!("worker {worker_id} went offline"))?;
            }
        }
        Ok(())
    }

    fn fail_outstanding(&mut self, reason: &str) -> HbResult<()> {
        let unresolved: Vec<JobId> = self
            .jobs
            .values()
            .filter(|j| !j.is_resolved())
            .map(|j| j.id)
            .collect();
        for job_id in unresolved {
            self.fail_job(job_id, reason.to_string())?;
        }
        Ok(())
    }

    fn fail_job(&mut self, job_id: JobId, reason: String) -> HbResult<()> {
        let Some(&(slot, rung_idx)) = self.job_site.get(&job_id) else {
            return Ok(());
        };
        let job = self.jobs.get_mut(&job_id).expect("job table out of sync");
        if job.is_resolved() {
            return Ok(());
        }
        let budget = job.budget;
        job.mark_failed(reason);
        self.outstanding -= 1;
        self.jobs_failed += 1;
        self.history.record_failure(budget);
        self.brackets[slot].rungs[rung_idx].failed += 1;
        self.check_rung(slot, rung_idx)
    }

    // -- termination --------------------------------------------------------

    fn finish(mut self) -> HbResult<RunResult> {
        self.state = MasterState::Terminated;
        let best = self.optimizer.incumbent();
        if self.jobs_completed == 0 && best.is_none() {
            return Err(RunError::NoCompletedJobs.into());
        }
        info!(
            run_id = %self.config.run_id,
            iterations = self.asks_used,
            completed = self.jobs_completed,
            failed = self.jobs_failed,
            best_loss = best.as_ref().map(|b| b.loss),
            "run terminated"
        );
        Ok(RunResult {
            run_id: self.config.run_id,
            best,
            history: self.history,
            iterations: self.asks_used,
            jobs_completed: self.jobs_completed,
            jobs_failed: self.jobs_failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iter::CustomIterGenerator;
    use crate::worker::{ConcurrencyMode, EvalFn, EvalOutcome, Worker, WorkerRuntime};
    use hb_space::{RandomOptimizer, SearchSpace};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn space() -> SearchSpace {
        SearchSpace::new().add_float("x", -2.0, 2.0)
    }

    fn quadratic_eval() -> EvalFn {
        Arc::new(|config, budget| {
            let x = config.get("x").and_then(|v| v.as_f64()).unwrap_or(0.0);
            Ok(EvalOutcome::from_loss(x * x / budget))
        })
    }

    struct Harness {
        registry: Arc<NameRegistry>,
        runtimes: Vec<WorkerRuntime>,
        completion_rx: mpsc::UnboundedReceiver<CompletionMsg>,
    }

    fn start_workers(eval: EvalFn, n_workers: usize) -> Harness {
        let registry = NameRegistry::start("test-run", "127.0.0.1", 0).unwrap();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let mut runtimes = Vec::new();
        for i in 0..n_workers {
            let mut worker = Worker::new("test-run", format!("worker-{i}"), 1);
            worker.initialize(eval.clone());
            let runtime = worker
                .run(
                    true,
                    ConcurrencyMode::Thread,
                    completion_tx.clone(),
                    Some(registry.clone()),
                )
                .unwrap();
            registry
                .register(&runtime.worker_id, &runtime.address, 1, runtime.dispatch_tx.clone())
                .unwrap();
            runtimes.push(runtime);
        }
        Harness {
            registry,
            runtimes,
            completion_rx,
        }
    }

    async fn run_master(
        eval: EvalFn,
        generator: Box<dyn IterGenerator>,
        n_workers: usize,
        n_iterations: usize,
        drain_timeout: Duration,
    ) -> HbResult<RunResult> {
        let harness = start_workers(eval, n_workers);
        let mut optimizer = Box::new(RandomOptimizer::new());
        optimizer
            .initialize(space(), generator.budgets(), 7, Vec::new())
            .unwrap();

        let config = MasterConfig::new("test-run", n_iterations).with_drain_timeout(drain_timeout);
        let master = Master::new(
            config,
            optimizer,
            generator,
            harness.registry.clone(),
            harness.completion_rx,
        );
        let result = master.run().await;
        for runtime in &harness.runtimes {
            runtime.stop();
        }
        result
    }

    #[test]
    fn promotion_order_is_deterministic() {
        // Top 2 of losses [0.5, 0.1, 0.9, 0.3] are 0.1 and 0.3 no matter
        // the completion order.
        let base = [(0.5, 0u64), (0.1, 1), (0.9, 2), (0.3, 3)];
        let permutations = [
            [0usize, 1, 2, 3],
            [3, 2, 1, 0],
            [1, 3, 0, 2],
            [2, 0, 3, 1],
        ];
        for permutation in permutations {
            let mut entries: Vec<(f64, u64, ())> = permutation
                .iter()
                .map(|&i| (base[i].0, base[i].1, ()))
                .collect();
            promotion_sort(&mut entries);
            let top: Vec<f64> = entries.iter().take(2).map(|e| e.0).collect();
            assert_eq!(top, vec![0.1, 0.3]);
        }
    }

    #[test]
    fn promotion_ties_favor_earlier_jobs() {
        let mut entries = vec![(0.5, 9u64, "late"), (0.5, 2, "early"), (0.1, 5, "best")];
        promotion_sort(&mut entries);
        assert_eq!(entries[0].2, "best");
        assert_eq!(entries[1].2, "early");
    }

    #[tokio::test]
    async fn single_fidelity_run_completes() {
        let generator = Box::new(CustomIterGenerator::single_fidelity());
        let result = run_master(quadratic_eval(), generator, 2, 6, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(result.iterations, 6);
        assert_eq!(result.jobs_completed, 6);
        assert_eq!(result.jobs_failed, 0);

        let obs = result.history.observations(1.0).unwrap();
        assert_eq!(obs.len(), 6);
        let min_loss = obs.losses.iter().copied().fold(f64::INFINITY, f64::min);
        assert_eq!(result.best_loss(), Some(min_loss));
    }

    #[tokio::test]
    async fn multi_fidelity_promotes_best_configs() {
        let generator = Box::new(CustomIterGenerator::new(vec![4, 2], vec![1.0, 2.0]).unwrap());
        let result = run_master(quadratic_eval(), generator, 2, 4, Duration::from_secs(5))
            .await
            .unwrap();

        // One bracket: 4 asked at budget 1, the best 2 rerun at budget 2.
        assert_eq!(result.iterations, 4);
        assert_eq!(result.jobs_completed, 6);
        let low = result.history.observations(1.0).unwrap();
        let high = result.history.observations(2.0).unwrap();
        assert_eq!(low.len(), 4);
        assert_eq!(high.len(), 2);

        // loss(x, b) = x^2 / b, so the promoted losses are exactly the two
        // smallest entry-rung losses halved.
        let mut entry_losses = low.losses.clone();
        entry_losses.sort_by(f64::total_cmp);
        let mut promoted: Vec<f64> = high.losses.iter().map(|l| l * 2.0).collect();
        promoted.sort_by(f64::total_cmp);
        assert_eq!(promoted, entry_losses[..2].to_vec());
    }

    #[tokio::test]
    async fn failed_job_excluded_from_promotion() {
        // Second evaluation fails; the rung of 4 resolves with 3 completed
        // and still promotes 2 of them.
        let calls = Arc::new(AtomicUsize::new(0));
        let eval: EvalFn = {
            let calls = calls.clone();
            Arc::new(move |config, budget| {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                if call == 1 {
                    return Err("synthetic failure".to_string());
                }
                let x = config.get("x").and_then(|v| v.as_f64()).unwrap_or(0.0);
                Ok(EvalOutcome::from_loss(x * x / budget))
            })
        };

        let generator = Box::new(CustomIterGenerator::new(vec![4, 2], vec![1.0, 2.0]).unwrap());
        let result = run_master(eval, generator, 1, 4, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(result.jobs_failed, 1);
        assert_eq!(result.history.failures(1.0), 1);
        assert_eq!(result.history.observations(1.0).unwrap().len(), 3);
        assert_eq!(result.history.observations(2.0).unwrap().len(), 2);
        assert_eq!(result.jobs_completed, 5);
    }

    #[tokio::test]
    async fn all_failed_rung_abandons_bracket_and_run_continues() {
        // First bracket's entry rung fails completely; the run opens a
        // second bracket with the remaining ask budget and succeeds.
        let calls = Arc::new(AtomicUsize::new(0));
        let eval: EvalFn = {
            let calls = calls.clone();
            Arc::new(move |config, budget| {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                if call < 2 {
                    return Err("cold start failure".to_string());
                }
                let x = config.get("x").and_then(|v| v.as_f64()).unwrap_or(0.0);
                Ok(EvalOutcome::from_loss(x * x / budget))
            })
        };

        let generator = Box::new(CustomIterGenerator::new(vec![2, 1], vec![1.0, 2.0]).unwrap());
        let result = run_master(eval, generator, 1, 4, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(result.iterations, 4);
        assert_eq!(result.jobs_failed, 2);
        // Second bracket: 2 completions at budget 1, 1 promotion at budget 2.
        assert_eq!(result.history.observations(1.0).unwrap().len(), 2);
        assert_eq!(result.history.observations(2.0).unwrap().len(), 1);
        assert_eq!(result.jobs_completed, 3);
    }

    #[tokio::test]
    async fn run_with_only_failures_reports_no_completed_jobs() {
        let eval: EvalFn = Arc::new(|_, _| Err("always broken".to_string()));
        let generator = Box::new(CustomIterGenerator::single_fidelity());
        let err = run_master(eval, generator, 1, 3, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            hb_types::HbError::Run(RunError::NoCompletedJobs)
        ));
    }

    #[tokio::test]
    async fn drain_timeout_fails_stuck_jobs() {
        let eval: EvalFn = Arc::new(|_, _| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(EvalOutcome::from_loss(0.0))
        });
        let generator = Box::new(CustomIterGenerator::single_fidelity());
        let err = run_master(eval, generator, 1, 1, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            hb_types::HbError::Run(RunError::NoCompletedJobs)
        ));
    }

    #[tokio::test]
    async fn drain_deadline_survives_liveness_ticks() {
        // Drain timeout longer than the liveness period: the deadline must
        // hold across sweep ticks instead of restarting on every wakeup.
        let eval: EvalFn = Arc::new(|_, _| {
            std::thread::sleep(Duration::from_secs(2));
            Ok(EvalOutcome::from_loss(0.0))
        });
        let generator = Box::new(CustomIterGenerator::single_fidelity());
        let run = run_master(eval, generator, 1, 1, Duration::from_millis(700));
        let err = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("drain deadline was pushed back past the timeout")
            .unwrap_err();
        assert!(matches!(
            err,
            hb_types::HbError::Run(RunError::NoCompletedJobs)
        ));
    }

    #[tokio::test]
    async fn dispatch_reflects_busy_state_in_registry() {
        // A capacity-1 worker shows Busy in the registry while its job
        // runs and flips back to Idle on completion.
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(1);
        let eval: EvalFn = Arc::new(move |_, _| {
            gate_rx.recv().ok();
            Ok(EvalOutcome::from_loss(0.0))
        });

        let harness = start_workers(eval, 1);
        let registry = harness.registry.clone();
        let generator: Box<dyn IterGenerator> =
            Box::new(CustomIterGenerator::single_fidelity());
        let mut optimizer = Box::new(RandomOptimizer::new());
        optimizer
            .initialize(space(), generator.budgets(), 7, Vec::new())
            .unwrap();

        let config = MasterConfig::new("test-run", 1).with_drain_timeout(Duration::from_secs(5));
        let master = Master::new(
            config,
            optimizer,
            generator,
            registry.clone(),
            harness.completion_rx,
        );
        let run = tokio::spawn(master.run());

        let mut saw_busy = false;
        for _ in 0..200 {
            if registry
                .list_workers()
                .iter()
                .any(|w| w.state == WorkerState::Busy)
            {
                saw_busy = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        gate_tx.send(()).unwrap();
        assert!(saw_busy, "worker never shown as busy");

        let result = run.await.unwrap().unwrap();
        assert_eq!(result.jobs_completed, 1);
        assert_eq!(registry.list_workers()[0].state, WorkerState::Idle);

        for runtime in &harness.runtimes {
            runtime.stop();
        }
    }
}
