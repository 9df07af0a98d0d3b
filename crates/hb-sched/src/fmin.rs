//! The `fmin` run driver: wires optimizer, iteration plan, registry,
//! workers, and master together for one optimization run.
//!
//! Three execution strategies share the same ask/tell contract:
//! an inline serial loop, synchronous map-reduce waves on the rayon pool,
//! and the fully asynchronous master/worker pipeline.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use rayon::prelude::*;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use hb_space::{warm_start, Optimizer, SearchSpace};
use hb_types::{Configuration, EvaluationError, HbResult, RunError, RunHistory, RunResult};

use crate::iter::{CustomIterGenerator, IterGenerator};
use crate::master::{Master, MasterConfig};
use crate::registry::NameRegistry;
use crate::worker::{panic_message, ConcurrencyMode, EvalFn, EvalOutcome, Worker};

/// How evaluations are parallelized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParallelStrategy {
    /// Ask, evaluate inline, tell. No workers, no channels.
    Serial,
    /// Master/worker pipeline over channels; workers are refilled the
    /// moment they finish, independent of the rest of their rung.
    AsyncComm,
    /// Synchronous waves of `n_jobs` evaluations on the rayon pool; the
    /// model refits once per wave.
    MapReduce,
}

/// Options for [`fmin`]. Built with setters; defaults favor a local
/// single-process run.
pub struct FminOptions {
    pub n_iterations: usize,
    pub n_jobs: usize,
    pub strategy: ParallelStrategy,
    pub random_state: u64,
    /// Run identifier; a fresh UUID when not supplied.
    pub run_id: Option<String>,
    pub generator: Option<Box<dyn IterGenerator>>,
    pub initial_points: Vec<Configuration>,
    pub previous_history: Option<RunHistory>,
    pub registry_host: String,
    pub registry_port: u16,
    pub drain_timeout: Duration,
    pub worker_grace_period: Duration,
    /// Degrade to `Serial` when `n_jobs <= 1` and no iteration plan is
    /// supplied: the pipeline buys nothing there.
    pub auto_serial: bool,
}

impl Default for FminOptions {
    fn default() -> Self {
        Self {
            n_iterations: 100,
            n_jobs: 1,
            strategy: ParallelStrategy::AsyncComm,
            random_state: 42,
            run_id: None,
            generator: None,
            initial_points: Vec::new(),
            previous_history: None,
            registry_host: "127.0.0.1".to_string(),
            registry_port: 0,
            drain_timeout: Duration::from_secs(60),
            worker_grace_period: Duration::from_secs(5),
            auto_serial: true,
        }
    }
}

impl FminOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_n_iterations(mut self, n_iterations: usize) -> Self {
        self.n_iterations = n_iterations;
        self
    }

    pub fn with_n_jobs(mut self, n_jobs: usize) -> Self {
        self.n_jobs = n_jobs.max(1);
        self
    }

    pub fn with_strategy(mut self, strategy: ParallelStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_random_state(mut self, random_state: u64) -> Self {
        self.random_state = random_state;
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_generator(mut self, generator: Box<dyn IterGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn with_initial_points(mut self, initial_points: Vec<Configuration>) -> Self {
        self.initial_points = initial_points;
        self
    }

    pub fn with_previous_history(mut self, history: RunHistory) -> Self {
        self.previous_history = Some(history);
        self
    }

    pub fn with_registry(mut self, host: impl Into<String>, port: u16) -> Self {
        self.registry_host = host.into();
        self.registry_port = port;
        self
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn with_worker_grace_period(mut self, grace_period: Duration) -> Self {
        self.worker_grace_period = grace_period;
        self
    }

    pub fn with_auto_serial(mut self, auto_serial: bool) -> Self {
        self.auto_serial = auto_serial;
        self
    }
}

/// Minimize `eval_fn` over `space` and return the run's result.
///
/// The optimizer is initialized with the iteration plan's budget set and
/// warm-started from `previous_history` before the first ask, so a resumed
/// run proposes from everything already observed.
pub async fn fmin(
    eval_fn: EvalFn,
    space: SearchSpace,
    mut optimizer: Box<dyn Optimizer>,
    mut options: FminOptions,
) -> HbResult<RunResult> {
    let run_id = options
        .run_id
        .take()
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

    let had_generator = options.generator.is_some();
    let strategy = if options.auto_serial && options.n_jobs <= 1 && !had_generator {
        ParallelStrategy::Serial
    } else {
        options.strategy
    };

    let mut generator: Box<dyn IterGenerator> = options
        .generator
        .take()
        .unwrap_or_else(|| Box::new(CustomIterGenerator::single_fidelity()));
    // Resumed runs reuse their generator; plans always restart at bracket 0.
    generator.reset();

    optimizer.initialize(
        space,
        generator.budgets(),
        options.random_state,
        std::mem::take(&mut options.initial_points),
    )?;
    if let Some(history) = options.previous_history.as_ref() {
        warm_start(optimizer.as_mut(), history)?;
    }

    info!(
        run_id = %run_id,
        strategy = ?strategy,
        optimizer = optimizer.name(),
        n_iterations = options.n_iterations,
        n_jobs = options.n_jobs,
        "run starting"
    );

    match strategy {
        ParallelStrategy::Serial => run_serial(eval_fn, optimizer, &*generator, run_id, &options),
        ParallelStrategy::MapReduce => {
            run_mapreduce(eval_fn, optimizer, &*generator, run_id, &options).await
        }
        ParallelStrategy::AsyncComm => {
            run_async_comm(eval_fn, optimizer, generator, run_id, &options).await
        }
    }
}

/// Invoke the user callable, classifying errors, panics, and non-finite
/// losses. Mirrors the worker-side conversion.
fn run_eval(
    eval_fn: &EvalFn,
    config: &Configuration,
    budget: f64,
) -> Result<EvalOutcome, EvaluationError> {
    match catch_unwind(AssertUnwindSafe(|| eval_fn(config, budget))) {
        Ok(Ok(outcome)) if outcome.loss.is_finite() => Ok(outcome),
        Ok(Ok(outcome)) => Err(EvaluationError::InvalidResult {
            message: format!("non-finite loss {}", outcome.loss),
        }),
        Ok(Err(message)) => Err(EvaluationError::Raised { message }),
        Err(panic) => Err(EvaluationError::Panicked {
            message: panic_message(&panic),
        }),
    }
}

fn run_serial(
    eval_fn: EvalFn,
    mut optimizer: Box<dyn Optimizer>,
    generator: &dyn IterGenerator,
    run_id: String,
    options: &FminOptions,
) -> HbResult<RunResult> {
    // Serial evaluation has no promotion machinery: every iteration runs
    // at the plan's highest fidelity.
    let budget = *generator
        .budgets()
        .last()
        .expect("generator with no budgets");

    let mut history = RunHistory::new();
    let mut jobs_completed = 0;
    let mut jobs_failed = 0;

    for _ in 0..options.n_iterations {
        let (config, _info) = optimizer.ask()?;
        match run_eval(&eval_fn, &config, budget) {
            Ok(outcome) => {
                optimizer.tell(&config, outcome.loss, budget, true)?;
                history.record(budget, config, outcome.loss);
                jobs_completed += 1;
            }
            Err(error) => {
                warn!(run_id = %run_id, error = %error, "evaluation failed");
                history.record_failure(budget);
                jobs_failed += 1;
            }
        }
    }

    finish(run_id, optimizer, history, options.n_iterations, jobs_completed, jobs_failed)
}

async fn run_mapreduce(
    eval_fn: EvalFn,
    mut optimizer: Box<dyn Optimizer>,
    generator: &dyn IterGenerator,
    run_id: String,
    options: &FminOptions,
) -> HbResult<RunResult> {
    let budget = *generator
        .budgets()
        .last()
        .expect("generator with no budgets");

    let mut history = RunHistory::new();
    let mut jobs_completed = 0;
    let mut jobs_failed = 0;
    let mut asks_used = 0;

    while asks_used < options.n_iterations {
        let wave_size = options.n_jobs.min(options.n_iterations - asks_used);
        let mut configs = Vec::with_capacity(wave_size);
        for _ in 0..wave_size {
            let (config, _info) = optimizer.ask()?;
            configs.push(config);
        }
        asks_used += wave_size;

        // Rayon blocks, so the wave runs off the async executor.
        let wave_eval = eval_fn.clone();
        let wave_configs = configs.clone();
        let outcomes: Vec<Result<EvalOutcome, EvaluationError>> =
            tokio::task::spawn_blocking(move || {
                wave_configs
                    .par_iter()
                    .map(|config| run_eval(&wave_eval, config, budget))
                    .collect()
            })
            .await
            .map_err(|err| hb_types::internal_error!("evaluation wave failed: {err}"))?;

        // One model refit per wave: only the last successful tell updates.
        let last_ok = outcomes.iter().rposition(Result::is_ok);
        for (i, (config, outcome)) in configs.into_iter().zip(outcomes).enumerate() {
            match outcome {
                Ok(out) => {
                    optimizer.tell(&config, out.loss, budget, Some(i) == last_ok)?;
                    history.record(budget, config, out.loss);
                    jobs_completed += 1;
                }
                Err(error) => {
                    warn!(run_id = %run_id, error = %error, "evaluation failed");
                    history.record_failure(budget);
                    jobs_failed += 1;
                }
            }
        }
    }

    finish(run_id, optimizer, history, asks_used, jobs_completed, jobs_failed)
}

async fn run_async_comm(
    eval_fn: EvalFn,
    optimizer: Box<dyn Optimizer>,
    generator: Box<dyn IterGenerator>,
    run_id: String,
    options: &FminOptions,
) -> HbResult<RunResult> {
    let registry = NameRegistry::start(
        run_id.as_str(),
        &options.registry_host,
        options.registry_port,
    )?;
    let (completion_tx, completion_rx) = mpsc::unbounded_channel();

    let mut runtimes = Vec::with_capacity(options.n_jobs);
    let spawn_result: HbResult<()> = async {
        for i in 0..options.n_jobs.max(1) {
            let mut worker = Worker::new(run_id.as_str(), format!("worker-{i}"), 1)
                .with_grace_period(options.worker_grace_period);
            worker.initialize(eval_fn.clone());
            let runtime = worker.run(
                true,
                ConcurrencyMode::Thread,
                completion_tx.clone(),
                Some(registry.clone()),
            )?;
            registry
                .register_with_retry(
                    &runtime.worker_id,
                    &runtime.address,
                    1,
                    runtime.dispatch_tx.clone(),
                    3,
                )
                .await?;
            runtimes.push(runtime);
        }
        Ok(())
    }
    .await;
    // Master's channel must be the only remaining sender.
    drop(completion_tx);

    let result = match spawn_result {
        Ok(()) => {
            let config = MasterConfig::new(run_id, options.n_iterations)
                .with_drain_timeout(options.drain_timeout);
            let master = Master::new(config, optimizer, generator, registry.clone(), completion_rx);
            master.run().await
        }
        Err(err) => Err(err),
    };

    for runtime in &runtimes {
        runtime.stop();
    }
    let join_limit = options.worker_grace_period + Duration::from_secs(1);
    for runtime in runtimes {
        let worker_id = runtime.worker_id.clone();
        if tokio::time::timeout(join_limit, runtime.handle).await.is_err() {
            warn!(worker = %worker_id, "worker did not stop in time");
        }
    }
    registry.shutdown();

    result
}

fn finish(
    run_id: String,
    optimizer: Box<dyn Optimizer>,
    history: RunHistory,
    iterations: usize,
    jobs_completed: usize,
    jobs_failed: usize,
) -> HbResult<RunResult> {
    let best = optimizer.incumbent();
    if jobs_completed == 0 && best.is_none() {
        return Err(RunError::NoCompletedJobs.into());
    }
    info!(
        run_id = %run_id,
        iterations,
        completed = jobs_completed,
        failed = jobs_failed,
        best_loss = best.as_ref().map(|b| b.loss),
        "run finished"
    );
    Ok(RunResult {
        run_id,
        best,
        history,
        iterations,
        jobs_completed,
        jobs_failed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hb_space::RandomOptimizer;
    use hb_types::HbError;
    use std::sync::Arc;

    fn space() -> SearchSpace {
        SearchSpace::new().add_float("x", -2.0, 2.0)
    }

    fn quadratic_eval() -> EvalFn {
        Arc::new(|config, budget| {
            let x = config.get("x").and_then(|v| v.as_f64()).unwrap_or(0.0);
            Ok(EvalOutcome::from_loss(x * x / budget))
        })
    }

    #[test]
    fn run_eval_classifies_failures() {
        let config = Configuration::new();

        let panicking: EvalFn = Arc::new(|_, _| panic!("boom"));
        assert!(matches!(
            run_eval(&panicking, &config, 1.0),
            Err(EvaluationError::Panicked { .. })
        ));

        let raising: EvalFn = Arc::new(|_, _| Err("bad input".to_string()));
        assert!(matches!(
            run_eval(&raising, &config, 1.0),
            Err(EvaluationError::Raised { .. })
        ));

        let non_finite: EvalFn = Arc::new(|_, _| Ok(EvalOutcome::from_loss(f64::INFINITY)));
        assert!(matches!(
            run_eval(&non_finite, &config, 1.0),
            Err(EvaluationError::InvalidResult { .. })
        ));
    }

    #[tokio::test]
    async fn serial_run_records_every_iteration() {
        let options = FminOptions::new().with_n_iterations(40);
        let result = fmin(
            quadratic_eval(),
            space(),
            Box::new(RandomOptimizer::new()),
            options,
        )
        .await
        .unwrap();

        assert_eq!(result.iterations, 40);
        assert_eq!(result.jobs_completed, 40);
        assert_eq!(result.jobs_failed, 0);

        let obs = result.history.observations(1.0).unwrap();
        assert_eq!(obs.len(), 40);
        let min_loss = obs.losses.iter().copied().fold(f64::INFINITY, f64::min);
        assert_eq!(result.best_loss(), Some(min_loss));
    }

    #[tokio::test]
    async fn serial_and_async_agree_on_the_same_seed() {
        // Same seed, one worker: the ask sequence and therefore the best
        // loss must match across strategies exactly.
        let serial = fmin(
            quadratic_eval(),
            space(),
            Box::new(RandomOptimizer::new()),
            FminOptions::new().with_n_iterations(8).with_random_state(7),
        )
        .await
        .unwrap();

        let pipelined = fmin(
            quadratic_eval(),
            space(),
            Box::new(RandomOptimizer::new()),
            FminOptions::new()
                .with_n_iterations(8)
                .with_random_state(7)
                .with_auto_serial(false),
        )
        .await
        .unwrap();

        assert_eq!(serial.best_loss(), pipelined.best_loss());
        assert_eq!(
            serial.history.observations(1.0).unwrap().len(),
            pipelined.history.observations(1.0).unwrap().len()
        );
    }

    #[tokio::test]
    async fn warm_start_without_new_iterations_reproduces_best() {
        let first = fmin(
            quadratic_eval(),
            space(),
            Box::new(RandomOptimizer::new()),
            FminOptions::new().with_n_iterations(20),
        )
        .await
        .unwrap();

        let resumed = fmin(
            quadratic_eval(),
            space(),
            Box::new(RandomOptimizer::new()),
            FminOptions::new()
                .with_n_iterations(0)
                .with_previous_history(first.history.clone()),
        )
        .await
        .unwrap();

        assert_eq!(resumed.best_loss(), first.best_loss());
        assert_eq!(
            resumed.best.unwrap().config,
            first.best.unwrap().config
        );
    }

    #[tokio::test]
    async fn mapreduce_runs_in_waves() {
        let options = FminOptions::new()
            .with_n_iterations(7)
            .with_n_jobs(3)
            .with_strategy(ParallelStrategy::MapReduce);
        let result = fmin(
            quadratic_eval(),
            space(),
            Box::new(RandomOptimizer::new()),
            options,
        )
        .await
        .unwrap();

        assert_eq!(result.iterations, 7);
        assert_eq!(result.jobs_completed, 7);
        assert_eq!(result.history.observations(1.0).unwrap().len(), 7);
    }

    #[tokio::test]
    async fn async_multi_fidelity_end_to_end() {
        let generator = Box::new(CustomIterGenerator::new(vec![4, 2], vec![1.0, 2.0]).unwrap());
        let options = FminOptions::new()
            .with_n_iterations(4)
            .with_n_jobs(2)
            .with_generator(generator);
        let result = fmin(
            quadratic_eval(),
            space(),
            Box::new(RandomOptimizer::new()),
            options,
        )
        .await
        .unwrap();

        assert_eq!(result.jobs_completed, 6);
        assert_eq!(result.history.observations(1.0).unwrap().len(), 4);
        assert_eq!(result.history.observations(2.0).unwrap().len(), 2);
        // The incumbent comes from the highest fidelity.
        assert_eq!(result.best.unwrap().budget, 2.0);
    }

    #[tokio::test]
    async fn empty_run_without_history_fails() {
        let err = fmin(
            quadratic_eval(),
            space(),
            Box::new(RandomOptimizer::new()),
            FminOptions::new().with_n_iterations(0),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HbError::Run(RunError::NoCompletedJobs)));
    }
}
