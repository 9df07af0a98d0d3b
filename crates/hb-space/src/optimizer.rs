//! The ask/tell optimizer contract and the built-in optimizers.
//!
//! The scheduler never inspects optimizer internals: it only sequences
//! `ask` and `tell` calls. Observations may arrive out of dispatch order
//! and across interleaved budgets; optimizers must tolerate both.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

use hb_types::{
    Configuration, HbResult, Incumbent, JobOrigin, OptimizerError, ParameterValue, RunHistory,
    SharedConfiguration,
};

use crate::space::{ParameterKind, SearchSpace};

/// Side information attached to an asked configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigInfo {
    pub origin: JobOrigin,
}

/// Closed set of built-in optimizers, selected by the run driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerKind {
    /// Uniform random sampling.
    Random,
    /// Explore/exploit perturbation around the incumbent.
    Perturb,
}

/// Build an optimizer from its kind descriptor.
pub fn build_optimizer(kind: OptimizerKind) -> Box<dyn Optimizer> {
    match kind {
        OptimizerKind::Random => Box::new(RandomOptimizer::new()),
        OptimizerKind::Perturb => Box::new(PerturbOptimizer::new(0.3)),
    }
}

/// Pull/push interface between the scheduler and a candidate generator.
pub trait Optimizer: Send {
    /// Bind the search space, the run's budget levels, and the RNG seed.
    /// Must be called exactly once before the first `ask`/`tell`.
    fn initialize(
        &mut self,
        space: SearchSpace,
        budgets: Vec<f64>,
        seed: u64,
        initial_points: Vec<Configuration>,
    ) -> HbResult<()>;

    /// Propose the next configuration to evaluate.
    fn ask(&mut self) -> HbResult<(SharedConfiguration, ConfigInfo)>;

    /// Report an observed loss for `config` at `budget`. With
    /// `update_model = false` the observation is recorded but any model
    /// refit is deferred (batch-fit semantics for replays and waves).
    fn tell(
        &mut self,
        config: &SharedConfiguration,
        loss: f64,
        budget: f64,
        update_model: bool,
    ) -> HbResult<()>;

    /// Best-known `(config, loss, budget)`, preferring the highest budget
    /// that has observations.
    fn incumbent(&self) -> Option<Incumbent>;

    /// Human-readable optimizer name.
    fn name(&self) -> &str;
}

/// State shared by the built-in optimizers once `initialize` has run.
struct Fitted {
    space: SearchSpace,
    budgets: Vec<f64>,
    rng: ChaCha8Rng,
    initial_points: VecDeque<Configuration>,
    history: RunHistory,
}

impl Fitted {
    fn new(
        space: SearchSpace,
        budgets: Vec<f64>,
        seed: u64,
        initial_points: Vec<Configuration>,
    ) -> HbResult<Self> {
        if space.is_empty() {
            return Err(hb_types::ConfigError::EmptySpace.into());
        }
        if budgets.is_empty() {
            return Err(hb_types::ConfigError::EmptySchedule.into());
        }
        Ok(Self {
            space,
            budgets,
            rng: ChaCha8Rng::seed_from_u64(seed),
            initial_points: initial_points.into(),
            history: RunHistory::new(),
        })
    }

    fn check_budget(&self, budget: f64) -> HbResult<()> {
        if self.budgets.iter().any(|b| b.total_cmp(&budget).is_eq()) {
            Ok(())
        } else {
            Err(OptimizerError::InvalidBudget {
                budget,
                known: self.budgets.clone(),
            }
            .into())
        }
    }

    /// Caller-supplied starting point, if any remain.
    fn next_initial_point(&mut self) -> Option<SharedConfiguration> {
        self.initial_points.pop_front().map(Arc::new)
    }
}

// ---- Random optimizer ----

/// Uniform random sampling over the search space, seeded for
/// reproducibility. Mostly useful as a baseline and in tests, but also the
/// cold-start engine inside [`PerturbOptimizer`].
#[derive(Default)]
pub struct RandomOptimizer {
    fitted: Option<Fitted>,
}

impl RandomOptimizer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Optimizer for RandomOptimizer {
    fn initialize(
        &mut self,
        space: SearchSpace,
        budgets: Vec<f64>,
        seed: u64,
        initial_points: Vec<Configuration>,
    ) -> HbResult<()> {
        self.fitted = Some(Fitted::new(space, budgets, seed, initial_points)?);
        Ok(())
    }

    fn ask(&mut self) -> HbResult<(SharedConfiguration, ConfigInfo)> {
        let fitted = self.fitted.as_mut().ok_or(OptimizerError::NotFitted)?;
        if let Some(config) = fitted.next_initial_point() {
            return Ok((
                config,
                ConfigInfo {
                    origin: JobOrigin::WarmStart,
                },
            ));
        }
        let config = fitted.space.sample(&mut fitted.rng);
        Ok((
            Arc::new(config),
            ConfigInfo {
                origin: JobOrigin::RandomInit,
            },
        ))
    }

    fn tell(
        &mut self,
        config: &SharedConfiguration,
        loss: f64,
        budget: f64,
        _update_model: bool,
    ) -> HbResult<()> {
        let fitted = self.fitted.as_mut().ok_or(OptimizerError::NotFitted)?;
        fitted.check_budget(budget)?;
        fitted.history.record(budget, config.clone(), loss);
        Ok(())
    }

    fn incumbent(&self) -> Option<Incumbent> {
        self.fitted.as_ref()?.history.incumbent()
    }

    fn name(&self) -> &str {
        "random"
    }
}

// ---- Perturbation optimizer ----

/// Adaptive optimizer that perturbs the best-known configuration.
///
/// Samples uniformly with probability `exploration_weight` (and always
/// before the first observation); otherwise it proposes a neighbour of the
/// incumbent. The exploit base is only refreshed on `tell` calls with
/// `update_model = true`, so replayed history is folded in as one batch.
pub struct PerturbOptimizer {
    exploration_weight: f64,
    fitted: Option<Fitted>,
    exploit_base: Option<SharedConfiguration>,
}

impl PerturbOptimizer {
    pub fn new(exploration_weight: f64) -> Self {
        Self {
            exploration_weight,
            fitted: None,
            exploit_base: None,
        }
    }

    /// Perturb `base` within each parameter's range.
    fn perturb(space: &SearchSpace, base: &Configuration, rng: &mut impl Rng) -> Configuration {
        let mut perturbed = Configuration::new();

        for param in &space.parameters {
            let base_val = base.get(&param.name);
            let value = match (&param.kind, base_val) {
                (ParameterKind::FloatRange { low, high }, Some(ParameterValue::Float(v))) => {
                    let range = high - low;
                    let noise = rng.gen_range(-0.1..0.1) * range;
                    ParameterValue::Float((v + noise).clamp(*low, *high))
                }
                (ParameterKind::IntRange { low, high }, Some(ParameterValue::Int(v))) => {
                    let delta: i64 = rng.gen_range(-2..=2);
                    ParameterValue::Int((v + delta).clamp(*low, *high))
                }
                (ParameterKind::LogUniform { low, high }, Some(ParameterValue::Float(v))) => {
                    let log_v = v.ln();
                    let log_range = high.ln() - low.ln();
                    let noise = rng.gen_range(-0.1..0.1) * log_range;
                    ParameterValue::Float((log_v + noise).exp().clamp(*low, *high))
                }
                _ => {
                    // Choices and missing base values fall back to a fresh draw.
                    let single = SearchSpace {
                        parameters: vec![param.clone()],
                    };
                    single
                        .sample(rng)
                        .remove(&param.name)
                        .unwrap_or(ParameterValue::Int(0))
                }
            };
            perturbed.insert(param.name.clone(), value);
        }

        perturbed
    }
}

impl Optimizer for PerturbOptimizer {
    fn initialize(
        &mut self,
        space: SearchSpace,
        budgets: Vec<f64>,
        seed: u64,
        initial_points: Vec<Configuration>,
    ) -> HbResult<()> {
        self.fitted = Some(Fitted::new(space, budgets, seed, initial_points)?);
        self.exploit_base = None;
        Ok(())
    }

    fn ask(&mut self) -> HbResult<(SharedConfiguration, ConfigInfo)> {
        let fitted = self.fitted.as_mut().ok_or(OptimizerError::NotFitted)?;
        if let Some(config) = fitted.next_initial_point() {
            return Ok((
                config,
                ConfigInfo {
                    origin: JobOrigin::WarmStart,
                },
            ));
        }

        let explore = match &self.exploit_base {
            None => true,
            Some(_) => fitted.rng.gen::<f64>() < self.exploration_weight,
        };

        if explore {
            let config = fitted.space.sample(&mut fitted.rng);
            Ok((
                Arc::new(config),
                ConfigInfo {
                    origin: JobOrigin::RandomInit,
                },
            ))
        } else {
            let base = self.exploit_base.as_ref().unwrap().clone();
            let config = Self::perturb(&fitted.space, &base, &mut fitted.rng);
            Ok((
                Arc::new(config),
                ConfigInfo {
                    origin: JobOrigin::ModelSampled,
                },
            ))
        }
    }

    fn tell(
        &mut self,
        config: &SharedConfiguration,
        loss: f64,
        budget: f64,
        update_model: bool,
    ) -> HbResult<()> {
        let fitted = self.fitted.as_mut().ok_or(OptimizerError::NotFitted)?;
        fitted.check_budget(budget)?;
        fitted.history.record(budget, config.clone(), loss);

        if update_model {
            self.exploit_base = fitted.history.incumbent().map(|inc| inc.config);
            debug!(loss, budget, "exploit base refreshed");
        }
        Ok(())
    }

    fn incumbent(&self) -> Option<Incumbent> {
        self.fitted.as_ref()?.history.incumbent()
    }

    fn name(&self) -> &str {
        "perturb"
    }
}

// ---- Warm start ----

/// Replay a previous run's history into a freshly initialized optimizer.
///
/// Observations are told in stored order; the model is only refit on the
/// final replay per budget so a long history does not trigger one refit per
/// historical point.
pub fn warm_start(optimizer: &mut dyn Optimizer, history: &RunHistory) -> HbResult<()> {
    for (budget, obs) in history.iter() {
        let last = obs.len().saturating_sub(1);
        for (i, (config, loss)) in obs.configs.iter().zip(obs.losses.iter()).enumerate() {
            optimizer.tell(config, *loss, budget, i == last)?;
        }
    }
    Ok(())
}
