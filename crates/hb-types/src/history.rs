//! Per-budget observation history and run results.
//!
//! The history is the run's durable record: every completed evaluation is
//! appended under its budget, never removed, never reordered. It feeds the
//! optimizer during the run and seeds warm starts of later runs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::params::SharedConfiguration;

/// Budget (fidelity) level, usable as an ordered map key.
///
/// Budgets come in as `f64` from the iteration plan; ordering is total
/// (`f64::total_cmp`), so the usual NaN caveats do not apply — but the
/// constructors in hb-sched reject non-finite budgets anyway.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Budget(pub f64);

impl PartialEq for Budget {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0).is_eq()
    }
}

impl Eq for Budget {}

impl PartialOrd for Budget {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Budget {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl std::fmt::Display for Budget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<f64> for Budget {
    fn from(value: f64) -> Self {
        Self(value)
    }
}

/// Observations accumulated at one budget level. Parallel vectors:
/// `configs.len() == losses.len()` at all times.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetObservations {
    pub configs: Vec<SharedConfiguration>,
    pub losses: Vec<f64>,
}

impl BudgetObservations {
    pub fn len(&self) -> usize {
        self.losses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.losses.is_empty()
    }

    fn push(&mut self, config: SharedConfiguration, loss: f64) {
        self.configs.push(config);
        self.losses.push(loss);
    }
}

/// Best-known `(config, loss, budget)` triple at the end of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incumbent {
    pub config: SharedConfiguration,
    pub loss: f64,
    pub budget: f64,
}

#[derive(Serialize, Deserialize)]
struct HistoryEntry {
    budget: f64,
    configs: Vec<SharedConfiguration>,
    losses: Vec<f64>,
    failures: usize,
}

/// Append-only observation history keyed by budget.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<HistoryEntry>", into = "Vec<HistoryEntry>")]
pub struct RunHistory {
    observations: BTreeMap<Budget, BudgetObservations>,
    failures: BTreeMap<Budget, usize>,
}

impl RunHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one completed observation under `budget`.
    pub fn record(&mut self, budget: f64, config: SharedConfiguration, loss: f64) {
        self.observations
            .entry(Budget(budget))
            .or_default()
            .push(config, loss);
    }

    /// Count a failed job at `budget`. Failures carry no loss and are kept
    /// out of the observation vectors.
    pub fn record_failure(&mut self, budget: f64) {
        *self.failures.entry(Budget(budget)).or_insert(0) += 1;
    }

    pub fn observations(&self, budget: f64) -> Option<&BudgetObservations> {
        self.observations.get(&Budget(budget))
    }

    pub fn failures(&self, budget: f64) -> usize {
        self.failures.get(&Budget(budget)).copied().unwrap_or(0)
    }

    /// Budgets with at least one observation, ascending.
    pub fn budgets(&self) -> Vec<f64> {
        self.observations.keys().map(|b| b.0).collect()
    }

    /// Iterate `(budget, observations)` pairs in ascending budget order.
    pub fn iter(&self) -> impl Iterator<Item = (f64, &BudgetObservations)> {
        self.observations.iter().map(|(b, obs)| (b.0, obs))
    }

    pub fn total_observations(&self) -> usize {
        self.observations.values().map(|obs| obs.len()).sum()
    }

    pub fn total_failures(&self) -> usize {
        self.failures.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Best observation across all budgets, preferring the highest budget
    /// that has any observations.
    pub fn incumbent(&self) -> Option<Incumbent> {
        let (budget, obs) = self.observations.iter().rev().find(|(_, obs)| !obs.is_empty())?;
        let (idx, loss) = obs
            .losses
            .iter()
            .copied()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(&b.1))?;
        Some(Incumbent {
            config: obs.configs[idx].clone(),
            loss,
            budget: budget.0,
        })
    }
}

impl From<Vec<HistoryEntry>> for RunHistory {
    fn from(entries: Vec<HistoryEntry>) -> Self {
        let mut history = Self::default();
        for entry in entries {
            history.observations.insert(
                Budget(entry.budget),
                BudgetObservations {
                    configs: entry.configs,
                    losses: entry.losses,
                },
            );
            if entry.failures > 0 {
                history.failures.insert(Budget(entry.budget), entry.failures);
            }
        }
        history
    }
}

impl From<RunHistory> for Vec<HistoryEntry> {
    fn from(history: RunHistory) -> Self {
        history
            .observations
            .into_iter()
            .map(|(budget, obs)| HistoryEntry {
                failures: history.failures.get(&budget).copied().unwrap_or(0),
                budget: budget.0,
                configs: obs.configs,
                losses: obs.losses,
            })
            .collect()
    }
}

/// Final outcome of an optimization run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub best: Option<Incumbent>,
    pub history: RunHistory,
    /// Number of top-level optimizer asks consumed.
    pub iterations: usize,
    pub jobs_completed: usize,
    pub jobs_failed: usize,
}

impl RunResult {
    pub fn best_loss(&self) -> Option<f64> {
        self.best.as_ref().map(|b| b.loss)
    }
}
