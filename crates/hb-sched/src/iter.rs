//! Iteration plans: the (budget, survivor-count) rung schedules consumed by
//! the master.
//!
//! A generator is pure planning state, no I/O: it deterministically yields
//! one [`Bracket`] after another, forever. The master decides when to stop
//! asking for more.

use serde::{Deserialize, Serialize};

use hb_types::{ConfigError, HbResult};

/// One budget level within a bracket, with its target configuration count.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rung {
    pub budget: f64,
    pub n_configs: usize,
}

/// An ordered successive-halving schedule: strictly increasing budgets,
/// non-increasing configuration counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bracket {
    /// Position in the generator's output sequence, starting at 0.
    pub index: usize,
    pub rungs: Vec<Rung>,
}

impl Bracket {
    /// Check the bracket invariants. Generators uphold these by
    /// construction; custom schedules are validated at build time.
    pub fn validate(&self) -> HbResult<()> {
        if self.rungs.is_empty() {
            return Err(ConfigError::EmptySchedule.into());
        }
        for pair in self.rungs.windows(2) {
            if pair[1].budget <= pair[0].budget {
                return Err(ConfigError::Invalid {
                    message: format!(
                        "rung budgets must be strictly increasing, got {} then {}",
                        pair[0].budget, pair[1].budget
                    ),
                }
                .into());
            }
            if pair[1].n_configs > pair[0].n_configs {
                return Err(ConfigError::Invalid {
                    message: format!(
                        "rung config counts must be non-increasing, got {} then {}",
                        pair[0].n_configs, pair[1].n_configs
                    ),
                }
                .into());
            }
        }
        Ok(())
    }

    pub fn max_budget(&self) -> f64 {
        self.rungs.last().map(|r| r.budget).unwrap_or(0.0)
    }
}

/// Produces the sequence of brackets for one optimization run.
pub trait IterGenerator: Send {
    /// The distinct budget levels this generator will ever schedule,
    /// ascending. The optimizer is initialized with exactly this set.
    fn budgets(&self) -> Vec<f64>;

    /// The next bracket in the sequence. Infinite and lazy.
    fn next_bracket(&mut self) -> Bracket;

    /// Restart from bracket index 0. Used when a run is resumed; never
    /// called mid-bracket.
    fn reset(&mut self);
}

// ---- Hyperband ----

/// Canonical Hyperband outer loop over successive-halving brackets.
///
/// Budgets are the geometric ladder `min_budget * eta^k` up to
/// `max_budget`. Bracket `s` (for `s = s_max, s_max-1, .., 0`) starts with
/// `n0 = ceil((s_max+1)/(s+1) * eta^s)` configurations at budget
/// `max_budget * eta^-s`; each rung divides the survivor count by `eta`
/// and multiplies the budget by `eta` until `max_budget` is reached.
#[derive(Debug, Clone)]
pub struct HyperbandIterGenerator {
    eta: f64,
    s_max: usize,
    /// Precomputed ladder so rung budgets are bit-identical to `budgets()`.
    ladder: Vec<f64>,
    /// Next bracket's `s` value, counting down; wraps back to `s_max`.
    next_s: usize,
    emitted: usize,
}

impl HyperbandIterGenerator {
    pub fn new(min_budget: f64, max_budget: f64, eta: f64) -> HbResult<Self> {
        if !eta.is_finite() || eta <= 1.0 {
            return Err(ConfigError::InvalidEta { eta }.into());
        }
        if !min_budget.is_finite() || !max_budget.is_finite() || min_budget <= 0.0 {
            return Err(ConfigError::Invalid {
                message: format!("budgets must be finite and positive, got [{min_budget}, {max_budget}]"),
            }
            .into());
        }
        if max_budget < min_budget {
            return Err(ConfigError::InvalidBudgetRange {
                min: min_budget,
                max: max_budget,
            }
            .into());
        }

        // Small epsilon guards against 80.999999 style float error in the log.
        let s_max = ((max_budget / min_budget).ln() / eta.ln() + 1e-9).floor() as usize;
        let ladder: Vec<f64> = (0..=s_max).map(|k| min_budget * eta.powi(k as i32)).collect();

        Ok(Self {
            eta,
            s_max,
            ladder,
            next_s: s_max,
            emitted: 0,
        })
    }

    fn bracket_for(&self, s: usize, index: usize) -> Bracket {
        let n0 = ((self.s_max + 1) as f64 / (s + 1) as f64 * self.eta.powi(s as i32)).ceil();
        let rungs = (0..=s)
            .map(|j| {
                let n = (n0 * self.eta.powi(-(j as i32))).floor().max(1.0) as usize;
                Rung {
                    budget: self.ladder[self.s_max - s + j],
                    n_configs: n,
                }
            })
            .collect();
        Bracket { index, rungs }
    }
}

impl IterGenerator for HyperbandIterGenerator {
    fn budgets(&self) -> Vec<f64> {
        self.ladder.clone()
    }

    fn next_bracket(&mut self) -> Bracket {
        let bracket = self.bracket_for(self.next_s, self.emitted);
        self.emitted += 1;
        self.next_s = if self.next_s == 0 { self.s_max } else { self.next_s - 1 };
        bracket
    }

    fn reset(&mut self) {
        self.next_s = self.s_max;
        self.emitted = 0;
    }
}

// ---- Custom schedule ----

/// Caller-supplied successive-halving schedule: explicit `(n_configs,
/// budget)` pairs, repeated for every bracket. Used for reproducible
/// experiments with fixed schedules.
#[derive(Debug, Clone)]
pub struct CustomIterGenerator {
    rungs: Vec<Rung>,
    emitted: usize,
}

impl CustomIterGenerator {
    pub fn new(n_configs: Vec<usize>, budgets: Vec<f64>) -> HbResult<Self> {
        if n_configs.len() != budgets.len() {
            return Err(ConfigError::MismatchedSchedule {
                n_configs_len: n_configs.len(),
                budgets_len: budgets.len(),
            }
            .into());
        }
        if n_configs.is_empty() {
            return Err(ConfigError::EmptySchedule.into());
        }
        if let Some(&n) = n_configs.iter().find(|&&n| n == 0) {
            return Err(ConfigError::Invalid {
                message: format!("rung config count must be positive, got {n}"),
            }
            .into());
        }
        if let Some(&b) = budgets.iter().find(|b| !b.is_finite() || **b <= 0.0) {
            return Err(ConfigError::Invalid {
                message: format!("rung budgets must be finite and positive, got {b}"),
            }
            .into());
        }

        let rungs: Vec<Rung> = n_configs
            .into_iter()
            .zip(budgets)
            .map(|(n_configs, budget)| Rung { budget, n_configs })
            .collect();

        let generator = Self { rungs, emitted: 0 };
        Bracket {
            index: 0,
            rungs: generator.rungs.clone(),
        }
        .validate()?;
        Ok(generator)
    }

    /// The single-rung schedule used when no multi-fidelity plan is
    /// supplied: one configuration at budget 1 per bracket.
    pub fn single_fidelity() -> Self {
        Self {
            rungs: vec![Rung {
                budget: 1.0,
                n_configs: 1,
            }],
            emitted: 0,
        }
    }
}

impl IterGenerator for CustomIterGenerator {
    fn budgets(&self) -> Vec<f64> {
        self.rungs.iter().map(|r| r.budget).collect()
    }

    fn next_bracket(&mut self) -> Bracket {
        let bracket = Bracket {
            index: self.emitted,
            rungs: self.rungs.clone(),
        };
        self.emitted += 1;
        bracket
    }

    fn reset(&mut self) {
        self.emitted = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hb_types::HbError;

    #[test]
    fn budget_ladder_min1_max81_eta3() {
        let generator = HyperbandIterGenerator::new(1.0, 81.0, 3.0).unwrap();
        assert_eq!(generator.budgets(), vec![1.0, 3.0, 9.0, 27.0, 81.0]);
    }

    #[test]
    fn rejects_invalid_parameters() {
        match HyperbandIterGenerator::new(1.0, 81.0, 1.0) {
            Err(HbError::Config(ConfigError::InvalidEta { eta })) => assert_eq!(eta, 1.0),
            other => panic!("expected InvalidEta, got {other:?}"),
        }
        match HyperbandIterGenerator::new(9.0, 3.0, 3.0) {
            Err(HbError::Config(ConfigError::InvalidBudgetRange { min, max })) => {
                assert_eq!((min, max), (9.0, 3.0));
            }
            other => panic!("expected InvalidBudgetRange, got {other:?}"),
        }
    }

    #[test]
    fn brackets_shrink_and_end_at_max_budget() {
        let mut generator = HyperbandIterGenerator::new(1.0, 81.0, 3.0).unwrap();

        // One full outer loop: s = 4, 3, 2, 1, 0.
        for expected_rungs in [5, 4, 3, 2, 1] {
            let bracket = generator.next_bracket();
            bracket.validate().unwrap();
            assert_eq!(bracket.rungs.len(), expected_rungs);
            assert_eq!(bracket.max_budget(), 81.0);

            for pair in bracket.rungs.windows(2) {
                assert!(pair[1].budget > pair[0].budget);
                assert!(pair[1].n_configs <= pair[0].n_configs);
            }
        }
    }

    #[test]
    fn first_bracket_matches_hyperband_formula() {
        let mut generator = HyperbandIterGenerator::new(1.0, 81.0, 3.0).unwrap();
        let bracket = generator.next_bracket();

        // s_max = 4: n0 = ceil(5/5 * 81) = 81 at budget 1.
        assert_eq!(bracket.rungs[0].n_configs, 81);
        assert_eq!(bracket.rungs[0].budget, 1.0);
        assert_eq!(bracket.rungs[1].n_configs, 27);
        assert_eq!(bracket.rungs[4].n_configs, 1);
        assert_eq!(bracket.rungs[4].budget, 81.0);
    }

    #[test]
    fn outer_loop_wraps_and_resets() {
        let mut generator = HyperbandIterGenerator::new(1.0, 9.0, 3.0).unwrap();

        let first = generator.next_bracket();
        generator.next_bracket();
        generator.next_bracket();

        // s_max = 2, so the fourth bracket wraps back to the widest shape.
        let wrapped = generator.next_bracket();
        assert_eq!(wrapped.rungs, first.rungs);
        assert_eq!(wrapped.index, 3);

        generator.reset();
        let restarted = generator.next_bracket();
        assert_eq!(restarted.rungs, first.rungs);
        assert_eq!(restarted.index, 0);
    }

    #[test]
    fn custom_schedule_round() {
        let mut generator = CustomIterGenerator::new(vec![4, 2, 1], vec![25.0, 50.0, 100.0]).unwrap();
        assert_eq!(generator.budgets(), vec![25.0, 50.0, 100.0]);

        let bracket = generator.next_bracket();
        bracket.validate().unwrap();
        assert_eq!(bracket.rungs[0], Rung { budget: 25.0, n_configs: 4 });
        assert_eq!(bracket.max_budget(), 100.0);

        // Every bracket repeats the supplied schedule.
        let again = generator.next_bracket();
        assert_eq!(again.rungs, bracket.rungs);
        assert_eq!(again.index, 1);
    }

    #[test]
    fn custom_schedule_rejects_mismatched_lengths() {
        match CustomIterGenerator::new(vec![4, 2], vec![25.0, 50.0, 100.0]) {
            Err(HbError::Config(ConfigError::MismatchedSchedule {
                n_configs_len,
                budgets_len,
            })) => {
                assert_eq!((n_configs_len, budgets_len), (2, 3));
            }
            other => panic!("expected MismatchedSchedule, got {other:?}"),
        }

        assert!(CustomIterGenerator::new(vec![], vec![]).is_err());
        assert!(CustomIterGenerator::new(vec![1, 2], vec![1.0, 2.0]).is_err()); // growing counts
        assert!(CustomIterGenerator::new(vec![2, 1], vec![2.0, 1.0]).is_err()); // shrinking budgets
    }

    #[test]
    fn single_fidelity_schedule() {
        let mut generator = CustomIterGenerator::single_fidelity();
        assert_eq!(generator.budgets(), vec![1.0]);
        let bracket = generator.next_bracket();
        assert_eq!(bracket.rungs, vec![Rung { budget: 1.0, n_configs: 1 }]);
    }
}
