// empirical-average return backups
//
// Identical at decision and chance nodes: a running mean over the
// cumulative return observed below the node. Heuristic pseudo-trials seed
// the mean so a fresh node starts from its heuristic value instead of zero.

use crate::algorithms::Algorithm;
use crate::env::Environment;
use crate::node::{DecisionInner, DecisionNode, lock_chance_children};
use anyhow::Result;

#[derive(Clone, Copy, Debug)]
pub struct EmpStats {
    pub num_backups: usize,
    pub avg_return: f64,
}

impl EmpStats {
    pub fn new(pseudo_trials: usize, heuristic_value: f64) -> Self {
        EmpStats {
            num_backups: pseudo_trials,
            avg_return: if pseudo_trials > 0 { heuristic_value } else { 0.0 },
        }
    }

    /// Folds one trial return into the running mean.
    pub fn update(&mut self, trial_return: f64) {
        self.num_backups += 1;
        self.avg_return += (trial_return - self.avg_return) / self.num_backups as f64;
    }
}

pub trait HasEmpStats {
    fn emp(&self) -> &EmpStats;
    fn emp_mut(&mut self) -> &mut EmpStats;
}

/// Empirical-best recommendation with a visit threshold; falls back to all
/// children when nothing clears the threshold. Ties break randomly.
pub fn recommend_best_emp_action<E, A>(
    node: &DecisionNode<E, A>,
    inner: &DecisionInner<E, A>,
    visit_threshold: usize,
) -> Result<E::Action>
where
    E: Environment,
    A: Algorithm<E>,
    A::ChanceData: HasEmpStats,
{
    let opponent_coeff = node.opponent_coeff();
    let guards = lock_chance_children(inner);
    let mut scored: Vec<(&E::Action, f64)> = guards
        .iter()
        .filter(|(_, _, guard)| guard.num_visits >= visit_threshold)
        .map(|(action, _, guard)| (*action, opponent_coeff * guard.data.emp().avg_return))
        .collect();
    if scored.is_empty() {
        scored = guards
            .iter()
            .map(|(action, _, guard)| (*action, opponent_coeff * guard.data.emp().avg_return))
            .collect();
    }
    super::pick_best_action(node.manager(), &scored)
}

/// Most-visited-child recommendation, the UCT default.
pub fn recommend_most_visited_action<E, A>(
    node: &DecisionNode<E, A>,
    inner: &DecisionInner<E, A>,
) -> Result<E::Action>
where
    E: Environment,
    A: Algorithm<E>,
{
    let guards = lock_chance_children(inner);
    let scored: Vec<(&E::Action, f64)> = guards
        .iter()
        .map(|(action, _, guard)| (*action, guard.num_visits as f64))
        .collect();
    super::pick_best_action(node.manager(), &scored)
}
