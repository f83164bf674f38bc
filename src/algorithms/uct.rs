// UCT and PUCT: upper-confidence selection over empirical means
//
// Both share the same node scalars (a running mean per node) and differ
// only in the exploration term. Unexpanded actions always have priority,
// ties break uniformly at random, and the bias can adapt to the value
// spread at each node in the style of the PROST planner.

use super::common::{
    EmpStats, HasEmpStats, pick_best_action, recommend_best_emp_action,
    recommend_most_visited_action,
};
use super::{Algorithm, AlgorithmParams, BackupView};
use crate::context::TrialContext;
use crate::env::Environment;
use crate::manager::SearchManager;
use crate::node::{
    ChanceInner, ChanceNode, DecisionInner, DecisionNode, lock_chance_children,
};
use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Floor for the adaptive bias when the child values have not spread yet.
pub const AUTO_BIAS_MIN_BIAS: f64 = 0.001;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UctParams {
    /// Exploration bias; `None` selects the adaptive bias
    /// `max(0.001, max_child_value - min_child_value)`.
    pub bias: Option<f64>,
    /// Weight of the heuristic as this many phantom trials on new nodes.
    /// Zero ignores the heuristic entirely.
    pub heuristic_pseudo_trials: usize,
    /// Recommend the most visited child instead of the empirical best.
    pub recommend_most_visited: bool,
    /// Probability of selecting a uniformly random action instead of the
    /// confidence-bound argmax.
    pub epsilon_exploration: f64,
}

impl Default for UctParams {
    fn default() -> Self {
        UctParams {
            bias: None,
            heuristic_pseudo_trials: 0,
            recommend_most_visited: true,
            epsilon_exploration: 0.0,
        }
    }
}

impl AlgorithmParams for UctParams {
    fn validate(&self) -> Result<()> {
        if let Some(bias) = self.bias {
            ensure!(bias > 0.0, "uct bias must be positive (or None for auto)");
        }
        ensure!(
            (0.0..=1.0).contains(&self.epsilon_exploration),
            "epsilon_exploration must lie in [0,1]"
        );
        Ok(())
    }
}

pub struct UctDecisionData<E: Environment> {
    pub emp: EmpStats,
    /// Prior policy over the valid actions; only consulted by PUCT.
    pub prior: Option<HashMap<E::Action, f64>>,
}

pub struct UctChanceData {
    pub emp: EmpStats,
}

impl<E: Environment> HasEmpStats for UctDecisionData<E> {
    fn emp(&self) -> &EmpStats {
        &self.emp
    }
    fn emp_mut(&mut self) -> &mut EmpStats {
        &mut self.emp
    }
}

impl HasEmpStats for UctChanceData {
    fn emp(&self) -> &EmpStats {
        &self.emp
    }
    fn emp_mut(&mut self) -> &mut EmpStats {
        &mut self.emp
    }
}

#[derive(Clone, Copy)]
pub(crate) enum ExploreTerm {
    /// bias * sqrt(ln N / N_a)
    ConfidenceBound,
    /// bias * pi(a|s) * sqrt(N) / (1 + N_a)
    PriorWeighted,
}

/// Shared UCT-family selection. Assumes the node lock is held.
pub(crate) fn select_action_uct<E, A>(
    node: &DecisionNode<E, A>,
    inner: &DecisionInner<E, A>,
    params: &UctParams,
    prior: Option<&HashMap<E::Action, f64>>,
    term: ExploreTerm,
) -> Result<E::Action>
where
    E: Environment,
    A: Algorithm<E>,
    A::ChanceData: HasEmpStats,
{
    let actions = node.actions();
    ensure!(!actions.is_empty(), "select_action on a node without actions");
    let manager = node.manager();

    let unexpanded: Vec<&E::Action> = actions
        .iter()
        .filter(|action| !inner.children.contains_key(*action))
        .collect();
    if !unexpanded.is_empty() {
        let index = manager.rand_int(0, unexpanded.len());
        return Ok(unexpanded[index].clone());
    }

    if params.epsilon_exploration > 0.0 && manager.rand_uniform() < params.epsilon_exploration {
        let index = manager.rand_int(0, actions.len());
        return Ok(actions[index].clone());
    }

    let opponent_coeff = node.opponent_coeff();
    let parent_visits = inner.num_visits as f64;
    let guards = lock_chance_children(inner);
    let values: Vec<(&E::Action, f64, usize)> = guards
        .iter()
        .map(|(action, _, guard)| {
            (*action, opponent_coeff * guard.data.emp().avg_return, guard.num_visits)
        })
        .collect();

    let bias = match params.bias {
        Some(bias) => bias,
        None => {
            let max = values.iter().map(|(_, v, _)| *v).fold(f64::NEG_INFINITY, f64::max);
            let min = values.iter().map(|(_, v, _)| *v).fold(f64::INFINITY, f64::min);
            (max - min).max(AUTO_BIAS_MIN_BIAS)
        }
    };

    let scored: Vec<(&E::Action, f64)> = values
        .iter()
        .map(|(action, value, child_visits)| {
            if *child_visits == 0 {
                return (*action, f64::INFINITY);
            }
            let explore = match term {
                ExploreTerm::ConfidenceBound => {
                    bias * (parent_visits.ln() / *child_visits as f64).sqrt()
                }
                ExploreTerm::PriorWeighted => {
                    let prior_prob = prior
                        .and_then(|prior| prior.get(*action).copied())
                        .unwrap_or(0.0);
                    bias * prior_prob * parent_visits.sqrt() / (1.0 + *child_visits as f64)
                }
            };
            (*action, value + explore)
        })
        .collect();
    pick_best_action(manager, &scored)
}

pub(crate) fn recommend_action_uct<E, A>(
    node: &DecisionNode<E, A>,
    inner: &DecisionInner<E, A>,
    params: &UctParams,
) -> Result<E::Action>
where
    E: Environment,
    A: Algorithm<E>,
    A::ChanceData: HasEmpStats,
{
    if params.recommend_most_visited {
        recommend_most_visited_action(node, inner)
    } else {
        recommend_best_emp_action(node, inner, 0)
    }
}

pub struct Uct;

impl<E: Environment> Algorithm<E> for Uct {
    type Params = UctParams;
    type DecisionData = UctDecisionData<E>;
    type ChanceData = UctChanceData;
    type Context = ();

    fn decision_data(
        manager: &SearchManager<E, Self>,
        _state: &E::State,
        _actions: &[E::Action],
        heuristic_value: f64,
        _parent: Option<(&ChanceNode<E, Self>, &ChanceInner<E, Self>)>,
    ) -> Self::DecisionData {
        UctDecisionData {
            emp: EmpStats::new(manager.params.heuristic_pseudo_trials, heuristic_value),
            prior: None,
        }
    }

    fn chance_data(
        manager: &SearchManager<E, Self>,
        _parent: &DecisionNode<E, Self>,
        _parent_inner: &DecisionInner<E, Self>,
        _action: &E::Action,
        _local_reward: f64,
        heuristic_value: f64,
    ) -> Self::ChanceData {
        UctChanceData {
            emp: EmpStats::new(manager.params.heuristic_pseudo_trials, heuristic_value),
        }
    }

    fn select_action(
        node: &DecisionNode<E, Self>,
        inner: &mut DecisionInner<E, Self>,
        _ctx: &mut TrialContext<E, Self>,
    ) -> Result<E::Action> {
        select_action_uct(node, inner, &node.manager().params, None, ExploreTerm::ConfidenceBound)
    }

    fn backup_chance(
        _node: &ChanceNode<E, Self>,
        inner: &mut ChanceInner<E, Self>,
        backup: &BackupView<'_>,
        _ctx: &mut TrialContext<E, Self>,
    ) -> Result<()> {
        inner.data.emp.update(backup.total_return_after);
        Ok(())
    }

    fn backup_decision(
        _node: &DecisionNode<E, Self>,
        inner: &mut DecisionInner<E, Self>,
        backup: &BackupView<'_>,
        _ctx: &mut TrialContext<E, Self>,
    ) -> Result<()> {
        inner.data.emp.update(backup.total_return_after);
        Ok(())
    }

    fn recommend_action(
        node: &DecisionNode<E, Self>,
        inner: &DecisionInner<E, Self>,
    ) -> Result<E::Action> {
        recommend_action_uct(node, inner, &node.manager().params)
    }

    fn decision_value(data: &Self::DecisionData) -> f64 {
        data.emp.avg_return
    }

    fn chance_value(data: &Self::ChanceData) -> f64 {
        data.emp.avg_return
    }
}

/// PUCT: UCT with the exploration term weighted by a prior policy. Without
/// a prior hook on the manager the prior defaults to uniform, which reduces
/// the exploration term to a visit-count schedule.
pub struct Puct;

impl<E: Environment> Algorithm<E> for Puct {
    type Params = UctParams;
    type DecisionData = UctDecisionData<E>;
    type ChanceData = UctChanceData;
    type Context = ();

    fn decision_data(
        manager: &SearchManager<E, Self>,
        state: &E::State,
        actions: &[E::Action],
        heuristic_value: f64,
        _parent: Option<(&ChanceNode<E, Self>, &ChanceInner<E, Self>)>,
    ) -> Self::DecisionData {
        let prior = manager.prior_policy(state).or_else(|| {
            if actions.is_empty() {
                return None;
            }
            let uniform = 1.0 / actions.len() as f64;
            Some(actions.iter().map(|action| (action.clone(), uniform)).collect())
        });
        UctDecisionData {
            emp: EmpStats::new(manager.params.heuristic_pseudo_trials, heuristic_value),
            prior,
        }
    }

    fn chance_data(
        manager: &SearchManager<E, Self>,
        _parent: &DecisionNode<E, Self>,
        _parent_inner: &DecisionInner<E, Self>,
        _action: &E::Action,
        _local_reward: f64,
        heuristic_value: f64,
    ) -> Self::ChanceData {
        UctChanceData {
            emp: EmpStats::new(manager.params.heuristic_pseudo_trials, heuristic_value),
        }
    }

    fn select_action(
        node: &DecisionNode<E, Self>,
        inner: &mut DecisionInner<E, Self>,
        _ctx: &mut TrialContext<E, Self>,
    ) -> Result<E::Action> {
        let inner = &*inner;
        select_action_uct(
            node,
            inner,
            &node.manager().params,
            inner.data.prior.as_ref(),
            ExploreTerm::PriorWeighted,
        )
    }

    fn backup_chance(
        _node: &ChanceNode<E, Self>,
        inner: &mut ChanceInner<E, Self>,
        backup: &BackupView<'_>,
        _ctx: &mut TrialContext<E, Self>,
    ) -> Result<()> {
        inner.data.emp.update(backup.total_return_after);
        Ok(())
    }

    fn backup_decision(
        _node: &DecisionNode<E, Self>,
        inner: &mut DecisionInner<E, Self>,
        backup: &BackupView<'_>,
        _ctx: &mut TrialContext<E, Self>,
    ) -> Result<()> {
        inner.data.emp.update(backup.total_return_after);
        Ok(())
    }

    fn recommend_action(
        node: &DecisionNode<E, Self>,
        inner: &DecisionInner<E, Self>,
    ) -> Result<E::Action> {
        recommend_action_uct(node, inner, &node.manager().params)
    }

    fn decision_value(data: &Self::DecisionData) -> f64 {
        data.emp.avg_return
    }

    fn chance_value(data: &Self::ChanceData) -> f64 {
        data.emp.avg_return
    }
}
