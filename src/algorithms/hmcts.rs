// HMCTS: sequential halving above a budget threshold, UCT below it
//
// Decision nodes split their trial budget into halving rounds over a
// shrinking action set; chance nodes split budgets across outcomes
// proportionally to their transition probabilities. Once the budget
// reaching a node drops under the threshold the node behaves like plain
// UCT. Budget flow for stochastic outcomes follows the transition
// probabilities; whether that allocation is principled is an open question
// (see DESIGN.md), the mechanism is kept as is.

use super::common::{EmpStats, HasEmpStats, pick_best_action};
use super::uct::{
    ExploreTerm, UctChanceData, UctDecisionData, UctParams, recommend_action_uct, select_action_uct,
};
use super::{Algorithm, AlgorithmParams, BackupView};
use crate::context::TrialContext;
use crate::env::Environment;
use crate::manager::SearchManager;
use crate::node::{
    ChanceInner, ChanceNode, DecisionInner, DecisionNode, lock_chance_children,
    lock_decision_children,
};
use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HmctsParams {
    pub uct: UctParams,
    /// Total number of trials the search will run. Required; sequential
    /// halving cannot split an unknown budget.
    pub total_budget: usize,
    /// Budgets at or below this threshold fall back to UCT selection.
    pub uct_budget_threshold: usize,
}

impl Default for HmctsParams {
    fn default() -> Self {
        HmctsParams {
            uct: UctParams::default(),
            total_budget: 0,
            uct_budget_threshold: 100,
        }
    }
}

impl AlgorithmParams for HmctsParams {
    fn validate(&self) -> Result<()> {
        self.uct.validate()?;
        ensure!(
            self.total_budget > 0,
            "total_budget is a required parameter for sequential halving"
        );
        Ok(())
    }
}

pub struct HmctsDecisionData<E: Environment> {
    pub uct: UctDecisionData<E>,
    pub(crate) total_budget: usize,
    budget_on_last_visit: usize,
    /// Cumulative per-action visit target of the current halving round.
    round_target: usize,
    pub(crate) round_budget_per_action: usize,
    pub(crate) round_actions: Vec<E::Action>,
}

pub struct HmctsChanceData<E: Environment> {
    pub uct: UctChanceData,
    pub(crate) total_budget: usize,
    budget_on_last_visit: usize,
    budget_per_child: HashMap<E::Observation, usize>,
}

impl<E: Environment> HasEmpStats for HmctsDecisionData<E> {
    fn emp(&self) -> &EmpStats {
        &self.uct.emp
    }
    fn emp_mut(&mut self) -> &mut EmpStats {
        &mut self.uct.emp
    }
}

impl<E: Environment> HasEmpStats for HmctsChanceData<E> {
    fn emp(&self) -> &EmpStats {
        &self.uct.emp
    }
    fn emp_mut(&mut self) -> &mut EmpStats {
        &mut self.uct.emp
    }
}

fn halving_rounds(num_actions: usize) -> usize {
    (num_actions.max(2) as f64).log2().ceil() as usize
}

pub struct Hmcts;

impl Hmcts {
    fn running_seq_halving<E: Environment>(
        manager: &SearchManager<E, Self>,
        total_budget: usize,
    ) -> bool {
        total_budget > manager.params.uct_budget_threshold
    }

    /// Hands the current per-action budget to every chance child that
    /// already exists. Children created later read it off the parent at
    /// construction instead. Called whenever the round budget moves: on a
    /// budget bump from above and at every halving-round transition.
    fn push_round_budget_to_children<E: Environment>(inner: &mut DecisionInner<E, Self>) {
        let budget = inner.data.round_budget_per_action;
        for (_, _, mut guard) in lock_chance_children(inner) {
            guard.data.total_budget = budget;
        }
    }

    /// Re-derives the halving round whenever the budget reaching this node
    /// changed (the parent chance node bumps `total_budget` on its own
    /// re-splits), and pushes the per-action budget down.
    fn update_decision_budgets<E: Environment>(
        node: &DecisionNode<E, Self>,
        inner: &mut DecisionInner<E, Self>,
    ) {
        if inner.data.total_budget == inner.data.budget_on_last_visit
            && !inner.data.round_actions.is_empty()
        {
            return;
        }
        inner.data.budget_on_last_visit = inner.data.total_budget;
        if inner.data.round_actions.is_empty() {
            inner.data.round_actions = node.actions().to_vec();
            inner.data.round_target = 0;
        }
        let rounds = halving_rounds(node.actions().len());
        let per_action = (inner.data.total_budget
            / (inner.data.round_actions.len() * rounds).max(1))
        .max(1);
        inner.data.round_budget_per_action = per_action;
        inner.data.round_target = inner.data.round_target.max(per_action);
        Self::push_round_budget_to_children(inner);
    }

    /// Picks the round action with the fewest visits; halves the action set
    /// whenever every remaining action reached the round target.
    fn select_action_sequential_halving<E: Environment>(
        node: &DecisionNode<E, Self>,
        inner: &mut DecisionInner<E, Self>,
    ) -> Result<E::Action> {
        let opponent_coeff = node.opponent_coeff();
        loop {
            if inner.data.round_actions.len() == 1 {
                return Ok(inner.data.round_actions[0].clone());
            }

            let (visits, means): (HashMap<E::Action, usize>, HashMap<E::Action, f64>) = {
                let guards = lock_chance_children(&*inner);
                let visits = guards
                    .iter()
                    .map(|(action, _, guard)| ((*action).clone(), guard.num_visits))
                    .collect();
                let means = guards
                    .iter()
                    .map(|(action, _, guard)| {
                        ((*action).clone(), opponent_coeff * guard.data.uct.emp.avg_return)
                    })
                    .collect();
                (visits, means)
            };

            let scored: Vec<(&E::Action, f64)> = inner
                .data
                .round_actions
                .iter()
                .map(|action| {
                    let action_visits = visits.get(action).copied().unwrap_or(0);
                    (action, -(action_visits as f64))
                })
                .collect();
            let fewest_visited = pick_best_action(node.manager(), &scored)?;
            let fewest_visits = visits.get(&fewest_visited).copied().unwrap_or(0);
            if fewest_visits < inner.data.round_target {
                return Ok(fewest_visited);
            }

            // round complete: keep the top half by empirical mean and hand
            // the survivors their grown share of the budget
            let mut ranked: Vec<E::Action> = inner.data.round_actions.clone();
            ranked.sort_by(|a, b| {
                let mean_a = means.get(a).copied().unwrap_or(f64::NEG_INFINITY);
                let mean_b = means.get(b).copied().unwrap_or(f64::NEG_INFINITY);
                mean_b.total_cmp(&mean_a)
            });
            ranked.truncate(ranked.len().div_ceil(2));
            let rounds = halving_rounds(node.actions().len());
            let per_action =
                (inner.data.total_budget / (ranked.len() * rounds).max(1)).max(1);
            inner.data.round_actions = ranked;
            inner.data.round_budget_per_action = per_action;
            inner.data.round_target += per_action;
            Self::push_round_budget_to_children(inner);
        }
    }

    /// Hands each existing decision child its probability-proportional
    /// slice of the budget; later children read it off `budget_per_child`
    /// at construction.
    fn push_outcome_budgets_to_children<E: Environment>(inner: &mut ChanceInner<E, Self>) {
        let budgets = inner.data.budget_per_child.clone();
        for (observation, _, mut guard) in lock_decision_children(inner) {
            if let Some(budget) = budgets.get(observation) {
                guard.data.total_budget = *budget;
            }
        }
    }

    /// Re-splits the budget over outcomes whenever the parent decision
    /// node handed down a new one (which it does at every halving-round
    /// transition), then pushes the slices into the existing children.
    fn update_chance_budgets<E: Environment>(
        node: &ChanceNode<E, Self>,
        inner: &mut ChanceInner<E, Self>,
    ) -> Result<()> {
        if inner.data.total_budget == inner.data.budget_on_last_visit {
            return Ok(());
        }
        inner.data.budget_on_last_visit = inner.data.total_budget;
        let total_budget = inner.data.total_budget;
        let budget_per_child: HashMap<E::Observation, usize> = node
            .transition_distribution(inner)?
            .iter()
            .map(|(state, prob)| {
                let observation: E::Observation = state.clone().into();
                (observation, (prob * total_budget as f64).ceil() as usize)
            })
            .collect();
        inner.data.budget_per_child = budget_per_child;
        Self::push_outcome_budgets_to_children(inner);
        Ok(())
    }

    /// Budgeted outcome choice: untried outcomes first, then the outcome
    /// with the most probability-normalised budget left.
    fn sample_observation_budgeted<E: Environment>(
        node: &ChanceNode<E, Self>,
        inner: &mut ChanceInner<E, Self>,
    ) -> Result<E::Observation> {
        let outcomes: Vec<(E::Observation, f64)> = node
            .transition_distribution(inner)?
            .iter()
            .map(|(state, prob)| (E::Observation::from(state.clone()), *prob))
            .collect();

        let untried: Vec<&E::Observation> = outcomes
            .iter()
            .map(|(observation, _)| observation)
            .filter(|observation| !inner.children.contains_key(*observation))
            .collect();
        if !untried.is_empty() {
            let index = node.manager().rand_int(0, untried.len());
            return Ok(untried[index].clone());
        }

        let child_visits: HashMap<E::Observation, usize> = {
            let guards = lock_decision_children(&*inner);
            guards
                .iter()
                .map(|(observation, _, guard)| ((*observation).clone(), guard.num_visits))
                .collect()
        };
        let scored: Vec<(&E::Observation, f64)> = outcomes
            .iter()
            .map(|(observation, prob)| {
                let budget = inner.data.budget_per_child.get(observation).copied().unwrap_or(0);
                let visits = child_visits.get(observation).copied().unwrap_or(0);
                (observation, (budget as f64 - visits as f64) / prob)
            })
            .collect();

        let best_value = scored
            .iter()
            .map(|(_, value)| *value)
            .fold(f64::NEG_INFINITY, f64::max);
        let best: Vec<&E::Observation> = scored
            .iter()
            .filter(|(_, value)| *value >= best_value)
            .map(|(observation, _)| *observation)
            .collect();
        let index = node.manager().rand_int(0, best.len());
        Ok(best[index].clone())
    }
}

impl<E: Environment> Algorithm<E> for Hmcts {
    type Params = HmctsParams;
    type DecisionData = HmctsDecisionData<E>;
    type ChanceData = HmctsChanceData<E>;
    type Context = ();

    fn decision_data(
        manager: &SearchManager<E, Self>,
        state: &E::State,
        _actions: &[E::Action],
        heuristic_value: f64,
        parent: Option<(&ChanceNode<E, Self>, &ChanceInner<E, Self>)>,
    ) -> Self::DecisionData {
        // the budget this child inherits was computed by its parent from
        // the transition probabilities, keyed by our observation
        let total_budget = match parent {
            Some((_, parent_inner)) => {
                let observation: E::Observation = state.clone().into();
                parent_inner
                    .data
                    .budget_per_child
                    .get(&observation)
                    .copied()
                    .unwrap_or(0)
            }
            None => 0,
        };
        HmctsDecisionData {
            uct: UctDecisionData {
                emp: EmpStats::new(manager.params.uct.heuristic_pseudo_trials, heuristic_value),
                prior: None,
            },
            total_budget,
            budget_on_last_visit: 0,
            round_target: 0,
            round_budget_per_action: 0,
            round_actions: Vec::new(),
        }
    }

    fn chance_data(
        manager: &SearchManager<E, Self>,
        _parent: &DecisionNode<E, Self>,
        parent_inner: &DecisionInner<E, Self>,
        _action: &E::Action,
        _local_reward: f64,
        heuristic_value: f64,
    ) -> Self::ChanceData {
        HmctsChanceData {
            uct: UctChanceData {
                emp: EmpStats::new(manager.params.uct.heuristic_pseudo_trials, heuristic_value),
            },
            total_budget: parent_inner.data.round_budget_per_action,
            budget_on_last_visit: 0,
            budget_per_child: HashMap::new(),
        }
    }

    fn visit_decision(
        node: &DecisionNode<E, Self>,
        inner: &mut DecisionInner<E, Self>,
        _ctx: &mut TrialContext<E, Self>,
    ) -> Result<()> {
        let manager = node.manager();
        if node.is_root() {
            inner.data.total_budget = manager.params.total_budget;
        }
        if Self::running_seq_halving(manager, inner.data.total_budget) {
            Self::update_decision_budgets(node, inner);
        }
        Ok(())
    }

    fn select_action(
        node: &DecisionNode<E, Self>,
        inner: &mut DecisionInner<E, Self>,
        _ctx: &mut TrialContext<E, Self>,
    ) -> Result<E::Action> {
        let manager = node.manager();
        if Self::running_seq_halving(manager, inner.data.total_budget) {
            Self::select_action_sequential_halving(node, inner)
        } else {
            select_action_uct(
                node,
                inner,
                &manager.params.uct,
                None,
                ExploreTerm::ConfidenceBound,
            )
        }
    }

    fn visit_chance(
        node: &ChanceNode<E, Self>,
        inner: &mut ChanceInner<E, Self>,
        _ctx: &mut TrialContext<E, Self>,
    ) -> Result<()> {
        if Self::running_seq_halving(node.manager(), inner.data.total_budget) {
            Self::update_chance_budgets(node, inner)?;
        }
        Ok(())
    }

    fn sample_observation(
        node: &ChanceNode<E, Self>,
        inner: &mut ChanceInner<E, Self>,
        _ctx: &mut TrialContext<E, Self>,
    ) -> Result<E::Observation> {
        if Self::running_seq_halving(node.manager(), inner.data.total_budget) {
            Self::sample_observation_budgeted(node, inner)
        } else {
            let manager = node.manager();
            Ok(manager.rng().with_rng(|rng| {
                let next_state = manager.env.sample_transition(node.state(), node.action(), rng);
                manager.env.sample_observation(node.action(), &next_state, rng)
            }))
        }
    }

    fn backup_chance(
        _node: &ChanceNode<E, Self>,
        inner: &mut ChanceInner<E, Self>,
        backup: &BackupView<'_>,
        _ctx: &mut TrialContext<E, Self>,
    ) -> Result<()> {
        inner.data.uct.emp.update(backup.total_return_after);
        Ok(())
    }

    fn backup_decision(
        _node: &DecisionNode<E, Self>,
        inner: &mut DecisionInner<E, Self>,
        backup: &BackupView<'_>,
        _ctx: &mut TrialContext<E, Self>,
    ) -> Result<()> {
        inner.data.uct.emp.update(backup.total_return_after);
        Ok(())
    }

    fn recommend_action(
        node: &DecisionNode<E, Self>,
        inner: &DecisionInner<E, Self>,
    ) -> Result<E::Action> {
        recommend_action_uct(node, inner, &node.manager().params.uct)
    }

    fn decision_value(data: &Self::DecisionData) -> f64 {
        data.uct.emp.avg_return
    }

    fn chance_value(data: &Self::ChanceData) -> f64 {
        data.uct.emp.avg_return
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halving_rounds_cover_the_action_count() {
        assert_eq!(halving_rounds(2), 1);
        assert_eq!(halving_rounds(4), 2);
        assert_eq!(halving_rounds(5), 3);
        // degenerate single-action nodes still get one round
        assert_eq!(halving_rounds(1), 1);
    }

    #[test]
    fn missing_total_budget_fails_validation() {
        let params = HmctsParams::default();
        assert!(params.validate().is_err());
        let params = HmctsParams {
            total_budget: 1000,
            ..HmctsParams::default()
        };
        assert!(params.validate().is_ok());
    }
}
