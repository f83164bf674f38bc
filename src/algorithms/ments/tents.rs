// TENTS: Tsallis-entropy tree search
//
// Selection and backup work on a sparse subset of actions computed from
// cached Q/temp values. The cache is refreshed one action per backup (the
// action the trial actually selected, remembered in the trial context), so
// concurrent trials may read slightly stale values; that staleness is the
// price of not locking every child on every visit.

use super::{
    MentsParams, SoftChanceData, SoftDecisionData, backup_soft_chance, distribution_from_weights,
    recommend_best_soft_action, sample_action,
};
use crate::algorithms::common::recommend_most_visited_action;
use crate::algorithms::{Algorithm, BackupView};
use crate::context::TrialContext;
use crate::env::Environment;
use crate::manager::SearchManager;
use crate::node::{ChanceInner, ChanceNode, DecisionInner, DecisionNode};
use anyhow::{Result, ensure};
use itertools::Itertools;
use std::collections::HashMap;

pub struct TentsContext<E: Environment> {
    /// Action selected at each decision depth of the current trial.
    pub selected: HashMap<usize, E::Action>,
}

impl<E: Environment> Default for TentsContext<E> {
    fn default() -> Self {
        TentsContext {
            selected: HashMap::new(),
        }
    }
}

pub struct TentsDecisionData<E: Environment> {
    pub soft: SoftDecisionData<E>,
    /// Cached Q/temp per action, refreshed at backup time.
    pub q_over_temp: HashMap<E::Action, f64>,
}

impl<E: Environment> super::HasSoftDecisionData<E> for TentsDecisionData<E> {
    fn soft(&self) -> &SoftDecisionData<E> {
        &self.soft
    }
    fn soft_mut(&mut self) -> &mut SoftDecisionData<E> {
        &mut self.soft
    }
}

impl<E: Environment> TentsDecisionData<E> {
    fn cached_q_over_temp(&self, params: &MentsParams, action: &E::Action) -> f64 {
        match self.q_over_temp.get(action) {
            Some(q) => *q,
            None => self.soft.pseudo_q_value(params, action) / params.temp,
        }
    }
}

/// Largest k such that `1 + k*q_k > sum of the k largest q` over the descending
/// Q/temp values; returns the sparse action set.
fn sparse_action_set<Action: Clone>(scored: Vec<(Action, f64)>) -> Vec<(Action, f64)> {
    let mut scored: Vec<(Action, f64)> = scored
        .into_iter()
        .sorted_by(|a, b| b.1.total_cmp(&a.1))
        .collect();
    let mut running_sum = 0.0;
    let mut cutoff = 0;
    for (index, (_, q)) in scored.iter().enumerate() {
        let k = (index + 1) as f64;
        running_sum += q;
        if 1.0 + k * q > running_sum {
            cutoff = index + 1;
        } else {
            break;
        }
    }
    scored.truncate(cutoff.max(1));
    scored
}

/// spmax over the sparse set: `(sum q)^2/|K| - (sum q^2 - 1)/(2|K|)`.
fn spmax<Action>(sparse_set: &[(Action, f64)]) -> f64 {
    let k = sparse_set.len() as f64;
    let sum: f64 = sparse_set.iter().map(|(_, q)| q).sum();
    let sum_sq: f64 = sparse_set.iter().map(|(_, q)| q * q).sum();
    sum * sum / k - (sum_sq - 1.0) / (2.0 * k)
}

/// Sparse selection weight: `max(0, q(a) - (sum _K q - 1)/|K|)`.
fn sparse_weights<Action: Clone>(
    scored: &[(Action, f64)],
    sparse_set: &[(Action, f64)],
) -> Vec<(Action, f64)> {
    let k = sparse_set.len() as f64;
    let sparse_sum: f64 = sparse_set.iter().map(|(_, q)| q).sum();
    let threshold = (sparse_sum - 1.0) / k;
    scored
        .iter()
        .map(|(action, q)| (action.clone(), (q - threshold).max(0.0)))
        .collect()
}

pub struct Tents;

impl<E: Environment> Algorithm<E> for Tents {
    type Params = MentsParams;
    type DecisionData = TentsDecisionData<E>;
    type ChanceData = SoftChanceData;
    type Context = TentsContext<E>;

    fn decision_data(
        manager: &SearchManager<E, Self>,
        state: &E::State,
        actions: &[E::Action],
        heuristic_value: f64,
        _parent: Option<(&ChanceNode<E, Self>, &ChanceInner<E, Self>)>,
    ) -> Self::DecisionData {
        let prior = manager.prior_policy(state);
        TentsDecisionData {
            soft: SoftDecisionData::new(&manager.params, prior, actions, heuristic_value),
            q_over_temp: HashMap::new(),
        }
    }

    fn chance_data(
        _manager: &SearchManager<E, Self>,
        _parent: &DecisionNode<E, Self>,
        _parent_inner: &DecisionInner<E, Self>,
        _action: &E::Action,
        _local_reward: f64,
        heuristic_value: f64,
    ) -> Self::ChanceData {
        SoftChanceData {
            stats: super::SoftStats::new(heuristic_value),
        }
    }

    fn select_action(
        node: &DecisionNode<E, Self>,
        inner: &mut DecisionInner<E, Self>,
        ctx: &mut TrialContext<E, Self>,
    ) -> Result<E::Action> {
        ensure!(
            !node.actions().is_empty(),
            "select_action on a node without actions"
        );
        let params = &node.manager().params;
        let action = {
            let inner = &*inner;
            let scored: Vec<(E::Action, f64)> = node
                .actions()
                .iter()
                .map(|action| (action.clone(), inner.data.cached_q_over_temp(params, action)))
                .collect();
            let sparse_set = sparse_action_set(scored.clone());
            let weights = sparse_weights(&scored, &sparse_set);
            let distribution = distribution_from_weights(
                node,
                inner.num_visits,
                inner.data.soft.prior.as_ref(),
                params,
                weights,
            );
            sample_action(node.manager(), &distribution)?
        };
        ctx.algo.selected.insert(node.decision_depth(), action.clone());
        Ok(action)
    }

    fn backup_chance(
        node: &ChanceNode<E, Self>,
        inner: &mut ChanceInner<E, Self>,
        _backup: &BackupView<'_>,
        _ctx: &mut TrialContext<E, Self>,
    ) -> Result<()> {
        backup_soft_chance(node, inner);
        Ok(())
    }

    fn backup_decision(
        node: &DecisionNode<E, Self>,
        inner: &mut DecisionInner<E, Self>,
        _backup: &BackupView<'_>,
        ctx: &mut TrialContext<E, Self>,
    ) -> Result<()> {
        let params = &node.manager().params;
        let opponent_coeff = node.opponent_coeff();

        // refresh the cache entry of the action this trial went through
        if let Some(action) = ctx.algo.selected.get(&node.decision_depth()) {
            if let Some(child) = inner.children.get(action) {
                let child_soft = child.lock_inner().data.stats.soft_value;
                inner
                    .data
                    .q_over_temp
                    .insert(action.clone(), opponent_coeff * child_soft / params.temp);
            }
        }

        let scored: Vec<(E::Action, f64)> = node
            .actions()
            .iter()
            .map(|action| (action.clone(), inner.data.cached_q_over_temp(params, action)))
            .collect();
        let sparse_set = sparse_action_set(scored);
        inner.data.soft.stats.num_backups += 1;
        inner.data.soft.stats.soft_value = opponent_coeff * params.temp * spmax(&sparse_set);
        Ok(())
    }

    fn recommend_action(
        node: &DecisionNode<E, Self>,
        inner: &DecisionInner<E, Self>,
    ) -> Result<E::Action> {
        let params = &node.manager().params;
        if params.recommend_most_visited {
            recommend_most_visited_action(node, inner)
        } else {
            recommend_best_soft_action(node, inner, params.recommend_visit_threshold)
        }
    }

    fn decision_value(data: &Self::DecisionData) -> f64 {
        data.soft.stats.soft_value
    }

    fn chance_value(data: &Self::ChanceData) -> f64 {
        data.stats.soft_value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_set_keeps_only_supported_actions() {
        // one dominant action: the set must be a singleton
        let set = sparse_action_set(vec![("a", 5.0), ("b", 0.0), ("c", -1.0)]);
        assert_eq!(set.len(), 1);
        assert_eq!(set[0].0, "a");
    }

    #[test]
    fn sparse_set_includes_close_competitors() {
        let set = sparse_action_set(vec![("a", 0.51), ("b", 0.49)]);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn singleton_sparse_set_makes_selection_deterministic() {
        let scored = vec![("a", 5.0), ("b", 0.0)];
        let set = sparse_action_set(scored.clone());
        let weights = sparse_weights(&scored, &set);
        assert!(weights.iter().find(|(a, _)| *a == "a").unwrap().1 > 0.0);
        assert_eq!(weights.iter().find(|(a, _)| *a == "b").unwrap().1, 0.0);
    }

    #[test]
    fn spmax_of_a_singleton_recovers_the_q_value_plus_half() {
        // (q)^2/1 - (q^2 - 1)/2 = (q^2 + 1)/2, the Tsallis value of a
        // deterministic policy at q
        let value = spmax(&[("a", 2.0)]);
        assert!((value - 2.5).abs() < 1e-12);
    }
}
