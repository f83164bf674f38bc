// RENTS: relative-entropy tree search
//
// Identical to MENTS except that the energy weights are reweighted by the
// probability the parent decision node assigned to its own selected
// action distribution. The distributions travel through the trial context,
// keyed by decision depth; the root has no parent and uses weight 1.

use super::{
    Ments, MentsParams, SoftChanceData, SoftDecisionData, backup_soft_chance,
    recommend_best_soft_action, select_action_soft,
};
use crate::algorithms::common::recommend_most_visited_action;
use crate::algorithms::{Algorithm, BackupView};
use crate::context::TrialContext;
use crate::env::Environment;
use crate::manager::SearchManager;
use crate::node::{ChanceInner, ChanceNode, DecisionInner, DecisionNode};
use anyhow::Result;
use std::collections::HashMap;

pub struct RentsContext<E: Environment> {
    /// Selection distribution of the decision node at each depth of the
    /// current trial's path.
    pub distributions: HashMap<usize, HashMap<E::Action, f64>>,
}

impl<E: Environment> Default for RentsContext<E> {
    fn default() -> Self {
        RentsContext {
            distributions: HashMap::new(),
        }
    }
}

pub struct Rents;

impl<E: Environment> Algorithm<E> for Rents {
    type Params = MentsParams;
    type DecisionData = SoftDecisionData<E>;
    type ChanceData = SoftChanceData;
    type Context = RentsContext<E>;

    fn decision_data(
        manager: &SearchManager<E, Self>,
        state: &E::State,
        actions: &[E::Action],
        heuristic_value: f64,
        _parent: Option<(&ChanceNode<E, Self>, &ChanceInner<E, Self>)>,
    ) -> Self::DecisionData {
        let prior = manager.prior_policy(state);
        SoftDecisionData::new(&manager.params, prior, actions, heuristic_value)
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
        let depth = node.decision_depth();
        let parent_weights = if depth > 0 {
            ctx.algo.distributions.get(&(depth - 1))
        } else {
            None
        };
        let params = &node.manager().params;
        let (action, distribution) = {
            let inner = &*inner;
            let q_fn = Ments::q_fn(&inner.data, params, node.opponent_coeff());
            select_action_soft(
                node,
                inner,
                params,
                inner.data.prior.as_ref(),
                &q_fn,
                parent_weights,
            )?
        };
        ctx.algo
            .distributions
            .insert(depth, distribution.into_iter().collect());
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
        _ctx: &mut TrialContext<E, Self>,
    ) -> Result<()> {
        let params = &node.manager().params;
        let temp = params.search_temp(node.is_root(), inner.num_visits);
        let opponent_coeff = node.opponent_coeff();
        let value = {
            let inner = &*inner;
            let q_fn = Ments::q_fn(&inner.data, params, opponent_coeff);
            let qs = super::compute_q_values(node, inner, &q_fn);
            super::soft_value_backup::<E>(&qs, temp, opponent_coeff)
        };
        inner.data.stats.num_backups += 1;
        inner.data.stats.soft_value = value;
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
        data.stats.soft_value
    }

    fn chance_value(data: &Self::ChanceData) -> f64 {
        data.stats.soft_value
    }
}
