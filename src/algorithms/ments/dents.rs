// DENTS: entropy-decayed soft search over Bellman (or empirical) values
//
// Action scores are value + temp(N) * subtree_entropy, where temp(N) is a
// decaying coefficient of entropy computed from this node's visit count.
// The search temperature of the energy policy stays separate, so the
// exploration bonus of entropy vanishes while the policy itself keeps its
// shape.

use super::{
    MentsParams, SoftChanceData, SoftDecisionData, SoftStats, compute_q_values,
    distribution_from_weights, energy_weights, sample_action,
};
use crate::algorithms::common::{
    DpStats, EmpStats, EntChanceStats, EntDecisionStats, HasDpStats, HasEmpStats,
    HasEntChanceStats, HasEntDecisionStats, TempDecay, backup_dp_chance, backup_dp_decision,
    backup_ent_chance, backup_ent_decision, decayed_temp, recommend_best_dp_action,
    recommend_best_emp_action, recommend_most_visited_action,
};
use crate::algorithms::{Algorithm, AlgorithmParams, BackupView};
use crate::context::TrialContext;
use crate::env::Environment;
use crate::manager::SearchManager;
use crate::node::{ChanceInner, ChanceNode, DecisionInner, DecisionNode};
use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DentsParams {
    pub ments: MentsParams,
    /// Initial coefficient of entropy in the value term.
    pub value_temp_init: f64,
    /// Decay schedule for the entropy coefficient; `None` keeps it fixed.
    pub value_temp_decay: Option<TempDecay>,
    pub value_temp_decay_min_temp: f64,
    pub value_temp_decay_visits_scale: f64,
    pub value_temp_decay_root_node_visits_scale: Option<f64>,
    /// Back values up with the Bellman operator; false uses the empirical
    /// average of trial returns instead.
    pub use_dp_value: bool,
}

impl Default for DentsParams {
    fn default() -> Self {
        DentsParams {
            ments: MentsParams::default(),
            value_temp_init: 1.0,
            value_temp_decay: Some(TempDecay::InvSqrt),
            value_temp_decay_min_temp: 1.0e-6,
            value_temp_decay_visits_scale: 1.0,
            value_temp_decay_root_node_visits_scale: None,
            use_dp_value: true,
        }
    }
}

impl AlgorithmParams for DentsParams {
    fn validate(&self) -> Result<()> {
        self.ments.validate()?;
        ensure!(self.value_temp_init >= 0.0, "value_temp_init must be non-negative");
        ensure!(
            self.value_temp_decay_min_temp > 0.0,
            "value_temp_decay_min_temp must be positive"
        );
        Ok(())
    }
}

impl DentsParams {
    /// Entropy coefficient after decay, from this node's visit count.
    pub fn value_temp(&self, is_root: bool, num_visits: usize) -> f64 {
        let mut visits_scale = self.value_temp_decay_visits_scale;
        if is_root {
            if let Some(scale) = self.value_temp_decay_root_node_visits_scale {
                visits_scale = scale;
            }
        }
        decayed_temp(
            self.value_temp_decay,
            self.value_temp_init,
            self.value_temp_decay_min_temp,
            num_visits,
            visits_scale,
        )
    }
}

pub struct DentsDecisionData<E: Environment> {
    pub soft: SoftDecisionData<E>,
    pub dp: DpStats,
    pub ent: EntDecisionStats,
    pub emp: EmpStats,
}

pub struct DentsChanceData {
    pub soft: SoftChanceData,
    pub dp: DpStats,
    pub ent: EntChanceStats,
    pub emp: EmpStats,
}

impl<E: Environment> HasDpStats for DentsDecisionData<E> {
    fn dp(&self) -> &DpStats {
        &self.dp
    }
    fn dp_mut(&mut self) -> &mut DpStats {
        &mut self.dp
    }
}

impl HasDpStats for DentsChanceData {
    fn dp(&self) -> &DpStats {
        &self.dp
    }
    fn dp_mut(&mut self) -> &mut DpStats {
        &mut self.dp
    }
}

impl<E: Environment> HasEntDecisionStats for DentsDecisionData<E> {
    fn ent(&self) -> &EntDecisionStats {
        &self.ent
    }
    fn ent_mut(&mut self) -> &mut EntDecisionStats {
        &mut self.ent
    }
}

impl HasEntChanceStats for DentsChanceData {
    fn ent(&self) -> &EntChanceStats {
        &self.ent
    }
    fn ent_mut(&mut self) -> &mut EntChanceStats {
        &mut self.ent
    }
}

impl<E: Environment> HasEmpStats for DentsDecisionData<E> {
    fn emp(&self) -> &EmpStats {
        &self.emp
    }
    fn emp_mut(&mut self) -> &mut EmpStats {
        &mut self.emp
    }
}

impl HasEmpStats for DentsChanceData {
    fn emp(&self) -> &EmpStats {
        &self.emp
    }
    fn emp_mut(&mut self) -> &mut EmpStats {
        &mut self.emp
    }
}

impl DentsChanceData {
    fn value_estimate(&self, use_dp_value: bool) -> f64 {
        if use_dp_value { self.dp.dp_value } else { self.emp.avg_return }
    }
}

pub struct Dents;

impl Dents {
    /// Action score from the deciding player's perspective:
    /// `+/-(value + value_temp * subtree_entropy)` for expanded actions,
    /// the MENTS pseudo value otherwise.
    fn q_fn<'a, E: Environment>(
        data: &'a DentsDecisionData<E>,
        params: &'a DentsParams,
        opponent_coeff: f64,
        value_temp: f64,
    ) -> impl Fn(&E::Action, Option<(&DentsChanceData, usize)>) -> f64 + 'a {
        move |action, child| match child {
            Some((chance_data, _)) => {
                let value = chance_data.value_estimate(params.use_dp_value);
                opponent_coeff * (value + value_temp * chance_data.ent.subtree_entropy)
            }
            None => data.soft.pseudo_q_value(&params.ments, action),
        }
    }
}

impl<E: Environment> Algorithm<E> for Dents {
    type Params = DentsParams;
    type DecisionData = DentsDecisionData<E>;
    type ChanceData = DentsChanceData;
    type Context = ();

    fn decision_data(
        manager: &SearchManager<E, Self>,
        state: &E::State,
        actions: &[E::Action],
        heuristic_value: f64,
        _parent: Option<(&ChanceNode<E, Self>, &ChanceInner<E, Self>)>,
    ) -> Self::DecisionData {
        let prior = manager.prior_policy(state);
        DentsDecisionData {
            soft: SoftDecisionData::new(&manager.params.ments, prior, actions, heuristic_value),
            dp: DpStats::new(heuristic_value),
            ent: EntDecisionStats::new(),
            emp: EmpStats::new(1, heuristic_value),
        }
    }

    fn chance_data(
        _manager: &SearchManager<E, Self>,
        _parent: &DecisionNode<E, Self>,
        _parent_inner: &DecisionInner<E, Self>,
        _action: &E::Action,
        local_reward: f64,
        heuristic_value: f64,
    ) -> Self::ChanceData {
        DentsChanceData {
            soft: SoftChanceData {
                stats: SoftStats::new(heuristic_value),
            },
            dp: DpStats::new(local_reward + heuristic_value),
            ent: EntChanceStats::default(),
            emp: EmpStats::new(1, heuristic_value),
        }
    }

    fn select_action(
        node: &DecisionNode<E, Self>,
        inner: &mut DecisionInner<E, Self>,
        _ctx: &mut TrialContext<E, Self>,
    ) -> Result<E::Action> {
        ensure!(
            !node.actions().is_empty(),
            "select_action on a node without actions"
        );
        let params = &node.manager().params;
        let inner = &*inner;
        let value_temp = params.value_temp(node.is_root(), inner.num_visits);
        let search_temp = params.ments.search_temp(node.is_root(), inner.num_visits);
        let q_fn = Self::q_fn(&inner.data, params, node.opponent_coeff(), value_temp);
        let qs = compute_q_values(node, inner, &q_fn);
        let weights = energy_weights::<E>(&qs, search_temp);
        let distribution = distribution_from_weights(
            node,
            inner.num_visits,
            inner.data.soft.prior.as_ref(),
            &params.ments,
            weights,
        );
        sample_action(node.manager(), &distribution)
    }

    fn backup_chance(
        node: &ChanceNode<E, Self>,
        inner: &mut ChanceInner<E, Self>,
        backup: &BackupView<'_>,
        _ctx: &mut TrialContext<E, Self>,
    ) -> Result<()> {
        let params = &node.manager().params;
        backup_ent_chance(node, inner);
        if params.use_dp_value {
            backup_dp_chance(node, inner)?;
        } else {
            inner.data.emp.update(backup.total_return_after);
        }
        let stats = &mut inner.data;
        stats.soft.stats.num_backups += 1;
        stats.soft.stats.soft_value = stats.value_estimate(params.use_dp_value);
        Ok(())
    }

    fn backup_decision(
        node: &DecisionNode<E, Self>,
        inner: &mut DecisionInner<E, Self>,
        backup: &BackupView<'_>,
        _ctx: &mut TrialContext<E, Self>,
    ) -> Result<()> {
        let params = &node.manager().params;
        let opponent_coeff = node.opponent_coeff();
        let value_temp = params.value_temp(node.is_root(), inner.num_visits);

        // entropy backup needs the current selection policy
        let policy = {
            let inner = &*inner;
            let search_temp = params.ments.search_temp(node.is_root(), inner.num_visits);
            let q_fn = Self::q_fn(&inner.data, params, opponent_coeff, value_temp);
            let qs = compute_q_values(node, inner, &q_fn);
            let weights = energy_weights::<E>(&qs, search_temp);
            distribution_from_weights(
                node,
                inner.num_visits,
                inner.data.soft.prior.as_ref(),
                &params.ments,
                weights,
            )
        };
        backup_ent_decision(node, inner, &policy);

        let value_estimate = if params.use_dp_value {
            backup_dp_decision(node, inner);
            inner.data.dp.dp_value
        } else {
            inner.data.emp.update(backup.total_return_after);
            inner.data.emp.avg_return
        };

        inner.data.soft.stats.num_backups += 1;
        inner.data.soft.stats.soft_value =
            value_estimate + value_temp * inner.data.ent.subtree_entropy;
        Ok(())
    }

    fn recommend_action(
        node: &DecisionNode<E, Self>,
        inner: &DecisionInner<E, Self>,
    ) -> Result<E::Action> {
        let params = &node.manager().params;
        if params.ments.recommend_most_visited {
            recommend_most_visited_action(node, inner)
        } else if params.use_dp_value {
            recommend_best_dp_action(node, inner, params.ments.recommend_visit_threshold)
        } else {
            recommend_best_emp_action(node, inner, params.ments.recommend_visit_threshold)
        }
    }

    fn decision_value(data: &Self::DecisionData) -> f64 {
        data.soft.stats.soft_value
    }

    fn chance_value(data: &Self::ChanceData) -> f64 {
        data.soft.stats.soft_value
    }

    fn decision_value_string(data: &Self::DecisionData) -> String {
        format!(
            "{:.4}(dp:{:.4},avg:{:.4},entrpy:{:.4})",
            data.soft.stats.soft_value, data.dp.dp_value, data.emp.avg_return, data.ent.subtree_entropy
        )
    }
}
