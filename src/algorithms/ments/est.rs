// EST: entropy-free soft search
//
// The Boltzmann search policy of MENTS applied directly to plain value
// estimates (Bellman or empirical), with no soft or entropy term in the
// backup. Shares the DENTS parameter block; the value-temperature fields
// are simply never consulted.

use super::dents::DentsParams;
use super::{
    SoftDecisionData, compute_q_values, distribution_from_weights, energy_weights, sample_action,
};
use crate::algorithms::common::{
    DpStats, EmpStats, HasDpStats, HasEmpStats, backup_dp_chance, backup_dp_decision,
    recommend_best_dp_action, recommend_best_emp_action, recommend_most_visited_action,
};
use crate::algorithms::{Algorithm, BackupView};
use crate::context::TrialContext;
use crate::env::Environment;
use crate::manager::SearchManager;
use crate::node::{ChanceInner, ChanceNode, DecisionInner, DecisionNode};
use anyhow::{Result, ensure};

pub struct EstDecisionData<E: Environment> {
    pub soft: SoftDecisionData<E>,
    pub dp: DpStats,
    pub emp: EmpStats,
}

pub struct EstChanceData {
    pub dp: DpStats,
    pub emp: EmpStats,
}

impl<E: Environment> HasDpStats for EstDecisionData<E> {
    fn dp(&self) -> &DpStats {
        &self.dp
    }
    fn dp_mut(&mut self) -> &mut DpStats {
        &mut self.dp
    }
}

impl HasDpStats for EstChanceData {
    fn dp(&self) -> &DpStats {
        &self.dp
    }
    fn dp_mut(&mut self) -> &mut DpStats {
        &mut self.dp
    }
}

impl<E: Environment> HasEmpStats for EstDecisionData<E> {
    fn emp(&self) -> &EmpStats {
        &self.emp
    }
    fn emp_mut(&mut self) -> &mut EmpStats {
        &mut self.emp
    }
}

impl HasEmpStats for EstChanceData {
    fn emp(&self) -> &EmpStats {
        &self.emp
    }
    fn emp_mut(&mut self) -> &mut EmpStats {
        &mut self.emp
    }
}

impl EstChanceData {
    fn value_estimate(&self, use_dp_value: bool) -> f64 {
        if use_dp_value { self.dp.dp_value } else { self.emp.avg_return }
    }
}

pub struct Est;

impl Est {
    fn q_fn<'a, E: Environment>(
        data: &'a EstDecisionData<E>,
        params: &'a DentsParams,
        opponent_coeff: f64,
    ) -> impl Fn(&E::Action, Option<(&EstChanceData, usize)>) -> f64 + 'a {
        move |action, child| match child {
            Some((chance_data, _)) => {
                opponent_coeff * chance_data.value_estimate(params.use_dp_value)
            }
            None => data.soft.pseudo_q_value(&params.ments, action),
        }
    }
}

impl<E: Environment> Algorithm<E> for Est {
    type Params = DentsParams;
    type DecisionData = EstDecisionData<E>;
    type ChanceData = EstChanceData;
    type Context = ();

    fn decision_data(
        manager: &SearchManager<E, Self>,
        state: &E::State,
        actions: &[E::Action],
        heuristic_value: f64,
        _parent: Option<(&ChanceNode<E, Self>, &ChanceInner<E, Self>)>,
    ) -> Self::DecisionData {
        let prior = manager.prior_policy(state);
        EstDecisionData {
            soft: SoftDecisionData::new(&manager.params.ments, prior, actions, heuristic_value),
            dp: DpStats::new(heuristic_value),
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
        EstChanceData {
            dp: DpStats::new(local_reward + heuristic_value),
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
        let q_fn = Self::q_fn(&inner.data, params, node.opponent_coeff());
        let search_temp = params.ments.search_temp(node.is_root(), inner.num_visits);
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
        if node.manager().params.use_dp_value {
            backup_dp_chance(node, inner)
        } else {
            inner.data.emp.update(backup.total_return_after);
            Ok(())
        }
    }

    fn backup_decision(
        node: &DecisionNode<E, Self>,
        inner: &mut DecisionInner<E, Self>,
        backup: &BackupView<'_>,
        _ctx: &mut TrialContext<E, Self>,
    ) -> Result<()> {
        let params = &node.manager().params;
        inner.data.soft.stats.num_backups += 1;
        if params.use_dp_value {
            backup_dp_decision(node, inner);
            inner.data.soft.stats.soft_value = inner.data.dp.dp_value;
        } else {
            inner.data.emp.update(backup.total_return_after);
            inner.data.soft.stats.soft_value = inner.data.emp.avg_return;
        }
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
        data.dp.dp_value
    }
}
