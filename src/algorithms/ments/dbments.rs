// DB-MENTS: MENTS selection with a dynamic-programming backup running
// alongside the soft backup. The soft values drive exploration; the DP
// values drive the final recommendation.

use super::{
    MentsParams, SoftChanceData, SoftDecisionData, SoftStats, backup_soft_chance,
    compute_q_values, select_action_soft, soft_value_backup,
};
use crate::algorithms::common::{
    DpStats, HasDpStats, backup_dp_chance, backup_dp_decision, recommend_best_dp_action,
    recommend_most_visited_action,
};
use crate::algorithms::{Algorithm, BackupView};
use crate::context::TrialContext;
use crate::env::Environment;
use crate::manager::SearchManager;
use crate::node::{ChanceInner, ChanceNode, DecisionInner, DecisionNode};
use anyhow::Result;

pub struct DbMentsDecisionData<E: Environment> {
    pub soft: SoftDecisionData<E>,
    pub dp: DpStats,
}

pub struct DbMentsChanceData {
    pub soft: SoftChanceData,
    pub dp: DpStats,
}

impl<E: Environment> HasDpStats for DbMentsDecisionData<E> {
    fn dp(&self) -> &DpStats {
        &self.dp
    }
    fn dp_mut(&mut self) -> &mut DpStats {
        &mut self.dp
    }
}

impl HasDpStats for DbMentsChanceData {
    fn dp(&self) -> &DpStats {
        &self.dp
    }
    fn dp_mut(&mut self) -> &mut DpStats {
        &mut self.dp
    }
}

impl<E: Environment> super::HasSoftDecisionData<E> for DbMentsDecisionData<E> {
    fn soft(&self) -> &SoftDecisionData<E> {
        &self.soft
    }
    fn soft_mut(&mut self) -> &mut SoftDecisionData<E> {
        &mut self.soft
    }
}

impl super::HasSoftChanceData for DbMentsChanceData {
    fn soft(&self) -> &SoftStats {
        &self.soft.stats
    }
    fn soft_mut(&mut self) -> &mut SoftStats {
        &mut self.soft.stats
    }
}

pub struct DbMents;

impl DbMents {
    fn q_fn<'a, E: Environment>(
        data: &'a DbMentsDecisionData<E>,
        params: &'a MentsParams,
        opponent_coeff: f64,
    ) -> impl Fn(&E::Action, Option<(&DbMentsChanceData, usize)>) -> f64 + 'a {
        move |action, child| match child {
            Some((chance_data, _)) => opponent_coeff * chance_data.soft.stats.soft_value,
            None => data.soft.pseudo_q_value(params, action),
        }
    }
}

impl<E: Environment> Algorithm<E> for DbMents {
    type Params = MentsParams;
    type DecisionData = DbMentsDecisionData<E>;
    type ChanceData = DbMentsChanceData;
    type Context = ();

    fn decision_data(
        manager: &SearchManager<E, Self>,
        state: &E::State,
        actions: &[E::Action],
        heuristic_value: f64,
        _parent: Option<(&ChanceNode<E, Self>, &ChanceInner<E, Self>)>,
    ) -> Self::DecisionData {
        let prior = manager.prior_policy(state);
        DbMentsDecisionData {
            soft: SoftDecisionData::new(&manager.params, prior, actions, heuristic_value),
            dp: DpStats::new(heuristic_value),
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
        DbMentsChanceData {
            soft: SoftChanceData {
                stats: SoftStats::new(heuristic_value),
            },
            dp: DpStats::new(local_reward + heuristic_value),
        }
    }

    fn select_action(
        node: &DecisionNode<E, Self>,
        inner: &mut DecisionInner<E, Self>,
        _ctx: &mut TrialContext<E, Self>,
    ) -> Result<E::Action> {
        let params = &node.manager().params;
        let inner = &*inner;
        let q_fn = Self::q_fn(&inner.data, params, node.opponent_coeff());
        let (action, _) = select_action_soft(
            node,
            inner,
            params,
            inner.data.soft.prior.as_ref(),
            &q_fn,
            None,
        )?;
        Ok(action)
    }

    fn backup_chance(
        node: &ChanceNode<E, Self>,
        inner: &mut ChanceInner<E, Self>,
        _backup: &BackupView<'_>,
        _ctx: &mut TrialContext<E, Self>,
    ) -> Result<()> {
        backup_soft_chance(node, inner);
        backup_dp_chance(node, inner)
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
            let q_fn = Self::q_fn(&inner.data, params, opponent_coeff);
            let qs = compute_q_values(node, inner, &q_fn);
            soft_value_backup::<E>(&qs, temp, opponent_coeff)
        };
        inner.data.soft.stats.num_backups += 1;
        inner.data.soft.stats.soft_value = value;
        backup_dp_decision(node, inner);
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
            recommend_best_dp_action(node, inner, params.recommend_visit_threshold)
        }
    }

    fn decision_value(data: &Self::DecisionData) -> f64 {
        data.dp.dp_value
    }

    fn chance_value(data: &Self::ChanceData) -> f64 {
        data.dp.dp_value
    }

    fn decision_value_string(data: &Self::DecisionData) -> String {
        format!("{:.4}(soft:{:.4})", data.dp.dp_value, data.soft.stats.soft_value)
    }

    fn chance_value_string(data: &Self::ChanceData) -> String {
        format!("{:.4}(soft:{:.4})", data.dp.dp_value, data.soft.stats.soft_value)
    }
}
