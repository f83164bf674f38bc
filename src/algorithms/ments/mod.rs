// MENTS: maximum-entropy tree search
//
// Decision nodes carry a soft value maintained by log-sum-exp backups and
// select actions from an energy-based policy mixed with a decaying amount
// of uniform exploration (and optionally a prior policy). The relative,
// sparse and decayed-entropy variants in the submodules reuse the soft
// machinery defined here and swap out single hook points.

mod dbments;
mod dents;
mod est;
mod rents;
mod tents;

pub use dbments::{DbMents, DbMentsChanceData, DbMentsDecisionData};
pub use dents::{Dents, DentsChanceData, DentsDecisionData, DentsParams};
pub use est::{Est, EstChanceData, EstDecisionData};
pub use rents::{Rents, RentsContext};
pub use tents::{Tents, TentsContext, TentsDecisionData};

use super::common::{TempDecay, decayed_temp, pick_best_action};
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

/// Superset of the parameters recognised across the MENTS family. Which
/// algorithm consumes which field is catalogued in DESIGN.md.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MentsParams {
    /// Temperature of the energy-based search policy and the soft backups.
    pub temp: f64,
    /// Epsilon exploration: an action is drawn uniformly with probability
    /// `min(max_explore_prob, epsilon / ln(num_visits + 1))`.
    pub epsilon: f64,
    /// Alternative epsilon at the root node; `None` keeps `epsilon`.
    pub root_node_epsilon: Option<f64>,
    /// Cap on the uniform-exploration probability, in [0,1].
    pub max_explore_prob: f64,
    /// Mixing weight of the prior policy in the search distribution.
    pub prior_policy_search_weight: f64,
    /// Q value assumed for actions without a child node.
    pub default_q_value: f64,
    /// Centre the log-prior pseudo q-values so their mean starts at zero.
    pub shift_pseudo_q_values: bool,
    /// Offset added to log-prior pseudo q-values (after the shift).
    pub pseudo_q_value_offset: f64,
    /// Minimum visits a child needs to be eligible for recommendation;
    /// ignored when no child clears it.
    pub recommend_visit_threshold: usize,
    /// Recommend the most visited child instead of the best soft value.
    pub recommend_most_visited: bool,
    /// Decay schedule for the search temperature; `None` keeps it fixed.
    pub temp_decay: Option<TempDecay>,
    pub temp_decay_min_temp: f64,
    pub temp_decay_visits_scale: f64,
    /// Alternative visit scale at the root node; `None` keeps the scale.
    pub temp_decay_root_node_visits_scale: Option<f64>,
}

impl Default for MentsParams {
    fn default() -> Self {
        MentsParams {
            temp: 1.0,
            epsilon: 0.5,
            root_node_epsilon: None,
            max_explore_prob: 1.0,
            prior_policy_search_weight: 0.0,
            default_q_value: 0.0,
            shift_pseudo_q_values: false,
            pseudo_q_value_offset: 0.0,
            recommend_visit_threshold: 0,
            recommend_most_visited: false,
            temp_decay: None,
            temp_decay_min_temp: 1.0e-6,
            temp_decay_visits_scale: 1.0,
            temp_decay_root_node_visits_scale: None,
        }
    }
}

impl AlgorithmParams for MentsParams {
    fn validate(&self) -> Result<()> {
        ensure!(self.temp > 0.0, "search temperature must be positive");
        ensure!(self.epsilon >= 0.0, "epsilon must be non-negative");
        if let Some(root_epsilon) = self.root_node_epsilon {
            ensure!(root_epsilon >= 0.0, "root_node_epsilon must be non-negative");
        }
        ensure!(
            (0.0..=1.0).contains(&self.max_explore_prob),
            "max_explore_prob must lie in [0,1]"
        );
        ensure!(
            (0.0..=1.0).contains(&self.prior_policy_search_weight),
            "prior_policy_search_weight must lie in [0,1]"
        );
        ensure!(self.temp_decay_min_temp > 0.0, "temp_decay_min_temp must be positive");
        Ok(())
    }
}

impl MentsParams {
    /// Search temperature after decay, with the root-node scale override.
    pub fn search_temp(&self, is_root: bool, num_visits: usize) -> f64 {
        let mut visits_scale = self.temp_decay_visits_scale;
        if is_root {
            if let Some(scale) = self.temp_decay_root_node_visits_scale {
                visits_scale = scale;
            }
        }
        decayed_temp(
            self.temp_decay,
            self.temp,
            self.temp_decay_min_temp,
            num_visits,
            visits_scale,
        )
    }

    fn epsilon_at(&self, is_root: bool) -> f64 {
        if is_root {
            self.root_node_epsilon.unwrap_or(self.epsilon)
        } else {
            self.epsilon
        }
    }

    /// Probability of uniform exploration at a node with `num_visits`.
    pub fn explore_prob(&self, is_root: bool, num_visits: usize) -> f64 {
        let denom = ((num_visits + 1) as f64).ln();
        let lambda = if denom > 0.0 {
            (self.epsilon_at(is_root) / denom).min(self.max_explore_prob)
        } else {
            self.max_explore_prob
        };
        lambda.clamp(0.0, 1.0)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SoftStats {
    pub num_backups: usize,
    pub soft_value: f64,
}

impl SoftStats {
    pub fn new(initial_value: f64) -> Self {
        SoftStats {
            num_backups: 0,
            soft_value: initial_value,
        }
    }
}

pub struct SoftDecisionData<E: Environment> {
    pub stats: SoftStats,
    pub prior: Option<HashMap<E::Action, f64>>,
    pseudo_q_shift: f64,
}

impl<E: Environment> SoftDecisionData<E> {
    pub fn new(
        params: &MentsParams,
        prior: Option<HashMap<E::Action, f64>>,
        actions: &[E::Action],
        heuristic_value: f64,
    ) -> Self {
        let pseudo_q_shift = match &prior {
            Some(prior) if params.shift_pseudo_q_values && !actions.is_empty() => {
                actions
                    .iter()
                    .map(|action| log_prior_prob(prior, action))
                    .sum::<f64>()
                    / actions.len() as f64
            }
            _ => 0.0,
        };
        SoftDecisionData {
            stats: SoftStats::new(heuristic_value),
            prior,
            pseudo_q_shift,
        }
    }

    /// Q value assumed for an action without a child node: the configured
    /// default, boosted by the (shifted) log prior probability if a prior
    /// policy is available.
    pub fn pseudo_q_value(&self, params: &MentsParams, action: &E::Action) -> f64 {
        let mut q = params.default_q_value;
        if let Some(prior) = &self.prior {
            q += log_prior_prob(prior, action) - self.pseudo_q_shift
                + params.pseudo_q_value_offset;
        }
        q
    }
}

fn log_prior_prob<Action: Eq + std::hash::Hash>(prior: &HashMap<Action, f64>, action: &Action) -> f64 {
    prior.get(action).copied().unwrap_or(0.0).max(1e-300).ln()
}

pub struct SoftChanceData {
    pub stats: SoftStats,
}

pub trait HasSoftDecisionData<E: Environment> {
    fn soft(&self) -> &SoftDecisionData<E>;
    fn soft_mut(&mut self) -> &mut SoftDecisionData<E>;
}

pub trait HasSoftChanceData {
    fn soft(&self) -> &SoftStats;
    fn soft_mut(&mut self) -> &mut SoftStats;
}

impl<E: Environment> HasSoftDecisionData<E> for SoftDecisionData<E> {
    fn soft(&self) -> &SoftDecisionData<E> {
        self
    }
    fn soft_mut(&mut self) -> &mut SoftDecisionData<E> {
        self
    }
}

impl HasSoftChanceData for SoftChanceData {
    fn soft(&self) -> &SoftStats {
        &self.stats
    }
    fn soft_mut(&mut self) -> &mut SoftStats {
        &mut self.stats
    }
}

/// Q-value provider for one action: receives the locked child data and its
/// visit count when a child exists. Values are expected from the deciding
/// player's perspective (opponent coefficient already applied).
pub(crate) type SoftQFn<'a, E, A> = dyn Fn(
        &<E as Environment>::Action,
        Option<(&<A as Algorithm<E>>::ChanceData, usize)>,
    ) -> f64
    + 'a;

/// Evaluates `q_fn` for every valid action, locking all children once.
pub(crate) fn compute_q_values<E, A>(
    node: &DecisionNode<E, A>,
    inner: &DecisionInner<E, A>,
    q_fn: &SoftQFn<'_, E, A>,
) -> Vec<(E::Action, f64)>
where
    E: Environment,
    A: Algorithm<E>,
{
    let guards = lock_chance_children(inner);
    let by_action: HashMap<&E::Action, (&A::ChanceData, usize)> = guards
        .iter()
        .map(|(action, _, guard)| (*action, (&guard.data, guard.num_visits)))
        .collect();
    node.actions()
        .iter()
        .map(|action| (action.clone(), q_fn(action, by_action.get(action).copied())))
        .collect()
}

/// Builds the full search distribution from already-computed weights:
/// optional prior mixing, then the decaying uniform-exploration mixture.
pub(crate) fn distribution_from_weights<E, A>(
    node: &DecisionNode<E, A>,
    num_visits: usize,
    prior: Option<&HashMap<E::Action, f64>>,
    params: &MentsParams,
    mut weights: Vec<(E::Action, f64)>,
) -> Vec<(E::Action, f64)>
where
    E: Environment,
    A: Algorithm<E>,
{
    let num_actions = weights.len().max(1);
    let sum: f64 = weights.iter().map(|(_, weight)| weight).sum();
    if sum <= 0.0 || !sum.is_finite() {
        for (_, weight) in &mut weights {
            *weight = 1.0 / num_actions as f64;
        }
    } else {
        for (_, weight) in &mut weights {
            *weight /= sum;
        }
    }

    let prior_weight = params.prior_policy_search_weight;
    if prior_weight > 0.0 {
        if let Some(prior) = prior {
            for (action, weight) in &mut weights {
                let prior_prob = prior.get(action).copied().unwrap_or(0.0);
                *weight = (1.0 - prior_weight) * *weight + prior_weight * prior_prob;
            }
        }
    }

    let lambda = params.explore_prob(node.is_root(), num_visits);
    let uniform = lambda / num_actions as f64;
    for (_, weight) in &mut weights {
        *weight = (1.0 - lambda) * *weight + uniform;
    }
    weights
}

/// Energy weights `exp(q/temp - c)` with `c = max q/temp` for stability.
pub(crate) fn energy_weights<E: Environment>(
    qs: &[(E::Action, f64)],
    temp: f64,
) -> Vec<(E::Action, f64)> {
    let c = qs
        .iter()
        .map(|(_, q)| q / temp)
        .fold(f64::NEG_INFINITY, f64::max);
    qs.iter()
        .map(|(action, q)| (action.clone(), (q / temp - c).exp()))
        .collect()
}

pub(crate) fn sample_action<E, A>(
    manager: &SearchManager<E, A>,
    distribution: &[(E::Action, f64)],
) -> Result<E::Action>
where
    E: Environment,
    A: Algorithm<E>,
{
    let weights: Vec<f64> = distribution.iter().map(|(_, prob)| *prob).collect();
    let index = manager.rng().sample_weighted_index(&weights)?;
    Ok(distribution[index].0.clone())
}

/// Energy-policy selection shared across the family; returns the sampled
/// action together with the distribution it was drawn from.
pub(crate) fn select_action_soft<E, A>(
    node: &DecisionNode<E, A>,
    inner: &DecisionInner<E, A>,
    params: &MentsParams,
    prior: Option<&HashMap<E::Action, f64>>,
    q_fn: &SoftQFn<'_, E, A>,
    parent_weights: Option<&HashMap<E::Action, f64>>,
) -> Result<(E::Action, Vec<(E::Action, f64)>)>
where
    E: Environment,
    A: Algorithm<E>,
{
    ensure!(
        !node.actions().is_empty(),
        "select_action on a node without actions"
    );
    let temp = params.search_temp(node.is_root(), inner.num_visits);
    let qs = compute_q_values(node, inner, q_fn);
    let mut weights = energy_weights::<E>(&qs, temp);
    if let Some(parent_weights) = parent_weights {
        for (action, weight) in &mut weights {
            *weight *= parent_weights.get(action).copied().unwrap_or(0.0);
        }
    }
    let distribution = distribution_from_weights(node, inner.num_visits, prior, params, weights);
    let action = sample_action(node.manager(), &distribution)?;
    Ok((action, distribution))
}

/// Soft backup: V = +/-temp*log sum exp(+/-q/temp), the log-sum-exp of the
/// per-action q values from the deciding player's perspective, stored back
/// from the first player's perspective.
pub(crate) fn soft_value_backup<E: Environment>(
    qs: &[(E::Action, f64)],
    temp: f64,
    opponent_coeff: f64,
) -> f64 {
    let c = qs
        .iter()
        .map(|(_, q)| q / temp)
        .fold(f64::NEG_INFINITY, f64::max);
    let sum: f64 = qs.iter().map(|(_, q)| (q / temp - c).exp()).sum();
    opponent_coeff * temp * (c + sum.ln())
}

/// Chance-node soft backup: the local reward plus the visit-weighted mean
/// of child soft values (the empirical estimate of the transition
/// expectation).
pub(crate) fn backup_soft_chance<E, A>(node: &ChanceNode<E, A>, inner: &mut ChanceInner<E, A>)
where
    E: Environment,
    A: Algorithm<E>,
    A::DecisionData: HasSoftDecisionData<E>,
    A::ChanceData: HasSoftChanceData,
{
    let mut weighted = 0.0;
    let mut total_visits = 0usize;
    {
        let guards = lock_decision_children(inner);
        for (_, _, guard) in &guards {
            weighted += guard.num_visits as f64 * guard.data.soft().stats.soft_value;
            total_visits += guard.num_visits;
        }
    }
    let expectation = if total_visits > 0 {
        weighted / total_visits as f64
    } else {
        0.0
    };
    let stats = inner.data.soft_mut();
    stats.num_backups += 1;
    stats.soft_value = node.local_reward() + expectation;
}

/// Best-soft-value recommendation with the visit-threshold fallback chain.
pub(crate) fn recommend_best_soft_action<E, A>(
    node: &DecisionNode<E, A>,
    inner: &DecisionInner<E, A>,
    visit_threshold: usize,
) -> Result<E::Action>
where
    E: Environment,
    A: Algorithm<E>,
    A::ChanceData: HasSoftChanceData,
{
    let opponent_coeff = node.opponent_coeff();
    let guards = lock_chance_children(inner);
    let mut scored: Vec<(&E::Action, f64)> = guards
        .iter()
        .filter(|(_, _, guard)| guard.num_visits >= visit_threshold)
        .map(|(action, _, guard)| (*action, opponent_coeff * guard.data.soft().soft_value))
        .collect();
    if scored.is_empty() {
        scored = guards
            .iter()
            .map(|(action, _, guard)| (*action, opponent_coeff * guard.data.soft().soft_value))
            .collect();
    }
    pick_best_action(node.manager(), &scored)
}

pub struct Ments;

impl Ments {
    fn q_fn<'a, E: Environment>(
        data: &'a SoftDecisionData<E>,
        params: &'a MentsParams,
        opponent_coeff: f64,
    ) -> impl Fn(&E::Action, Option<(&SoftChanceData, usize)>) -> f64 + 'a {
        move |action, child| match child {
            Some((chance_data, _)) => opponent_coeff * chance_data.stats.soft_value,
            None => data.pseudo_q_value(params, action),
        }
    }
}

impl<E: Environment> Algorithm<E> for Ments {
    type Params = MentsParams;
    type DecisionData = SoftDecisionData<E>;
    type ChanceData = SoftChanceData;
    type Context = ();

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
            stats: SoftStats::new(heuristic_value),
        }
    }

    fn select_action(
        node: &DecisionNode<E, Self>,
        inner: &mut DecisionInner<E, Self>,
        _ctx: &mut TrialContext<E, Self>,
    ) -> Result<E::Action> {
        let inner = &*inner;
        let params = &node.manager().params;
        let q_fn = Self::q_fn(&inner.data, params, node.opponent_coeff());
        let (action, _) =
            select_action_soft(node, inner, params, inner.data.prior.as_ref(), &q_fn, None)?;
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
            let q_fn = Self::q_fn(&inner.data, params, opponent_coeff);
            let qs = compute_q_values(node, inner, &q_fn);
            soft_value_backup::<E>(&qs, temp, opponent_coeff)
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
            super::common::recommend_most_visited_action(node, inner)
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
