// dynamic-programming (Bellman) backups
//
// Decision nodes take the best child Q value (worst at opponent nodes);
// chance nodes take the local reward plus the expectation of child values
// under the transition distribution, restricted to the children realised
// so far. All values are stored from the first player's perspective.

use crate::algorithms::Algorithm;
use crate::env::Environment;
use crate::node::{
    ChanceInner, ChanceNode, DecisionInner, DecisionNode, lock_chance_children,
    lock_decision_children,
};
use anyhow::Result;
use std::collections::HashMap;

#[derive(Clone, Copy, Debug)]
pub struct DpStats {
    pub num_backups: usize,
    pub dp_value: f64,
}

impl DpStats {
    pub fn new(initial_value: f64) -> Self {
        DpStats {
            num_backups: 0,
            dp_value: initial_value,
        }
    }
}

pub trait HasDpStats {
    fn dp(&self) -> &DpStats;
    fn dp_mut(&mut self) -> &mut DpStats;
}

/// V(s) = max_a Q(s,a), or min at opponent nodes. Leaves keep their
/// initial (heuristic) value.
pub fn backup_dp_decision<E, A>(node: &DecisionNode<E, A>, inner: &mut DecisionInner<E, A>)
where
    E: Environment,
    A: Algorithm<E>,
    A::DecisionData: HasDpStats,
    A::ChanceData: HasDpStats,
{
    let is_opponent = node.is_opponent();
    let mut best: Option<f64> = None;
    {
        let guards = lock_chance_children(inner);
        for (_, _, guard) in &guards {
            let q = guard.data.dp().dp_value;
            best = Some(match best {
                None => q,
                Some(b) if is_opponent => b.min(q),
                Some(b) => b.max(q),
            });
        }
    }
    let stats = inner.data.dp_mut();
    stats.num_backups += 1;
    if let Some(value) = best {
        stats.dp_value = value;
    }
}

/// Q(s,a) = R(s,a) + E_{s'}[V(s')], the expectation weighted by the
/// transition probabilities of the realised children and renormalised over
/// their covered mass.
pub fn backup_dp_chance<E, A>(node: &ChanceNode<E, A>, inner: &mut ChanceInner<E, A>) -> Result<()>
where
    E: Environment,
    A: Algorithm<E>,
    A::DecisionData: HasDpStats,
    A::ChanceData: HasDpStats,
{
    let probs: HashMap<E::Observation, f64> = node
        .transition_distribution(inner)?
        .iter()
        .map(|(state, prob)| (E::Observation::from(state.clone()), *prob))
        .collect();
    let mut weighted = 0.0;
    let mut mass = 0.0;
    {
        let guards = lock_decision_children(inner);
        for (observation, _, guard) in &guards {
            let prob = probs.get(*observation).copied().unwrap_or(0.0);
            weighted += prob * guard.data.dp().dp_value;
            mass += prob;
        }
    }
    let expectation = if mass > 0.0 { weighted / mass } else { 0.0 };
    let stats = inner.data.dp_mut();
    stats.num_backups += 1;
    stats.dp_value = node.local_reward() + expectation;
    Ok(())
}

/// DP-argmax recommendation with a visit threshold; if no child clears the
/// threshold every child is a candidate. Ties break uniformly at random.
pub fn recommend_best_dp_action<E, A>(
    node: &DecisionNode<E, A>,
    inner: &DecisionInner<E, A>,
    visit_threshold: usize,
) -> Result<E::Action>
where
    E: Environment,
    A: Algorithm<E>,
    A::ChanceData: HasDpStats,
{
    let opponent_coeff = node.opponent_coeff();
    let guards = lock_chance_children(inner);
    let mut scored: Vec<(&E::Action, f64)> = guards
        .iter()
        .filter(|(_, _, guard)| guard.num_visits >= visit_threshold)
        .map(|(action, _, guard)| (*action, opponent_coeff * guard.data.dp().dp_value))
        .collect();
    if scored.is_empty() {
        scored = guards
            .iter()
            .map(|(action, _, guard)| (*action, opponent_coeff * guard.data.dp().dp_value))
            .collect();
    }
    super::pick_best_action(node.manager(), &scored)
}
