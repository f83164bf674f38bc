// policy-entropy backups
//
// A decision node tracks the entropy of its own selection policy plus the
// expected entropy of the subtree below each action. At opponent nodes the
// local term flips sign, so an adversary's randomness counts against the
// subtree. Chance nodes aggregate child subtree entropies by visit weight.

use crate::algorithms::Algorithm;
use crate::env::Environment;
use crate::node::{
    ChanceInner, ChanceNode, DecisionInner, DecisionNode, lock_chance_children,
    lock_decision_children,
};
use std::collections::HashMap;

#[derive(Clone, Copy, Debug)]
pub struct EntDecisionStats {
    pub num_backups: usize,
    pub local_entropy: f64,
    pub subtree_entropy: f64,
}

impl EntDecisionStats {
    pub fn new() -> Self {
        EntDecisionStats {
            num_backups: 0,
            local_entropy: 0.0,
            subtree_entropy: 0.0,
        }
    }
}

impl Default for EntDecisionStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct EntChanceStats {
    pub num_backups: usize,
    pub subtree_entropy: f64,
}

pub trait HasEntDecisionStats {
    fn ent(&self) -> &EntDecisionStats;
    fn ent_mut(&mut self) -> &mut EntDecisionStats;
}

pub trait HasEntChanceStats {
    fn ent(&self) -> &EntChanceStats;
    fn ent_mut(&mut self) -> &mut EntChanceStats;
}

/// H_local = -sum pi(a)*ln pi(a); H_subtree = +/-H_local + sum pi(a)*H_child(a),
/// where `policy` is the node's current selection distribution.
pub fn backup_ent_decision<E, A>(
    node: &DecisionNode<E, A>,
    inner: &mut DecisionInner<E, A>,
    policy: &[(E::Action, f64)],
)
where
    E: Environment,
    A: Algorithm<E>,
    A::DecisionData: HasEntDecisionStats,
    A::ChanceData: HasEntChanceStats,
{
    let mut local_entropy = 0.0;
    for (_, prob) in policy {
        if *prob > 0.0 {
            local_entropy -= prob * prob.ln();
        }
    }
    let mut subtree_entropy = node.opponent_coeff() * local_entropy;
    {
        let guards = lock_chance_children(inner);
        let child_entropy: HashMap<&E::Action, f64> = guards
            .iter()
            .map(|(action, _, guard)| (*action, guard.data.ent().subtree_entropy))
            .collect();
        for (action, prob) in policy {
            if let Some(entropy) = child_entropy.get(action) {
                subtree_entropy += prob * entropy;
            }
        }
    }
    let stats = inner.data.ent_mut();
    stats.num_backups += 1;
    stats.local_entropy = local_entropy;
    stats.subtree_entropy = subtree_entropy;
}

/// Visit-weighted average of child subtree entropies.
pub fn backup_ent_chance<E, A>(_node: &ChanceNode<E, A>, inner: &mut ChanceInner<E, A>)
where
    E: Environment,
    A: Algorithm<E>,
    A::DecisionData: HasEntDecisionStats,
    A::ChanceData: HasEntChanceStats,
{
    let mut weighted = 0.0;
    let mut total_visits = 0usize;
    {
        let guards = lock_decision_children(inner);
        for (_, _, guard) in &guards {
            weighted += guard.num_visits as f64 * guard.data.ent().subtree_entropy;
            total_visits += guard.num_visits;
        }
    }
    let stats = inner.data.ent_mut();
    stats.num_backups += 1;
    if total_visits > 0 {
        stats.subtree_entropy = weighted / total_visits as f64;
    }
}
