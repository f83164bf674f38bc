// shared tree skeleton: decision and chance nodes with their per-node
// locks, children maps and transposition-aware child construction

mod chance;
mod decision;

pub use chance::{ChanceInner, ChanceNode};
pub use decision::{DecisionInner, DecisionNode};

use crate::algorithms::Algorithm;
use crate::env::Environment;
use std::sync::{Arc, MutexGuard};

/// Consistent view of a node's headline statistics, taken under its lock.
#[derive(Clone, Debug)]
pub struct NodeSnapshot {
    pub num_visits: usize,
    pub value: f64,
    pub value_string: String,
    pub num_children: usize,
}

/// Locks every chance child of a decision node, in children-map iteration
/// order. Children are descendants and every worker acquires locks
/// parent-then-self-then-children along tree order, so this cannot cycle.
pub fn lock_chance_children<'a, E: Environment, A: Algorithm<E>>(
    inner: &'a DecisionInner<E, A>,
) -> Vec<(&'a E::Action, &'a Arc<ChanceNode<E, A>>, MutexGuard<'a, ChanceInner<E, A>>)> {
    inner
        .children
        .iter()
        .map(|(action, child)| (action, child, child.lock_inner()))
        .collect()
}

/// Locks every decision child of a chance node.
pub fn lock_decision_children<'a, E: Environment, A: Algorithm<E>>(
    inner: &'a ChanceInner<E, A>,
) -> Vec<(&'a E::Observation, &'a Arc<DecisionNode<E, A>>, MutexGuard<'a, DecisionInner<E, A>>)> {
    inner
        .children
        .iter()
        .map(|(observation, child)| (observation, child, child.lock_inner()))
        .collect()
}

/// Indentation used by the tree pretty-printer.
pub(crate) fn print_tabs(out: &mut String, num_tabs: usize) {
    for _ in 0..num_tabs {
        out.push_str("|\t");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::uct::{Uct, UctParams};
    use crate::config::SearchConfig;
    use crate::envs::{ChainAction, ChainEnv, GridAction, GridEnv};
    use crate::manager::SearchManager;

    fn grid_manager(use_transposition_table: bool) -> Arc<SearchManager<GridEnv, Uct>> {
        let config = SearchConfig {
            use_transposition_table,
            num_transposition_table_mutexes: 2,
            ..SearchConfig::default()
        };
        Arc::new(
            SearchManager::new(Arc::new(GridEnv::new(2, 2, 1.0)), config, UctParams::default())
                .unwrap(),
        )
    }

    #[test]
    fn child_construction_is_idempotent() {
        let manager = Arc::new(
            SearchManager::<ChainEnv, Uct>::new(
                Arc::new(ChainEnv::new(5, 1.0)),
                SearchConfig::default(),
                UctParams::default(),
            )
            .unwrap(),
        );
        let root = DecisionNode::root(&manager, 0).unwrap();
        let mut inner = root.lock_inner();
        let first = root.child_for_action(&mut inner, &ChainAction::Right).unwrap();
        let second = root.child_for_action(&mut inner, &ChainAction::Right).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(inner.children.len(), 1);
    }

    #[test]
    fn transposition_deduplicates_across_parents() {
        let manager = grid_manager(true);
        let root = DecisionNode::root(&manager, (0, 0)).unwrap();

        let reach = |first: GridAction, mid: (usize, usize), second: GridAction| {
            let mut root_inner = root.lock_inner();
            let first_chance = root.child_for_action(&mut root_inner, &first).unwrap();
            drop(root_inner);
            let mut chance_inner = first_chance.lock_inner();
            let mid_node = first_chance.child_for_observation(&mut chance_inner, &mid).unwrap();
            drop(chance_inner);
            let mut mid_inner = mid_node.lock_inner();
            let second_chance = mid_node.child_for_action(&mut mid_inner, &second).unwrap();
            drop(mid_inner);
            let mut chance_inner = second_chance.lock_inner();
            second_chance
                .child_for_observation(&mut chance_inner, &(1, 1))
                .unwrap()
        };

        let via_right = reach(GridAction::Right, (1, 0), GridAction::Down);
        let via_down = reach(GridAction::Down, (0, 1), GridAction::Right);
        assert!(Arc::ptr_eq(&via_right, &via_down));
        manager.teardown();
    }

    #[test]
    fn without_transposition_parents_build_their_own_children() {
        let manager = grid_manager(false);
        let root = DecisionNode::root(&manager, (0, 0)).unwrap();

        let reach = |first: GridAction, mid: (usize, usize), second: GridAction| {
            let mut root_inner = root.lock_inner();
            let first_chance = root.child_for_action(&mut root_inner, &first).unwrap();
            drop(root_inner);
            let mut chance_inner = first_chance.lock_inner();
            let mid_node = first_chance.child_for_observation(&mut chance_inner, &mid).unwrap();
            drop(chance_inner);
            let mut mid_inner = mid_node.lock_inner();
            let second_chance = mid_node.child_for_action(&mut mid_inner, &second).unwrap();
            drop(mid_inner);
            let mut chance_inner = second_chance.lock_inner();
            second_chance
                .child_for_observation(&mut chance_inner, &(1, 1))
                .unwrap()
        };

        let via_right = reach(GridAction::Right, (1, 0), GridAction::Down);
        let via_down = reach(GridAction::Down, (0, 1), GridAction::Right);
        assert!(!Arc::ptr_eq(&via_right, &via_down));
    }

    #[test]
    fn parent_back_references_upgrade_while_the_tree_lives() {
        let manager = grid_manager(false);
        let root = DecisionNode::root(&manager, (0, 0)).unwrap();
        let mut root_inner = root.lock_inner();
        let chance = root.child_for_action(&mut root_inner, &GridAction::Right).unwrap();
        drop(root_inner);
        let mut chance_inner = chance.lock_inner();
        let child = chance.child_for_observation(&mut chance_inner, &(1, 0)).unwrap();
        drop(chance_inner);

        let chance_parent = chance.parent().unwrap();
        assert!(Arc::ptr_eq(&chance_parent, &root));
        let child_parent = child.parent().unwrap();
        assert!(Arc::ptr_eq(&child_parent, &chance));
        assert!(root.parent().is_none());
        assert_eq!(child.decision_timestep(), 1);
        assert_eq!(child.decision_depth(), 1);
    }

    #[test]
    fn opponent_parity_follows_the_decision_timestep() {
        let config = SearchConfig {
            is_two_player_game: true,
            ..SearchConfig::default()
        };
        let manager = Arc::new(
            SearchManager::<GridEnv, Uct>::new(
                Arc::new(GridEnv::new(3, 3, 1.0)),
                config,
                UctParams::default(),
            )
            .unwrap(),
        );
        let root = DecisionNode::root_at_timestep(&manager, (0, 0), 1).unwrap();
        assert!(root.is_opponent());
        assert_eq!(root.opponent_coeff(), -1.0);

        let mut root_inner = root.lock_inner();
        let chance = root.child_for_action(&mut root_inner, &GridAction::Right).unwrap();
        drop(root_inner);
        assert!(chance.is_opponent());
        let mut chance_inner = chance.lock_inner();
        let child = chance.child_for_observation(&mut chance_inner, &(1, 0)).unwrap();
        drop(chance_inner);
        assert!(!child.is_opponent());
        assert_eq!(child.opponent_coeff(), 1.0);
    }
}
