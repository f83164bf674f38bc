// SearchManager holds everything that is "global" to a single planning
// query: the environment, configuration, algorithm parameters, the optional
// heuristic and prior hooks, the RNG service and the two transposition
// tables with their stripe locks.

use crate::algorithms::{Algorithm, AlgorithmParams};
use crate::config::SearchConfig;
use crate::env::Environment;
use crate::node::{ChanceNode, DecisionNode};
use crate::rng::RngService;
use anyhow::Result;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Leaf value estimate for a state (and optionally an action), used to seed
/// fresh nodes and as the terminal reward of a trial.
pub type HeuristicFn<E> = Arc<
    dyn Fn(&<E as Environment>::State, Option<&<E as Environment>::Action>) -> f64 + Send + Sync,
>;

/// Prior policy over the valid actions of a state; probabilities sum to 1.
pub type PriorFn<E> = Arc<
    dyn Fn(&<E as Environment>::State) -> HashMap<<E as Environment>::Action, f64> + Send + Sync,
>;

/// Transposition key for decision nodes: the constructing chance node's
/// decision timestep plus the observation leading to the child.
pub type DecisionKey<E> = (usize, <E as Environment>::Observation);

/// Transposition key for chance nodes: decision timestep, state and action.
pub type ChanceKey<E> = (
    usize,
    <E as Environment>::State,
    <E as Environment>::Action,
);

/// Hash map sharded over a stripe of mutexes so that concurrent inserts of
/// unrelated keys do not serialise.
pub struct StripedTable<K, V> {
    stripes: Vec<Mutex<HashMap<K, V>>>,
}

impl<K: Eq + Hash, V> StripedTable<K, V> {
    fn new(num_stripes: usize) -> Self {
        StripedTable {
            stripes: (0..num_stripes.max(1))
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
        }
    }

    /// Locks and returns the stripe responsible for `key`. The caller runs
    /// its check-and-insert against the returned guard.
    pub fn lock_stripe(&self, key: &K) -> MutexGuard<'_, HashMap<K, V>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() % self.stripes.len() as u64) as usize;
        self.stripes[index]
            .lock()
            .expect("transposition stripe lock poisoned")
    }

    pub fn len(&self) -> usize {
        self.stripes
            .iter()
            .map(|stripe| stripe.lock().expect("transposition stripe lock poisoned").len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&self) -> usize {
        let mut removed = 0;
        for stripe in &self.stripes {
            let mut map = stripe.lock().expect("transposition stripe lock poisoned");
            removed += map.len();
            map.clear();
        }
        removed
    }
}

pub struct SearchManager<E: Environment, A: Algorithm<E>> {
    pub env: Arc<E>,
    pub config: SearchConfig,
    pub params: A::Params,
    pub heuristic_fn: Option<HeuristicFn<E>>,
    pub prior_fn: Option<PriorFn<E>>,
    pub(crate) rng: RngService,
    pub(crate) decision_table: StripedTable<DecisionKey<E>, Arc<DecisionNode<E, A>>>,
    pub(crate) chance_table: StripedTable<ChanceKey<E>, Arc<ChanceNode<E, A>>>,
}

impl<E: Environment, A: Algorithm<E>> SearchManager<E, A> {
    pub fn new(env: Arc<E>, config: SearchConfig, params: A::Params) -> Result<Self> {
        config.validate()?;
        params.validate()?;
        let num_stripes = config.num_transposition_table_mutexes;
        Ok(SearchManager {
            env,
            rng: RngService::new(config.seed),
            config,
            params,
            heuristic_fn: None,
            prior_fn: None,
            decision_table: StripedTable::new(num_stripes),
            chance_table: StripedTable::new(num_stripes),
        })
    }

    pub fn with_heuristic(mut self, heuristic_fn: HeuristicFn<E>) -> Self {
        self.heuristic_fn = Some(heuristic_fn);
        self
    }

    pub fn with_prior(mut self, prior_fn: PriorFn<E>) -> Self {
        self.prior_fn = Some(prior_fn);
        self
    }

    pub fn heuristic_value(&self, state: &E::State, action: Option<&E::Action>) -> f64 {
        match &self.heuristic_fn {
            Some(heuristic_fn) => heuristic_fn(state, action),
            None => 0.0,
        }
    }

    pub fn prior_policy(&self, state: &E::State) -> Option<HashMap<E::Action, f64>> {
        self.prior_fn.as_ref().map(|prior_fn| prior_fn(state))
    }

    pub fn rand_int(&self, lo: usize, hi: usize) -> usize {
        self.rng.rand_int(lo, hi)
    }

    pub fn rand_uniform(&self) -> f64 {
        self.rng.rand_uniform()
    }

    pub(crate) fn rng(&self) -> &RngService {
        &self.rng
    }

    /// Empties both transposition tables. The tables hold strong references
    /// to their nodes and the nodes hold the manager, so a query that used
    /// transposition must tear the tables down when it is done, or the whole
    /// tree outlives the last external reference.
    pub fn teardown(&self) {
        let decision_nodes = self.decision_table.clear();
        let chance_nodes = self.chance_table.clear();
        if decision_nodes + chance_nodes > 0 {
            debug!(decision_nodes, chance_nodes, "cleared transposition tables");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn striped_table_concurrent_insert_keeps_one_value_per_key() {
        let table: Arc<StripedTable<(usize, u32), Arc<u64>>> = Arc::new(StripedTable::new(4));
        let mut handles = Vec::new();
        for t in 0..8u64 {
            let table = Arc::clone(&table);
            handles.push(thread::spawn(move || {
                for key in 0..64u32 {
                    let mut stripe = table.lock_stripe(&(0, key));
                    stripe.entry((0, key)).or_insert_with(|| Arc::new(t));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(table.len(), 64);
        // each key holds exactly one shared value now; re-inserting does not replace it
        let first = Arc::clone(table.lock_stripe(&(0, 7)).get(&(0, 7)).unwrap());
        let second = Arc::clone(table.lock_stripe(&(0, 7)).get(&(0, 7)).unwrap());
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn clear_empties_every_stripe() {
        let table: StripedTable<(usize, u32), u32> = StripedTable::new(3);
        for key in 0..10 {
            table.lock_stripe(&(1, key)).insert((1, key), key);
        }
        assert_eq!(table.clear(), 10);
        assert!(table.is_empty());
    }
}
