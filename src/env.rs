// Environment is the core trait of the search: a generative model of an MDP
// or a two-player turn-based game, since it defines State, Action and
// Observation.
//
// Observation must be convertible from/to State so that fully observable
// environments can simply set `type Observation = State` and inherit the
// identity observation channel from the default methods.

use rand::Rng;
use rand::rngs::SmallRng;
use std::fmt::Debug;
use std::hash::Hash;

/// Bound for the opaque value types carried through the search tree.
/// They are used as hash-map keys and must be cheap enough to clone.
pub trait SearchItem: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T: Clone + Eq + Hash + Debug + Send + Sync + 'static> SearchItem for T {}

pub trait Environment: Send + Sync + 'static {
    type State: SearchItem;
    type Action: SearchItem;
    type Observation: SearchItem + From<Self::State> + Into<Self::State>;
    /// Per-trial scratch bag, owned by the running worker.
    type Context: Default + Send + 'static;

    fn initial_state(&self) -> Self::State;

    fn is_sink_state(&self, state: &Self::State) -> bool;

    /// Ordered sequence of actions valid in `state`. Empty iff `state` is a sink.
    fn valid_actions(&self, state: &Self::State) -> Vec<Self::Action>;

    /// Distribution over successor states. Probabilities are strictly
    /// positive and sum to 1.0.
    fn transition_distribution(
        &self,
        state: &Self::State,
        action: &Self::Action,
    ) -> Vec<(Self::State, f64)>;

    fn sample_transition(
        &self,
        state: &Self::State,
        action: &Self::Action,
        rng: &mut SmallRng,
    ) -> Self::State {
        let distr = self.transition_distribution(state, action);
        sample_from_distribution(distr, rng)
    }

    /// Distribution over observations given the sampled successor state.
    /// Identity for fully observable environments.
    fn observation_distribution(
        &self,
        _action: &Self::Action,
        next_state: &Self::State,
    ) -> Vec<(Self::Observation, f64)> {
        vec![(next_state.clone().into(), 1.0)]
    }

    fn sample_observation(
        &self,
        _action: &Self::Action,
        next_state: &Self::State,
        _rng: &mut SmallRng,
    ) -> Self::Observation {
        next_state.clone().into()
    }

    /// Reward for a `(state, action, observation)` tuple. Most environments
    /// only depend on the state-action pair and ignore the observation.
    fn reward(
        &self,
        state: &Self::State,
        action: &Self::Action,
        observation: Option<&Self::Observation>,
    ) -> f64;

    /// Samples a context used as scratch space throughout a single trial.
    /// Environments that need per-thread mutable assets should key them by
    /// `thread_id` internally.
    fn sample_context(&self, _thread_id: usize, _state: &Self::State) -> Self::Context {
        Self::Context::default()
    }
}

/// Samples an entry from a weighted list, consuming it. The weights do not
/// need to be normalised.
pub(crate) fn sample_from_distribution<T>(distr: Vec<(T, f64)>, rng: &mut SmallRng) -> T {
    let total: f64 = distr.iter().map(|(_, p)| p).sum();
    let mut threshold = rng.random_range(0.0..total.max(f64::MIN_POSITIVE));
    let num_entries = distr.len();
    for (entry, prob) in distr {
        threshold -= prob;
        if threshold <= 0.0 {
            return entry;
        }
    }
    unreachable!("distribution with {} entries did not cover its own mass", num_entries)
}
