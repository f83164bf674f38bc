// Monte-Carlo policy evaluation: roll out the tree's recommendations
//
// EvalPolicy walks the search tree alongside the environment, following
// recommendations while the trajectory stays inside known territory and
// falling back to uniform random actions once it leaves. MCEvaluator runs
// many such rollouts in parallel and reports the return statistics.

use crate::algorithms::Algorithm;
use crate::env::Environment;
use crate::node::DecisionNode;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::sync::Arc;
use tracing::debug;

pub struct EvalPolicy<E: Environment, A: Algorithm<E>> {
    root: Arc<DecisionNode<E, A>>,
    cur: Option<Arc<DecisionNode<E, A>>>,
    env: Arc<E>,
}

impl<E: Environment, A: Algorithm<E>> Clone for EvalPolicy<E, A> {
    fn clone(&self) -> Self {
        EvalPolicy {
            root: Arc::clone(&self.root),
            cur: Some(Arc::clone(&self.root)),
            env: Arc::clone(&self.env),
        }
    }
}

impl<E: Environment, A: Algorithm<E>> EvalPolicy<E, A> {
    pub fn new(root: Arc<DecisionNode<E, A>>, env: Arc<E>) -> Self {
        EvalPolicy {
            cur: Some(Arc::clone(&root)),
            root,
            env,
        }
    }

    pub fn reset(&mut self) {
        self.cur = Some(Arc::clone(&self.root));
    }

    fn random_action(&self, state: &E::State, rng: &mut SmallRng) -> Option<E::Action> {
        let actions = self.env.valid_actions(state);
        if actions.is_empty() {
            return None;
        }
        let index = rng.random_range(0..actions.len());
        Some(actions[index].clone())
    }

    /// The tree's recommendation at the current node, or a uniformly
    /// random valid action outside the tree.
    pub fn get_action(&self, state: &E::State, rng: &mut SmallRng) -> Option<E::Action> {
        match &self.cur {
            Some(node) => node
                .recommend_action()
                .ok()
                .or_else(|| self.random_action(state, rng)),
            None => self.random_action(state, rng),
        }
    }

    /// Follow the taken edge down the tree; leaves the tree (permanently,
    /// until reset) when the edge was never expanded.
    pub fn update_step(&mut self, action: &E::Action, observation: &E::Observation) {
        let next = self.cur.take().and_then(|node| {
            let chance = node.child(action).ok()?;
            chance.child(observation).ok()
        });
        self.cur = next;
    }
}

pub struct MCEvaluator<E: Environment, A: Algorithm<E>> {
    env: Arc<E>,
    policy: EvalPolicy<E, A>,
    max_trial_length: usize,
    seed: u64,
    sampled_returns: Vec<f64>,
}

impl<E: Environment, A: Algorithm<E>> MCEvaluator<E, A> {
    pub fn new(env: Arc<E>, policy: EvalPolicy<E, A>, max_trial_length: usize, seed: u64) -> Self {
        MCEvaluator {
            env,
            policy,
            max_trial_length,
            seed,
            sampled_returns: Vec::new(),
        }
    }

    fn run_rollout(&self, rollout_id: u64) -> f64 {
        let mut rng = SmallRng::seed_from_u64(self.seed.wrapping_add(rollout_id));
        let mut policy = self.policy.clone();
        let mut state = self.env.initial_state();
        let mut sample_return = 0.0;
        let mut steps = 0;
        while steps < self.max_trial_length && !self.env.is_sink_state(&state) {
            let Some(action) = policy.get_action(&state, &mut rng) else {
                break;
            };
            let next_state = self.env.sample_transition(&state, &action, &mut rng);
            let observation = self.env.sample_observation(&action, &next_state, &mut rng);
            sample_return += self.env.reward(&state, &action, Some(&observation));
            policy.update_step(&action, &observation);
            state = next_state;
            steps += 1;
        }
        sample_return
    }

    pub fn run_rollouts(&mut self, num_rollouts: usize) {
        let offset = self.sampled_returns.len() as u64;
        let mut returns: Vec<f64> = (0..num_rollouts as u64)
            .into_par_iter()
            .map(|rollout_id| self.run_rollout(offset + rollout_id))
            .collect();
        self.sampled_returns.append(&mut returns);
        debug!(
            rollouts = self.sampled_returns.len(),
            mean = self.mean(),
            "evaluation rollouts finished"
        );
    }

    pub fn sampled_returns(&self) -> &[f64] {
        &self.sampled_returns
    }

    pub fn mean(&self) -> f64 {
        if self.sampled_returns.is_empty() {
            return 0.0;
        }
        self.sampled_returns.iter().sum::<f64>() / self.sampled_returns.len() as f64
    }

    pub fn stddev(&self) -> f64 {
        if self.sampled_returns.len() < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let variance = self
            .sampled_returns
            .iter()
            .map(|sample| (sample - mean) * (sample - mean))
            .sum::<f64>()
            / (self.sampled_returns.len() - 1) as f64;
        variance.sqrt()
    }
}
