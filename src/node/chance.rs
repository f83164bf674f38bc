// chance nodes: where nature (or the opponent's dice) picks an outcome

use super::decision::{DecisionInner, DecisionNode};
use super::print_tabs;
use crate::algorithms::{Algorithm, BackupView};
use crate::context::TrialContext;
use crate::env::Environment;
use crate::manager::SearchManager;
use anyhow::{Result, bail, ensure};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Mutable half of a chance node, only touched under the node lock.
pub struct ChanceInner<E: Environment, A: Algorithm<E>> {
    pub num_visits: usize,
    pub children: HashMap<E::Observation, Arc<DecisionNode<E, A>>>,
    /// Lazily cached successor distribution, filled on first need.
    pub transition: Option<Vec<(E::State, f64)>>,
    pub data: A::ChanceData,
}

pub struct ChanceNode<E: Environment, A: Algorithm<E>> {
    manager: Arc<SearchManager<E, A>>,
    state: Arc<E::State>,
    action: E::Action,
    /// Cached `R(state, action)`; observation-dependent rewards are
    /// computed per edge by the trial engine instead.
    local_reward: f64,
    heuristic_value: f64,
    decision_depth: usize,
    decision_timestep: usize,
    parent: Weak<DecisionNode<E, A>>,
    inner: Mutex<ChanceInner<E, A>>,
}

impl<E: Environment, A: Algorithm<E>> ChanceNode<E, A> {
    /// Built by `DecisionNode::child_for_action` only; the parent holds its
    /// own lock while this runs.
    pub(crate) fn build(
        parent: &Arc<DecisionNode<E, A>>,
        parent_inner: &DecisionInner<E, A>,
        action: E::Action,
    ) -> Result<Arc<Self>> {
        let manager = Arc::clone(parent.manager());
        let state = Arc::clone(parent.state_arc());
        let local_reward = manager.env.reward(&state, &action, None);
        let heuristic_value = manager.heuristic_value(&state, Some(&action));
        let data = A::chance_data(
            &manager,
            parent,
            parent_inner,
            &action,
            local_reward,
            heuristic_value,
        );
        Ok(Arc::new(ChanceNode {
            state,
            action,
            local_reward,
            heuristic_value,
            decision_depth: parent.decision_depth(),
            decision_timestep: parent.decision_timestep(),
            parent: Arc::downgrade(parent),
            inner: Mutex::new(ChanceInner {
                num_visits: 0,
                children: HashMap::new(),
                transition: None,
                data,
            }),
            manager,
        }))
    }

    pub fn manager(&self) -> &Arc<SearchManager<E, A>> {
        &self.manager
    }

    pub fn state(&self) -> &E::State {
        &self.state
    }

    pub fn action(&self) -> &E::Action {
        &self.action
    }

    pub fn local_reward(&self) -> f64 {
        self.local_reward
    }

    pub fn heuristic_value(&self) -> f64 {
        self.heuristic_value
    }

    pub fn decision_depth(&self) -> usize {
        self.decision_depth
    }

    pub fn decision_timestep(&self) -> usize {
        self.decision_timestep
    }

    pub fn parent(&self) -> Option<Arc<DecisionNode<E, A>>> {
        self.parent.upgrade()
    }

    pub fn is_two_player_game(&self) -> bool {
        self.manager.config.is_two_player_game
    }

    pub fn is_opponent(&self) -> bool {
        self.is_two_player_game() && (self.decision_timestep & 1) == 1
    }

    pub fn opponent_coeff(&self) -> f64 {
        if self.is_opponent() { -1.0 } else { 1.0 }
    }

    pub fn lock_inner(&self) -> MutexGuard<'_, ChanceInner<E, A>> {
        self.inner.lock().expect("chance node lock poisoned")
    }

    pub fn num_visits(&self) -> usize {
        self.lock_inner().num_visits
    }

    pub fn num_children(&self) -> usize {
        self.lock_inner().children.len()
    }

    pub fn has_child(&self, observation: &E::Observation) -> bool {
        self.lock_inner().children.contains_key(observation)
    }

    pub fn child(&self, observation: &E::Observation) -> Result<Arc<DecisionNode<E, A>>> {
        match self.lock_inner().children.get(observation) {
            Some(child) => Ok(Arc::clone(child)),
            None => bail!("no child decision node for observation {:?}", observation),
        }
    }

    /// Successor distribution, cached in the node after the first call.
    /// Validates the environment contract once, on fill.
    pub fn transition_distribution<'a>(
        &self,
        inner: &'a mut ChanceInner<E, A>,
    ) -> Result<&'a [(E::State, f64)]> {
        if inner.transition.is_none() {
            let distr = self.manager.env.transition_distribution(&self.state, &self.action);
            let mass: f64 = distr.iter().map(|(_, p)| p).sum();
            ensure!(
                (mass - 1.0).abs() < 1e-9 && distr.iter().all(|(_, p)| *p > 0.0),
                "environment bug: transition distribution for {:?}/{:?} has mass {} with {} entries",
                self.state,
                self.action,
                mass,
                distr.len()
            );
            inner.transition = Some(distr);
        }
        Ok(inner.transition.as_deref().unwrap_or_default())
    }

    /// One selection step: visit, sample an outcome, return the child
    /// decision node plus whether the children map grew (which ends the
    /// trial in MCTS mode). Holds the node lock across the whole step.
    pub fn visit_and_sample(
        self: &Arc<Self>,
        ctx: &mut TrialContext<E, A>,
    ) -> Result<(E::Observation, Arc<DecisionNode<E, A>>, bool)> {
        let mut inner = self.lock_inner();
        let children_before = inner.children.len();
        inner.num_visits += 1;
        A::visit_chance(self, &mut inner, ctx)?;
        let observation = A::sample_observation(self, &mut inner, ctx)?;
        let child = self.child_for_observation(&mut inner, &observation)?;
        let created = inner.children.len() > children_before;
        Ok((observation, child, created))
    }

    /// Child construction protocol, mirroring the decision-node side.
    pub fn child_for_observation(
        self: &Arc<Self>,
        inner: &mut ChanceInner<E, A>,
        observation: &E::Observation,
    ) -> Result<Arc<DecisionNode<E, A>>> {
        if let Some(child) = inner.children.get(observation) {
            return Ok(Arc::clone(child));
        }

        if !self.manager.config.use_transposition_table {
            let child = self.build_decision_child(inner, observation)?;
            inner.children.insert(observation.clone(), Arc::clone(&child));
            return Ok(child);
        }

        let key = (self.decision_timestep, observation.clone());
        let mut stripe = self.manager.decision_table.lock_stripe(&key);
        if let Some(shared) = stripe.get(&key) {
            let child = Arc::clone(shared);
            inner.children.insert(observation.clone(), Arc::clone(&child));
            return Ok(child);
        }
        let child = self.build_decision_child(inner, observation)?;
        inner.children.insert(observation.clone(), Arc::clone(&child));
        stripe.insert(key, Arc::clone(&child));
        Ok(child)
    }

    fn build_decision_child(
        self: &Arc<Self>,
        inner: &ChanceInner<E, A>,
        observation: &E::Observation,
    ) -> Result<Arc<DecisionNode<E, A>>> {
        let next_state: E::State = observation.clone().into();
        DecisionNode::build(
            &self.manager,
            Arc::new(next_state),
            self.decision_depth + 1,
            self.decision_timestep + 1,
            Some((self, inner)),
        )
    }

    pub fn backup(
        self: &Arc<Self>,
        backup: &BackupView<'_>,
        ctx: &mut TrialContext<E, A>,
    ) -> Result<()> {
        let mut inner = self.lock_inner();
        A::backup_chance(self, &mut inner, backup, ctx)
    }

    pub fn pretty_print(&self, depth: usize) -> String {
        let mut out = String::new();
        self.pretty_print_into(&mut out, 2 * depth + 1, 0);
        out
    }

    pub(crate) fn pretty_print_into(&self, out: &mut String, levels: usize, num_tabs: usize) {
        let (value_string, num_visits, children) = {
            let inner = self.lock_inner();
            let children: Vec<(E::Observation, Arc<DecisionNode<E, A>>)> = inner
                .children
                .iter()
                .map(|(observation, child)| (observation.clone(), Arc::clone(child)))
                .collect();
            (A::chance_value_string(&inner.data), inner.num_visits, children)
        };
        out.push_str(&format!("C(vl={},#v={})[", value_string, num_visits));
        if levels == 0 {
            out.push_str("...],");
            return;
        }
        for (observation, child) in children {
            out.push('\n');
            print_tabs(out, num_tabs + 1);
            out.push_str(&format!("{{{:?}}}->", observation));
            child.pretty_print_into(out, levels - 1, num_tabs + 1);
        }
        out.push('\n');
        print_tabs(out, num_tabs);
        out.push_str("],");
    }
}
