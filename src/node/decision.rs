// decision nodes: where an action gets picked

use super::chance::{ChanceInner, ChanceNode};
use super::{NodeSnapshot, print_tabs};
use crate::algorithms::{Algorithm, BackupView};
use crate::context::TrialContext;
use crate::env::Environment;
use crate::manager::SearchManager;
use anyhow::{Result, bail, ensure};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Mutable half of a decision node, only touched under the node lock.
pub struct DecisionInner<E: Environment, A: Algorithm<E>> {
    pub num_visits: usize,
    pub children: HashMap<E::Action, Arc<ChanceNode<E, A>>>,
    pub data: A::DecisionData,
}

pub struct DecisionNode<E: Environment, A: Algorithm<E>> {
    manager: Arc<SearchManager<E, A>>,
    state: Arc<E::State>,
    actions: Vec<E::Action>,
    is_sink: bool,
    heuristic_value: f64,
    decision_depth: usize,
    decision_timestep: usize,
    /// Non-owning back-reference to the constructing parent; breaks the
    /// ownership cycle with the children maps.
    parent: Option<Weak<ChanceNode<E, A>>>,
    inner: Mutex<DecisionInner<E, A>>,
}

impl<E: Environment, A: Algorithm<E>> DecisionNode<E, A> {
    /// Root node for a fresh query, at decision timestep 0.
    pub fn root(manager: &Arc<SearchManager<E, A>>, state: E::State) -> Result<Arc<Self>> {
        Self::root_at_timestep(manager, state, 0)
    }

    /// Root node planning from the middle of an episode. In a two-player
    /// game an odd timestep makes the root an opponent node.
    pub fn root_at_timestep(
        manager: &Arc<SearchManager<E, A>>,
        state: E::State,
        decision_timestep: usize,
    ) -> Result<Arc<Self>> {
        Self::build(manager, Arc::new(state), 0, decision_timestep, None)
    }

    pub(crate) fn build(
        manager: &Arc<SearchManager<E, A>>,
        state: Arc<E::State>,
        decision_depth: usize,
        decision_timestep: usize,
        parent: Option<(&Arc<ChanceNode<E, A>>, &ChanceInner<E, A>)>,
    ) -> Result<Arc<Self>> {
        let is_sink = manager.env.is_sink_state(&state);
        let actions = manager.env.valid_actions(&state);
        ensure!(
            is_sink == actions.is_empty(),
            "environment bug: state {:?} is_sink={} but has {} valid actions",
            state,
            is_sink,
            actions.len()
        );
        let heuristic_value = manager.heuristic_value(&state, None);
        let data = A::decision_data(
            manager,
            &state,
            &actions,
            heuristic_value,
            parent.map(|(node, inner)| (&**node, inner)),
        );
        Ok(Arc::new(DecisionNode {
            manager: Arc::clone(manager),
            state,
            actions,
            is_sink,
            heuristic_value,
            decision_depth,
            decision_timestep,
            parent: parent.map(|(node, _)| Arc::downgrade(node)),
            inner: Mutex::new(DecisionInner {
                num_visits: 0,
                children: HashMap::new(),
                data,
            }),
        }))
    }

    pub fn manager(&self) -> &Arc<SearchManager<E, A>> {
        &self.manager
    }

    pub fn state(&self) -> &E::State {
        &self.state
    }

    pub(crate) fn state_arc(&self) -> &Arc<E::State> {
        &self.state
    }

    pub fn actions(&self) -> &[E::Action] {
        &self.actions
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

    pub fn parent(&self) -> Option<Arc<ChanceNode<E, A>>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn is_root(&self) -> bool {
        self.decision_depth == 0
    }

    pub fn is_sink(&self) -> bool {
        self.is_sink
    }

    /// A leaf with respect to the search: sink state or maximum depth.
    pub fn is_leaf(&self) -> bool {
        self.is_sink || self.decision_depth >= self.manager.config.max_depth
    }

    pub fn is_two_player_game(&self) -> bool {
        self.manager.config.is_two_player_game
    }

    /// Opponent nodes live at odd decision timesteps of a two-player game.
    pub fn is_opponent(&self) -> bool {
        self.is_two_player_game() && (self.decision_timestep & 1) == 1
    }

    /// -1.0 at opponent nodes, 1.0 otherwise. Values in the tree are stored
    /// from the first player's perspective; this flips the per-node
    /// optimisation direction, never the rewards themselves.
    pub fn opponent_coeff(&self) -> f64 {
        if self.is_opponent() { -1.0 } else { 1.0 }
    }

    pub fn lock_inner(&self) -> MutexGuard<'_, DecisionInner<E, A>> {
        self.inner.lock().expect("decision node lock poisoned")
    }

    pub fn num_visits(&self) -> usize {
        self.lock_inner().num_visits
    }

    pub fn num_children(&self) -> usize {
        self.lock_inner().children.len()
    }

    pub fn has_child(&self, action: &E::Action) -> bool {
        self.lock_inner().children.contains_key(action)
    }

    /// Child lookup for an action that must already have a child.
    pub fn child(&self, action: &E::Action) -> Result<Arc<ChanceNode<E, A>>> {
        match self.lock_inner().children.get(action) {
            Some(child) => Ok(Arc::clone(child)),
            None => bail!("no child chance node for action {:?}", action),
        }
    }

    /// One selection step: visit, pick an action, return the (possibly
    /// fresh) chance child. Holds the node lock for the whole step and
    /// releases it before the caller descends.
    pub fn visit_and_select(
        self: &Arc<Self>,
        ctx: &mut TrialContext<E, A>,
    ) -> Result<(E::Action, Arc<ChanceNode<E, A>>)> {
        let mut inner = self.lock_inner();
        inner.num_visits += 1;
        A::visit_decision(self, &mut inner, ctx)?;
        let action = A::select_action(self, &mut inner, ctx)?;
        let child = self.child_for_action(&mut inner, &action)?;
        Ok((action, child))
    }

    /// Visit without selection, used on the final node of a trial.
    pub fn visit(self: &Arc<Self>, ctx: &mut TrialContext<E, A>) -> Result<()> {
        let mut inner = self.lock_inner();
        inner.num_visits += 1;
        A::visit_decision(self, &mut inner, ctx)
    }

    /// Child construction protocol. Requires the node lock to be held (the
    /// caller owns `inner`); briefly takes one transposition stripe lock.
    pub fn child_for_action(
        self: &Arc<Self>,
        inner: &mut DecisionInner<E, A>,
        action: &E::Action,
    ) -> Result<Arc<ChanceNode<E, A>>> {
        if let Some(child) = inner.children.get(action) {
            return Ok(Arc::clone(child));
        }

        if !self.manager.config.use_transposition_table {
            let child = ChanceNode::build(self, inner, action.clone())?;
            inner.children.insert(action.clone(), Arc::clone(&child));
            return Ok(child);
        }

        let key = (
            self.decision_timestep,
            E::State::clone(&self.state),
            action.clone(),
        );
        let mut stripe = self.manager.chance_table.lock_stripe(&key);
        if let Some(shared) = stripe.get(&key) {
            let child = Arc::clone(shared);
            inner.children.insert(action.clone(), Arc::clone(&child));
            return Ok(child);
        }
        let child = ChanceNode::build(self, inner, action.clone())?;
        inner.children.insert(action.clone(), Arc::clone(&child));
        stripe.insert(key, Arc::clone(&child));
        Ok(child)
    }

    pub fn backup(
        self: &Arc<Self>,
        backup: &BackupView<'_>,
        ctx: &mut TrialContext<E, A>,
    ) -> Result<()> {
        let mut inner = self.lock_inner();
        A::backup_decision(self, &mut inner, backup, ctx)
    }

    /// Recommends an action. With zero children a uniformly random valid
    /// action is returned; a sink node has nothing to recommend and raises.
    pub fn recommend_action(&self) -> Result<E::Action> {
        if self.is_sink {
            bail!("cannot recommend an action at a sink state {:?}", self.state);
        }
        let inner = self.lock_inner();
        if inner.children.is_empty() {
            let index = self.manager.rand_int(0, self.actions.len());
            return Ok(self.actions[index].clone());
        }
        A::recommend_action(self, &inner)
    }

    /// Headline statistics under the node lock, for logging.
    pub fn snapshot(&self) -> NodeSnapshot {
        let inner = self.lock_inner();
        NodeSnapshot {
            num_visits: inner.num_visits,
            value: A::decision_value(&inner.data),
            value_string: A::decision_value_string(&inner.data),
            num_children: inner.children.len(),
        }
    }

    /// Renders the subtree below this node, down to `depth` decision levels.
    pub fn pretty_print(&self, depth: usize) -> String {
        let mut out = String::new();
        self.pretty_print_into(&mut out, 2 * depth, 0);
        out
    }

    pub(crate) fn pretty_print_into(&self, out: &mut String, levels: usize, num_tabs: usize) {
        let (value_string, num_visits, children) = {
            let inner = self.lock_inner();
            let children: Vec<(E::Action, Arc<ChanceNode<E, A>>)> = inner
                .children
                .iter()
                .map(|(action, child)| (action.clone(), Arc::clone(child)))
                .collect();
            (A::decision_value_string(&inner.data), inner.num_visits, children)
        };
        out.push_str(&format!("D(vl={},#v={})[", value_string, num_visits));
        if levels == 0 {
            if !self.is_leaf() {
                out.push_str("...");
            }
            out.push_str("],");
            return;
        }
        for (action, child) in children {
            out.push('\n');
            print_tabs(out, num_tabs + 1);
            out.push_str(&format!("\"{:?}\"->", action));
            child.pretty_print_into(out, levels - 1, num_tabs + 1);
        }
        out.push('\n');
        print_tabs(out, num_tabs);
        out.push_str("],");
    }
}
