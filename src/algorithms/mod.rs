// Algorithm is the plug-in point of the search: every algorithm supplies
// its parameter block, its per-node scalar state and its per-trial scratch
// type, plus the select / backup / recommend hooks. The node skeleton and
// the trial engine never change between algorithms.

mod common;
pub mod hmcts;
pub mod ments;
pub mod uct;

pub use common::*;
pub use hmcts::{Hmcts, HmctsParams};
pub use ments::{
    DbMents, Dents, DentsParams, Est, Ments, MentsParams, Rents, Tents,
};
pub use uct::{Puct, Uct, UctParams};

use crate::context::TrialContext;
use crate::env::Environment;
use crate::manager::SearchManager;
use crate::node::{ChanceInner, ChanceNode, DecisionInner, DecisionNode};
use anyhow::Result;

/// Marker trait for algorithm parameter blocks; `validate` runs during
/// manager construction so a bad configuration never yields a live manager.
pub trait AlgorithmParams {
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// The complete trial decomposed relative to one node's position on the
/// path. `rewards_after` is reversed (most recent edge first) and always
/// ends with the terminal heuristic value of the trial.
pub struct BackupView<'a> {
    pub rewards_before: &'a [f64],
    pub rewards_after: &'a [f64],
    pub total_return_after: f64,
    pub total_return: f64,
}

pub trait Algorithm<E: Environment>: Sized + Send + Sync + 'static {
    type Params: AlgorithmParams + Send + Sync + 'static;
    type DecisionData: Send + 'static;
    type ChanceData: Send + 'static;
    type Context: Default + Send + 'static;

    /// Scalar state of a freshly built decision node. `parent` is the
    /// constructing chance node, locked by the caller; `None` at the root.
    fn decision_data(
        manager: &SearchManager<E, Self>,
        state: &E::State,
        actions: &[E::Action],
        heuristic_value: f64,
        parent: Option<(&ChanceNode<E, Self>, &ChanceInner<E, Self>)>,
    ) -> Self::DecisionData;

    /// Scalar state of a freshly built chance node. The constructing
    /// decision node is locked by the caller.
    fn chance_data(
        manager: &SearchManager<E, Self>,
        parent: &DecisionNode<E, Self>,
        parent_inner: &DecisionInner<E, Self>,
        action: &E::Action,
        local_reward: f64,
        heuristic_value: f64,
    ) -> Self::ChanceData;

    /// Called under the node lock on every selection pass, after the visit
    /// counter was bumped.
    fn visit_decision(
        node: &DecisionNode<E, Self>,
        inner: &mut DecisionInner<E, Self>,
        ctx: &mut TrialContext<E, Self>,
    ) -> Result<()> {
        let _ = (node, inner, ctx);
        Ok(())
    }

    fn select_action(
        node: &DecisionNode<E, Self>,
        inner: &mut DecisionInner<E, Self>,
        ctx: &mut TrialContext<E, Self>,
    ) -> Result<E::Action>;

    fn visit_chance(
        node: &ChanceNode<E, Self>,
        inner: &mut ChanceInner<E, Self>,
        ctx: &mut TrialContext<E, Self>,
    ) -> Result<()> {
        let _ = (node, inner, ctx);
        Ok(())
    }

    /// Samples an outcome at a chance node. The default threads the RNG
    /// service through the environment's generative model.
    fn sample_observation(
        node: &ChanceNode<E, Self>,
        inner: &mut ChanceInner<E, Self>,
        ctx: &mut TrialContext<E, Self>,
    ) -> Result<E::Observation> {
        let _ = (inner, ctx);
        let manager = node.manager();
        Ok(manager.rng().with_rng(|rng| {
            let next_state = manager.env.sample_transition(node.state(), node.action(), rng);
            manager.env.sample_observation(node.action(), &next_state, rng)
        }))
    }

    fn backup_chance(
        node: &ChanceNode<E, Self>,
        inner: &mut ChanceInner<E, Self>,
        backup: &BackupView<'_>,
        ctx: &mut TrialContext<E, Self>,
    ) -> Result<()>;

    fn backup_decision(
        node: &DecisionNode<E, Self>,
        inner: &mut DecisionInner<E, Self>,
        backup: &BackupView<'_>,
        ctx: &mut TrialContext<E, Self>,
    ) -> Result<()>;

    /// Recommends an action at a node with at least one child. The caller
    /// handles the zero-children fallback.
    fn recommend_action(
        node: &DecisionNode<E, Self>,
        inner: &DecisionInner<E, Self>,
    ) -> Result<E::Action>;

    /// Scalar summary of a decision node, used by the logger and the tree
    /// pretty-printer.
    fn decision_value(data: &Self::DecisionData) -> f64;

    fn chance_value(data: &Self::ChanceData) -> f64;

    fn decision_value_string(data: &Self::DecisionData) -> String {
        format!("{:.4}", Self::decision_value(data))
    }

    fn chance_value_string(data: &Self::ChanceData) -> String {
        format!("{:.4}", Self::chance_value(data))
    }
}
