// backup mixins shared across algorithm families
//
// Each mixin is a small scalar struct plus free backup functions generic
// over the algorithm's node data. Algorithms compose by embedding the
// structs in their data types and implementing the accessor traits; no
// composition is ever deeper than one level.

mod decay;
mod dp;
mod emp;
mod entropy;

pub use decay::{TempDecay, decayed_temp};
pub use dp::{DpStats, HasDpStats, backup_dp_chance, backup_dp_decision, recommend_best_dp_action};
pub use emp::{EmpStats, HasEmpStats, recommend_best_emp_action, recommend_most_visited_action};
pub use entropy::{
    EntChanceStats, EntDecisionStats, HasEntChanceStats, HasEntDecisionStats, backup_ent_chance,
    backup_ent_decision,
};

use crate::algorithms::Algorithm;
use crate::env::Environment;
use crate::manager::SearchManager;
use anyhow::{Result, ensure};

/// Argmax over scored actions with uniformly random tie-breaking.
pub(crate) fn pick_best_action<E, A>(
    manager: &SearchManager<E, A>,
    scored: &[(&E::Action, f64)],
) -> Result<E::Action>
where
    E: Environment,
    A: Algorithm<E>,
{
    ensure!(!scored.is_empty(), "action choice over an empty candidate set");
    let best_value = scored
        .iter()
        .map(|(_, value)| *value)
        .fold(f64::NEG_INFINITY, f64::max);
    let best: Vec<&E::Action> = scored
        .iter()
        .filter(|(_, value)| *value >= best_value)
        .map(|(action, _)| *action)
        .collect();
    let index = manager.rand_int(0, best.len());
    Ok(best[index].clone())
}
