// search-wide configuration, shared by every algorithm

use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

/// Options consulted by the tree skeleton and the trial engine. Algorithm
/// specific parameters live in the respective `*Params` structs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Maximum decision depth a trial may reach.
    pub max_depth: usize,
    /// If true, a trial ends as soon as a new decision node was created
    /// (classical MCTS). If false, trials run to a sink state or max depth.
    pub mcts_mode: bool,
    /// Planning for a two-player game: nodes at odd decision timesteps act
    /// as the opponent and invert their optimisation direction.
    pub is_two_player_game: bool,
    /// Share nodes that agree on their transposition key.
    pub use_transposition_table: bool,
    /// Number of stripe locks protecting each transposition table.
    pub num_transposition_table_mutexes: usize,
    /// Master seed. Worker threads derive their own generators from it.
    pub seed: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            max_depth: 250,
            mcts_mode: true,
            is_two_player_game: false,
            use_transposition_table: false,
            num_transposition_table_mutexes: 1,
            seed: 0,
        }
    }
}

impl SearchConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_depth > 0, "max_depth must be positive");
        ensure!(
            self.num_transposition_table_mutexes > 0,
            "need at least one transposition table mutex"
        );
        Ok(())
    }
}
