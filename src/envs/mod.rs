// small concrete environments used in tests and demos

mod chain;
mod frozen_lake;
mod grid;
mod sailing;

pub use chain::{ChainAction, ChainEnv};
pub use frozen_lake::{FrozenLakeEnv, LakeAction};
pub use grid::{GridAction, GridEnv};
pub use sailing::{Compass, SailingEnv};
