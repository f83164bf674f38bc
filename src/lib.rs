// trial-based heuristic tree search for MDPs and two-player games

pub mod algorithms;
pub mod config;
pub mod context;
pub mod env;
pub mod envs;
pub mod eval;
pub mod logger;
pub mod logging;
pub mod manager;
pub mod node;
pub mod pool;
pub mod rng;

pub use algorithms::{Algorithm, AlgorithmParams, BackupView};
pub use config::SearchConfig;
pub use context::TrialContext;
pub use env::Environment;
pub use logger::{SearchLogger, TrialLogger};
pub use manager::{HeuristicFn, PriorFn, SearchManager};
pub use node::{ChanceNode, DecisionNode};
pub use pool::TrialPool;
