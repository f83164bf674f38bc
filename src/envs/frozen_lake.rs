// FrozenLake: a char-map grid with holes, a goal and time-discounted reward
//
// The map rows are owned by the environment. States carry a timestep so
// the reward for reaching the goal can be discounted by the number of
// steps taken; holes and the goal are sinks. Moves that would leave the
// map clamp to the border.

use crate::env::Environment;
use anyhow::{Result, ensure};

const HOLE: u8 = b'H';
const GOAL: u8 = b'G';

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LakeAction {
    Right,
    Down,
    Left,
    Up,
}

impl LakeAction {
    fn delta(self) -> (isize, isize) {
        match self {
            LakeAction::Right => (1, 0),
            LakeAction::Down => (0, 1),
            LakeAction::Left => (-1, 0),
            LakeAction::Up => (0, -1),
        }
    }
}

pub struct FrozenLakeEnv {
    rows: Vec<String>,
    width: usize,
    height: usize,
    reward_discount_factor: f64,
}

impl FrozenLakeEnv {
    pub fn new(rows: Vec<String>, reward_discount_factor: f64) -> Result<Self> {
        ensure!(!rows.is_empty(), "frozen lake map needs at least one row");
        let width = rows[0].len();
        ensure!(width > 0, "frozen lake map rows must not be empty");
        ensure!(
            rows.iter().all(|row| row.len() == width),
            "frozen lake map must be rectangular"
        );
        ensure!(
            (0.0..=1.0).contains(&reward_discount_factor) && reward_discount_factor > 0.0,
            "reward discount factor must lie in (0,1]"
        );
        Ok(FrozenLakeEnv {
            height: rows.len(),
            width,
            rows,
            reward_discount_factor,
        })
    }

    fn cell(&self, x: usize, y: usize) -> u8 {
        self.rows[y].as_bytes()[x]
    }

    fn next_location(&self, state: &(usize, usize, usize), action: &LakeAction) -> (usize, usize) {
        let (dx, dy) = action.delta();
        let x = (state.0 as isize + dx).clamp(0, self.width as isize - 1) as usize;
        let y = (state.1 as isize + dy).clamp(0, self.height as isize - 1) as usize;
        (x, y)
    }
}

impl Environment for FrozenLakeEnv {
    /// `(x, y, t)`: position plus the number of steps taken so far.
    type State = (usize, usize, usize);
    type Action = LakeAction;
    type Observation = (usize, usize, usize);
    type Context = ();

    fn initial_state(&self) -> Self::State {
        (0, 0, 0)
    }

    fn is_sink_state(&self, state: &Self::State) -> bool {
        matches!(self.cell(state.0, state.1), HOLE | GOAL)
    }

    fn valid_actions(&self, state: &Self::State) -> Vec<LakeAction> {
        if self.is_sink_state(state) {
            Vec::new()
        } else {
            vec![LakeAction::Right, LakeAction::Down, LakeAction::Left, LakeAction::Up]
        }
    }

    fn transition_distribution(
        &self,
        state: &Self::State,
        action: &LakeAction,
    ) -> Vec<(Self::State, f64)> {
        let (x, y) = self.next_location(state, action);
        vec![((x, y, state.2 + 1), 1.0)]
    }

    fn reward(&self, state: &Self::State, action: &LakeAction, _observation: Option<&Self::State>) -> f64 {
        let (x, y) = self.next_location(state, action);
        if self.cell(x, y) == GOAL {
            self.reward_discount_factor.powi(state.2 as i32 + 1)
        } else {
            0.0
        }
    }
}
