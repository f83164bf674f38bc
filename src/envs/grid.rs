// a minimal deterministic grid: move right or down towards the goal corner
//
// Several action orders reach the same cell, which makes this the natural
// fixture for transposition sharing: with a transposition table the cell
// (1,1) of a 2x2 grid is one shared node reachable along two paths.

use crate::env::Environment;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GridAction {
    Right,
    Down,
}

pub struct GridEnv {
    width: usize,
    height: usize,
    goal_reward: f64,
}

impl GridEnv {
    pub fn new(width: usize, height: usize, goal_reward: f64) -> Self {
        GridEnv {
            width: width.max(1),
            height: height.max(1),
            goal_reward,
        }
    }

    fn is_goal(&self, state: &(usize, usize)) -> bool {
        state.0 == self.width - 1 && state.1 == self.height - 1
    }

    fn step(&self, state: &(usize, usize), action: &GridAction) -> (usize, usize) {
        match action {
            GridAction::Right => ((state.0 + 1).min(self.width - 1), state.1),
            GridAction::Down => (state.0, (state.1 + 1).min(self.height - 1)),
        }
    }
}

impl Environment for GridEnv {
    type State = (usize, usize);
    type Action = GridAction;
    type Observation = (usize, usize);
    type Context = ();

    fn initial_state(&self) -> (usize, usize) {
        (0, 0)
    }

    fn is_sink_state(&self, state: &(usize, usize)) -> bool {
        self.is_goal(state)
    }

    fn valid_actions(&self, state: &(usize, usize)) -> Vec<GridAction> {
        if self.is_sink_state(state) {
            Vec::new()
        } else {
            vec![GridAction::Right, GridAction::Down]
        }
    }

    fn transition_distribution(
        &self,
        state: &(usize, usize),
        action: &GridAction,
    ) -> Vec<((usize, usize), f64)> {
        vec![(self.step(state, action), 1.0)]
    }

    fn reward(&self, state: &(usize, usize), action: &GridAction, _observation: Option<&(usize, usize)>) -> f64 {
        let next = self.step(state, action);
        if self.is_goal(&next) && !self.is_goal(state) {
            self.goal_reward
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_paths_reach_the_diagonal() {
        let env = GridEnv::new(2, 2, 1.0);
        let via_right_down = env.step(&env.step(&(0, 0), &GridAction::Right), &GridAction::Down);
        let via_down_right = env.step(&env.step(&(0, 0), &GridAction::Down), &GridAction::Right);
        assert_eq!(via_right_down, (1, 1));
        assert_eq!(via_down_right, (1, 1));
    }

    #[test]
    fn reward_only_on_entering_the_goal() {
        let env = GridEnv::new(2, 2, 1.0);
        assert_eq!(env.reward(&(0, 0), &GridAction::Right, None), 0.0);
        assert_eq!(env.reward(&(1, 0), &GridAction::Down, None), 1.0);
    }
}
