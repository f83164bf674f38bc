// D-chain: a line of D cells with a tempting early exit
//
// Moving right walks the chain towards a single big reward on the final
// link; moving down pays an immediate reward that shrinks the further the
// agent got, then terminates. A planner that over-values quick payoffs
// gets lured off the chain.

use crate::env::Environment;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChainAction {
    Right,
    Down,
}

pub struct ChainEnv {
    length: i64,
    final_reward: f64,
}

impl ChainEnv {
    pub fn new(length: usize, final_reward: f64) -> Self {
        ChainEnv {
            length: length as i64,
            final_reward,
        }
    }

    pub fn length(&self) -> usize {
        self.length as usize
    }
}

impl Environment for ChainEnv {
    /// Position on the chain; -1 after dropping out, `length` past the end.
    type State = i64;
    type Action = ChainAction;
    type Observation = i64;
    type Context = ();

    fn initial_state(&self) -> i64 {
        0
    }

    fn is_sink_state(&self, state: &i64) -> bool {
        *state == -1 || *state == self.length
    }

    fn valid_actions(&self, state: &i64) -> Vec<ChainAction> {
        if self.is_sink_state(state) {
            Vec::new()
        } else {
            vec![ChainAction::Right, ChainAction::Down]
        }
    }

    fn transition_distribution(&self, state: &i64, action: &ChainAction) -> Vec<(i64, f64)> {
        let next = match action {
            ChainAction::Right => state + 1,
            ChainAction::Down => -1,
        };
        vec![(next, 1.0)]
    }

    fn reward(&self, state: &i64, action: &ChainAction, _observation: Option<&i64>) -> f64 {
        match action {
            ChainAction::Down => (self.length - state - 1) as f64 / self.length as f64,
            ChainAction::Right if *state == self.length - 1 => self.final_reward,
            ChainAction::Right => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_terminates_at_both_ends() {
        let env = ChainEnv::new(5, 1.0);
        assert!(env.is_sink_state(&-1));
        assert!(env.is_sink_state(&5));
        assert!(!env.is_sink_state(&0));
        assert!(env.valid_actions(&5).is_empty());
        assert_eq!(env.valid_actions(&2).len(), 2);
    }

    #[test]
    fn down_pays_less_the_further_right() {
        let env = ChainEnv::new(5, 1.0);
        let at_start = env.reward(&0, &ChainAction::Down, None);
        let later = env.reward(&3, &ChainAction::Down, None);
        assert!(at_start > later);
        assert!((at_start - 0.8).abs() < 1e-12);
    }

    #[test]
    fn only_the_last_link_pays_the_final_reward() {
        let env = ChainEnv::new(5, 1.0);
        assert_eq!(env.reward(&3, &ChainAction::Right, None), 0.0);
        assert_eq!(env.reward(&4, &ChainAction::Right, None), 1.0);
    }
}
