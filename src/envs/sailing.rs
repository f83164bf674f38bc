// sailing: reach the far corner of a grid under shifting wind
//
// The only stochastic fixture in the crate. Moves are compass directions;
// sailing straight into the wind is impossible, every other heading costs
// more the closer it points upwind. The wind rotates to a neighbouring
// direction with fixed probabilities after every move, so transition
// distributions have three strictly positive entries.

use crate::env::Environment;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Compass {
    N,
    NE,
    E,
    SE,
    S,
    SW,
    W,
    NW,
}

impl Compass {
    pub const ALL: [Compass; 8] = [
        Compass::N,
        Compass::NE,
        Compass::E,
        Compass::SE,
        Compass::S,
        Compass::SW,
        Compass::W,
        Compass::NW,
    ];

    fn index(self) -> usize {
        Compass::ALL.iter().position(|d| *d == self).unwrap_or(0)
    }

    fn delta(self) -> (isize, isize) {
        match self {
            Compass::N => (0, -1),
            Compass::NE => (1, -1),
            Compass::E => (1, 0),
            Compass::SE => (1, 1),
            Compass::S => (0, 1),
            Compass::SW => (-1, 1),
            Compass::W => (-1, 0),
            Compass::NW => (-1, -1),
        }
    }

    fn rotated(self, steps: isize) -> Compass {
        let index = (self.index() as isize + steps).rem_euclid(8) as usize;
        Compass::ALL[index]
    }

    /// Angular distance in 45-degree steps, 0 (same heading) to 4 (opposite).
    pub fn angle_steps(self, other: Compass) -> usize {
        let diff = (self.index() as isize - other.index() as isize).rem_euclid(8);
        diff.min(8 - diff) as usize
    }
}

const WIND_SHIFT_PROBS: [(isize, f64); 3] = [(-1, 0.3), (0, 0.4), (1, 0.3)];

pub struct SailingEnv {
    width: usize,
    height: usize,
}

impl SailingEnv {
    pub fn new(width: usize, height: usize) -> Self {
        SailingEnv {
            width: width.max(2),
            height: height.max(2),
        }
    }

    fn goal(&self) -> (usize, usize) {
        (self.width - 1, self.height - 1)
    }

    fn in_bounds(&self, x: isize, y: isize) -> bool {
        x >= 0 && y >= 0 && (x as usize) < self.width && (y as usize) < self.height
    }

    fn next_position(&self, state: &(usize, usize, Compass), action: &Compass) -> (usize, usize) {
        let (dx, dy) = action.delta();
        ((state.0 as isize + dx) as usize, (state.1 as isize + dy) as usize)
    }
}

impl Environment for SailingEnv {
    /// `(x, y, wind)`: boat position plus the direction the wind blows
    /// towards.
    type State = (usize, usize, Compass);
    type Action = Compass;
    type Observation = (usize, usize, Compass);
    type Context = ();

    fn initial_state(&self) -> Self::State {
        (0, 0, Compass::SE)
    }

    fn is_sink_state(&self, state: &Self::State) -> bool {
        (state.0, state.1) == self.goal()
    }

    fn valid_actions(&self, state: &Self::State) -> Vec<Compass> {
        if self.is_sink_state(state) {
            return Vec::new();
        }
        Compass::ALL
            .iter()
            .filter(|direction| {
                let (dx, dy) = direction.delta();
                self.in_bounds(state.0 as isize + dx, state.1 as isize + dy)
                    && direction.angle_steps(state.2) < 4
            })
            .copied()
            .collect()
    }

    fn transition_distribution(
        &self,
        state: &Self::State,
        action: &Compass,
    ) -> Vec<(Self::State, f64)> {
        let (x, y) = self.next_position(state, action);
        WIND_SHIFT_PROBS
            .iter()
            .map(|(steps, prob)| ((x, y, state.2.rotated(*steps)), *prob))
            .collect()
    }

    fn reward(&self, state: &Self::State, action: &Compass, _observation: Option<&Self::State>) -> f64 {
        // one unit for the move plus the tack penalty against the wind
        -(1.0 + action.angle_steps(state.2) as f64)
    }
}
