// decaying temperature schedules
//
// A schedule f maps scaled visit counts to a factor in (0, 1], with
// f(0) = 1 and f(m) -> 0 as m grows. The decayed temperature is
// init_temp * f(visits_scale * visits), clamped from below by min_temp.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

static SIGMOID_NUMERATOR: Lazy<f64> = Lazy::new(|| 1.0 + (-5.0f64).exp());

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TempDecay {
    /// f(m) = 1/sqrt(1+m)
    InvSqrt,
    /// f(m) = 1/ln(e+m)
    InvLog,
    /// f(m) = (1+exp(-5)) / (1+exp(m-5))
    Sigmoid,
}

impl TempDecay {
    fn factor(self, scaled_visits: f64) -> f64 {
        match self {
            TempDecay::InvSqrt => 1.0 / (1.0 + scaled_visits).sqrt(),
            TempDecay::InvLog => 1.0 / (std::f64::consts::E + scaled_visits).ln(),
            TempDecay::Sigmoid => *SIGMOID_NUMERATOR / (1.0 + (scaled_visits - 5.0).exp()),
        }
    }
}

/// Temperature after `num_visits` visits; `None` means no decay.
pub fn decayed_temp(
    decay: Option<TempDecay>,
    init_temp: f64,
    min_temp: f64,
    num_visits: usize,
    visits_scale: f64,
) -> f64 {
    let temp = match decay {
        None => init_temp,
        Some(decay) => init_temp * decay.factor(visits_scale * num_visits as f64),
    };
    temp.max(min_temp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedules_start_at_one() {
        for decay in [TempDecay::InvSqrt, TempDecay::InvLog, TempDecay::Sigmoid] {
            assert!((decay.factor(0.0) - 1.0).abs() < 1e-12, "{decay:?}");
        }
    }

    #[test]
    fn schedules_decay_towards_zero() {
        for decay in [TempDecay::InvSqrt, TempDecay::InvLog, TempDecay::Sigmoid] {
            assert!(decay.factor(1e6) < 1e-2, "{decay:?}");
            assert!(decay.factor(100.0) < decay.factor(10.0), "{decay:?}");
        }
    }

    #[test]
    fn decayed_temp_respects_minimum() {
        let temp = decayed_temp(Some(TempDecay::InvSqrt), 1.0, 0.25, 1_000_000, 1.0);
        assert_eq!(temp, 0.25);
    }

    #[test]
    fn no_decay_keeps_initial_temperature() {
        assert_eq!(decayed_temp(None, 0.7, 1e-6, 12345, 1.0), 0.7);
    }
}
