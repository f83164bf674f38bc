// per-trial context record
//
// One of these travels with every trial through selection and backup. The
// engine only needs the thread id; the environment and the algorithm each
// get a strongly typed slot for their own scratch data (e.g. the parent
// selection distribution for relative-entropy search).

use crate::algorithms::Algorithm;
use crate::env::Environment;

pub struct TrialContext<E: Environment, A: Algorithm<E>> {
    pub thread_id: usize,
    pub env: E::Context,
    pub algo: A::Context,
}

impl<E: Environment, A: Algorithm<E>> TrialContext<E, A> {
    pub fn new(thread_id: usize, env: E::Context) -> Self {
        TrialContext {
            thread_id,
            env,
            algo: A::Context::default(),
        }
    }
}

impl<E: Environment, A: Algorithm<E>> Default for TrialContext<E, A> {
    fn default() -> Self {
        TrialContext {
            thread_id: 0,
            env: E::Context::default(),
            algo: A::Context::default(),
        }
    }
}
