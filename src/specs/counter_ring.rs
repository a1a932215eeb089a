use crate::error::EvalError;
use crate::spec::Spec;

/// Modulo-N counter: states {0, 1, ..., n-1}, initial state 0, transition
/// k -> k+1 (mod n). With the default bound the invariant holds everywhere
/// and the reachable set has exactly n states; with a tighter bound the
/// search finds the violation at the end of the single path 0, 1, ....
#[derive(Clone, Debug)]
pub struct CounterRing {
    n: u64,
    bound: u64,
}

impl CounterRing {
    pub fn new(n: u64) -> Self {
        Self { n, bound: n }
    }

    pub fn with_bound(n: u64, bound: u64) -> Self {
        Self { n, bound }
    }
}

impl Spec for CounterRing {
    type State = u64;

    fn name(&self) -> &'static str {
        "counter-ring"
    }

    fn initial_states(&self) -> Result<Vec<u64>, EvalError> {
        if self.n == 0 {
            return Err(EvalError::new("counter ring requires n > 0"));
        }
        Ok(vec![0])
    }

    fn next_states(&self, state: &u64, out: &mut Vec<u64>) -> Result<(), EvalError> {
        out.push((state + 1) % self.n);
        Ok(())
    }

    fn check_invariants(&self, state: &u64) -> Result<(), String> {
        if *state < self.bound {
            Ok(())
        } else {
            Err("CounterBelowBound".to_string())
        }
    }
}
