use crate::error::EvalError;
use crate::liveness::TableauAutomaton;
use crate::spec::Spec;
use crate::state::VarState;
use crate::value::Value;

/// Token-passing ring of `n` processes: the token starts at process 0 and is
/// handed to the right neighbor. The temporal property says the token
/// returns to process 0 infinitely often.
///
/// The lossy variant can drop the token at one designated process, after
/// which it is lost forever (the lost state stutters). That behavior is the
/// accepting lasso the liveness checker must find.
#[derive(Clone, Debug)]
pub struct TokenRing {
    n: i64,
    lossy_at: Option<i64>,
}

impl TokenRing {
    pub fn new(n: i64) -> Self {
        Self { n, lossy_at: None }
    }

    pub fn lossy(n: i64, drop_at: i64) -> Self {
        Self {
            n,
            lossy_at: Some(drop_at),
        }
    }
}

fn token_at_zero(state: &VarState) -> bool {
    matches!(state.get("token"), Ok(Value::Int(0)))
}

impl Spec for TokenRing {
    type State = VarState;

    fn name(&self) -> &'static str {
        "token-ring"
    }

    fn initial_states(&self) -> Result<Vec<VarState>, EvalError> {
        if self.n < 2 {
            return Err(EvalError::new("token ring requires at least 2 processes"));
        }
        Ok(vec![VarState::new([("token", Value::Int(0))])])
    }

    fn next_states(&self, state: &VarState, out: &mut Vec<VarState>) -> Result<(), EvalError> {
        match state.get("token")? {
            Value::Int(holder) => {
                out.push(state.with("token", Value::Int((holder + 1) % self.n)));
                if self.lossy_at == Some(*holder) {
                    out.push(state.with("token", Value::Str("lost".to_string())));
                }
            }
            // A lost token stays lost; the stutter keeps the state from
            // being a deadlock.
            Value::Str(_) => out.push(state.clone()),
            other => {
                return Err(EvalError::new(format!(
                    "token variable has unexpected shape: {other}"
                )));
            }
        }
        Ok(())
    }

    fn check_invariants(&self, state: &VarState) -> Result<(), String> {
        match state.get("token") {
            Ok(Value::Int(holder)) if (0..self.n).contains(holder) => Ok(()),
            Ok(Value::Str(s)) if s == "lost" => Ok(()),
            _ => Err("TokenInRange".to_string()),
        }
    }

    fn temporal_properties(&self) -> Vec<TableauAutomaton<VarState>> {
        vec![TableauAutomaton::infinitely_often(
            "TokenReturnsToZero",
            token_at_zero,
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::TokenRing;
    use crate::runtime::{EngineConfig, SearchResult, ViolationKind, run_spec};
    use crate::spec::Spec;
    use crate::value::Value;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_work_dir(prefix: &str) -> std::path::PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!(
            "veristate-ring-{prefix}-{nanos}-{}",
            std::process::id()
        ))
    }

    fn config(work_dir: std::path::PathBuf) -> EngineConfig {
        EngineConfig {
            workers: 2,
            enforce_cgroups: false,
            work_dir,
            fp_shards: 4,
            fp_expected_items: 100_000,
            fp_cache_capacity_bytes: 8 * 1024 * 1024,
            queue_inmem_limit: 4_096,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn healthy_ring_satisfies_liveness() {
        let work_dir = temp_work_dir("healthy");
        let outcome =
            run_spec(TokenRing::new(5), config(work_dir.clone())).expect("search should succeed");
        match outcome {
            SearchResult::Completed { stats } => {
                assert_eq!(stats.distinct_fingerprints, 5);
            }
            other => panic!("expected Completed, got {other:?}"),
        }
        let _ = std::fs::remove_dir_all(work_dir);
    }

    #[test]
    fn lost_token_violates_liveness_with_a_lasso() {
        let work_dir = temp_work_dir("lossy");
        let outcome = run_spec(TokenRing::lossy(5, 2), config(work_dir.clone()))
            .expect("search should succeed");
        match outcome {
            SearchResult::Failed { witness, .. } => {
                assert_eq!(
                    witness.kind,
                    ViolationKind::Liveness {
                        property: "TokenReturnsToZero".to_string()
                    }
                );
                // The lasso settles into the lost-token stutter state.
                let last = witness.trace.last().expect("non-empty trace");
                assert_eq!(last.get("token").unwrap(), &Value::Str("lost".to_string()));
                // The trace closes its cycle: the final state re-occurs
                // earlier in the suffix.
                let occurrences = witness
                    .trace
                    .iter()
                    .filter(|state| *state == last)
                    .count();
                assert!(occurrences >= 2, "cycle entry should repeat");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        let _ = std::fs::remove_dir_all(work_dir);
    }

    #[test]
    fn out_of_range_token_is_flagged() {
        let ring = TokenRing::new(3);
        let bad = crate::state::VarState::new([("token", Value::Int(7))]);
        assert_eq!(ring.check_invariants(&bad), Err("TokenInRange".to_string()));
    }
}
