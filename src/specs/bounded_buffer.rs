use crate::error::EvalError;
use crate::spec::Spec;
use crate::state::VarState;
use crate::value::Value;

/// Single-producer/single-consumer bounded buffer.
///
/// The producer emits `items` sequentially numbered values; the consumer
/// accepts at most `consumer_limit` of them. With `consumer_limit < items`
/// the system wedges once the buffer is full and the consumer has quit,
/// which the engine reports as a deadlock.
#[derive(Clone, Debug)]
pub struct BoundedBuffer {
    capacity: usize,
    items: i64,
    consumer_limit: i64,
}

impl BoundedBuffer {
    pub fn new(capacity: usize, items: i64) -> Self {
        Self {
            capacity,
            items,
            consumer_limit: items,
        }
    }

    pub fn with_consumer_limit(capacity: usize, items: i64, consumer_limit: i64) -> Self {
        Self {
            capacity,
            items,
            consumer_limit,
        }
    }
}

impl Spec for BoundedBuffer {
    type State = VarState;

    fn name(&self) -> &'static str {
        "bounded-buffer"
    }

    fn initial_states(&self) -> Result<Vec<VarState>, EvalError> {
        if self.capacity == 0 {
            return Err(EvalError::new("bounded buffer requires capacity > 0"));
        }
        Ok(vec![VarState::new([
            ("buf", Value::tuple([])),
            ("produced", Value::Int(0)),
            ("consumed", Value::Int(0)),
        ])])
    }

    fn next_states(&self, state: &VarState, out: &mut Vec<VarState>) -> Result<(), EvalError> {
        let buf = state.get("buf")?.as_tuple()?.clone();
        let produced = state.get("produced")?.as_int()?;
        let consumed = state.get("consumed")?.as_int()?;

        if produced < self.items && buf.len() < self.capacity {
            let mut next_buf = buf.clone();
            next_buf.push(Value::Int(produced));
            out.push(
                state
                    .with("buf", Value::tuple(next_buf))
                    .with("produced", Value::Int(produced + 1)),
            );
        }
        if consumed < self.consumer_limit && !buf.is_empty() {
            out.push(
                state
                    .with("buf", Value::tuple(buf[1..].to_vec()))
                    .with("consumed", Value::Int(consumed + 1)),
            );
        }
        Ok(())
    }

    fn check_invariants(&self, state: &VarState) -> Result<(), String> {
        let within = state
            .get("buf")
            .and_then(|buf| buf.as_tuple())
            .map(|buf| buf.len() <= self.capacity)
            .unwrap_or(false);
        if within {
            Ok(())
        } else {
            Err("BufferWithinCapacity".to_string())
        }
    }

    fn is_terminal(&self, state: &VarState) -> bool {
        let Ok(produced) = state.get("produced").and_then(|v| v.as_int()) else {
            return false;
        };
        let Ok(consumed) = state.get("consumed").and_then(|v| v.as_int()) else {
            return false;
        };
        produced == self.items && consumed == self.items
    }
}

#[cfg(test)]
mod tests {
    use super::BoundedBuffer;
    use crate::runtime::{EngineConfig, SearchResult, ViolationKind, run_spec};
    use crate::spec::Spec;
    use crate::state::VarState;
    use crate::value::Value;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_work_dir(prefix: &str) -> std::path::PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!(
            "veristate-buffer-{prefix}-{nanos}-{}",
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
    fn balanced_buffer_drains_and_completes() {
        let work_dir = temp_work_dir("balanced");
        let outcome = run_spec(BoundedBuffer::new(2, 4), config(work_dir.clone()))
            .expect("search should succeed");
        assert!(
            matches!(outcome, SearchResult::Completed { .. }),
            "{outcome:?}"
        );
        let _ = std::fs::remove_dir_all(work_dir);
    }

    #[test]
    fn quitting_consumer_deadlocks() {
        let work_dir = temp_work_dir("wedged");
        let outcome = run_spec(
            BoundedBuffer::with_consumer_limit(2, 4, 1),
            config(work_dir.clone()),
        )
        .expect("search should succeed");
        match outcome {
            SearchResult::Failed { witness, .. } => {
                assert_eq!(witness.kind, ViolationKind::Deadlock);
                // The wedged state has a full buffer and a quit consumer.
                let last = witness.trace.last().unwrap();
                assert_eq!(last.get("buf").unwrap().as_tuple().unwrap().len(), 2);
                assert_eq!(last.get("consumed").unwrap(), &Value::Int(1));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        let _ = std::fs::remove_dir_all(work_dir);
    }

    #[test]
    fn buffer_never_exceeds_capacity() {
        let spec = BoundedBuffer::new(2, 3);
        // Walk the full reachable set by hand and check the invariant.
        let mut frontier = spec.initial_states().unwrap();
        let mut seen: std::collections::HashSet<VarState> =
            frontier.iter().cloned().collect();
        while let Some(state) = frontier.pop() {
            assert!(spec.check_invariants(&state).is_ok());
            let mut successors = Vec::new();
            spec.next_states(&state, &mut successors).unwrap();
            for succ in successors {
                if seen.insert(succ.clone()) {
                    frontier.push(succ);
                }
            }
        }
        assert!(seen.len() > 3);
    }
}
