use crate::error::EvalError;
use crate::fingerprint::Fingerprint;
use crate::liveness::TableauAutomaton;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::hash::Hash;

/// The already-validated specification, as produced by the external parser
/// and semantic analyzer. The engine consumes it purely through this trait:
/// it never inspects state contents beyond equality and fingerprinting.
pub trait Spec: Send + Sync + 'static {
    type State: Clone + Debug + Eq + Hash + Send + Sync + Serialize + DeserializeOwned + 'static;

    fn name(&self) -> &'static str;

    /// Evaluate the initial-state predicate.
    ///
    /// An `Err` indicates a specification error (ill-typed or unsatisfiable
    /// initial predicate) and aborts the search.
    fn initial_states(&self) -> Result<Vec<Self::State>, EvalError>;

    /// Evaluate the next-state relation, appending every successor to `out`.
    ///
    /// An evaluation fault is fatal to the whole search, never a per-state
    /// skip: skipping would leave the reachability closure silently
    /// incomplete.
    fn next_states(&self, state: &Self::State, out: &mut Vec<Self::State>)
    -> Result<(), EvalError>;

    /// Check every configured invariant; `Err` names the violated invariant.
    /// Pure and total over well-typed states.
    fn check_invariants(&self, state: &Self::State) -> Result<(), String>;

    /// States where the absence of successors is intended termination rather
    /// than a deadlock.
    fn is_terminal(&self, _state: &Self::State) -> bool {
        false
    }

    /// Fingerprint of a state.
    ///
    /// Overridable so specifications can fingerprint a view of the state or
    /// a symmetry-reduced representative instead of the full mapping.
    fn fingerprint(&self, state: &Self::State) -> Fingerprint {
        Fingerprint::of(state)
    }

    /// Temporal properties, pre-compiled into tableau automata by the
    /// external collaborator. Empty when only safety is being checked.
    fn temporal_properties(&self) -> Vec<TableauAutomaton<Self::State>> {
        Vec::new()
    }
}
