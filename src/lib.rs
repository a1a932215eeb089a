pub mod error;
pub mod fingerprint;
pub mod graph;
pub mod liveness;
pub mod runtime;
pub mod spec;
pub mod specs;
pub mod state;
pub mod storage;
pub mod system;
pub mod value;

pub use error::{CheckError, EvalError, StorageError};
pub use fingerprint::Fingerprint;
pub use liveness::{LivenessChecker, TableauAutomaton};
pub use runtime::{
    EngineConfig, ErrorWitness, SearchResult, SearchStats, ViolationKind, run_spec,
};
pub use spec::Spec;
pub use state::VarState;
pub use value::Value;
