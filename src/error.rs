use thiserror::Error;

/// Fault raised by the externally-supplied specification evaluator.
///
/// Any evaluation fault (ill-typed operator application, unsatisfiable
/// initial predicate, a partial function applied outside its domain) aborts
/// the search: the same input would fault identically on retry, and skipping
/// the state would silently leave the reachability closure incomplete.
#[derive(Debug, Clone, Error)]
#[error("specification evaluation failed: {message}")]
pub struct EvalError {
    pub message: String,
}

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Fatal fault in the disk-backed storage structures.
///
/// Once the fingerprint set or frontier queue has failed an I/O operation,
/// deduplication soundness can no longer be guaranteed, so the search stops.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("fingerprint store: {0}")]
    Fingerprints(#[source] anyhow::Error),
    #[error("frontier queue: {0}")]
    Frontier(#[source] anyhow::Error),
    #[error("state graph store: {0}")]
    Graph(#[source] anyhow::Error),
}

/// Top-level failure taxonomy of a search run.
///
/// Invariant violations, deadlocks, and liveness violations are *not* errors:
/// they are well-formed search outcomes carried in `SearchResult::Failed`.
/// Fingerprint collisions are a documented residual risk and are not detected.
#[derive(Debug, Error)]
pub enum CheckError {
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("search engine fault: {0}")]
    Engine(String),
}

pub type CheckResult<T> = Result<T, CheckError>;
