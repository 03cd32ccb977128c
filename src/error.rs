//! Error types surfaced by driver construction and data binding.

use thiserror::Error;

/// Errors reported outside of the evaluation hot path.
///
/// Evaluation itself is infallible by contract: node kernels must tolerate the
/// inputs they declared as dependencies, and a device failure during a pass is
/// fatal to the fit.
#[derive(Debug, Error)]
pub enum EvalError {
    /// The requested evaluation mode is not available in this build or on this
    /// machine.
    #[error("unsupported evaluation mode: {0}")]
    UnsupportedMode(String),

    /// The computation graph is not acyclic.
    #[error("computation graph contains a cycle through node '{0}'")]
    GraphCycle(String),

    /// A leaf that must be data-bound was left without a span.
    #[error("observable '{0}' is required but no data column is bound to it")]
    UnboundRequiredObservable(String),

    /// Two batched servers of the same node have incompatible widths.
    #[error("shape mismatch at node '{node}': server widths {left} and {right} do not broadcast")]
    ShapeMismatch {
        node: String,
        left: usize,
        right: usize,
    },
}

pub type Result<T> = std::result::Result<T, EvalError>;
