//! The planner's error taxonomy.
//!
//! Most of the control flow in this crate that looks like an "error" is not
//! one: an [`UnflippableJoin`](PlannerError::UnflippableJoin) is the expected
//! outcome of trying a candidate pin that doesn't pan out, and is always
//! caught and handled inside [`crate::graph::Graph::plan`]. Likewise,
//! exhausting every attempt without finding a full plan is not a
//! `PlannerError` at all -- it is the `Ok(None)` returned by
//! [`crate::plan_query`]. `PlannerError` is reserved for the genuinely fatal
//! cases: malformed input and a misbehaving cost model.

use crate::ids::JoinId;

/// Create an internal error.
///
/// # Example
/// ```rust
/// use subquery_planner::internal_error;
/// use subquery_planner::error::PlannerError;
/// # fn may_be_none() -> Option<()> { None }
///
/// const NAME: &str = "the thing";
/// let result: Result<(), PlannerError> = may_be_none()
///     .ok_or_else(|| internal_error!("Expected {NAME} to be Some"));
/// ```
#[macro_export]
macro_rules! internal_error {
    ( $( $arg:tt )+ ) => {
        $crate::error::PlannerError::internal(format!( $( $arg )+ ))
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PlannerError {
    /// Traversal demanded flipping a join whose `flippable` flag is `false`
    /// (i.e. a `NOT EXISTS`). Always recovered locally by the attempt loop in
    /// [`crate::graph::Graph::plan`]; this variant should never reach a
    /// caller of [`crate::plan_query`].
    #[error("join {join_id:?} cannot be flipped (NOT EXISTS)")]
    UnflippableJoin { join_id: JoinId },

    /// A `correlatedSubquery` appeared in `related` without an `alias`, a
    /// join referenced a table with no matching `Source`, or an `orderBy`
    /// referenced a column absent from the table it scans.
    #[error("malformed query tree: {detail}")]
    MalformedInput { detail: String },

    /// The cost model returned a value outside its contract (non-finite or
    /// negative `rows`/`running_cost`, or `selectivity` outside `(0, 1]`).
    #[error("cost model returned an invalid estimate: {detail}")]
    CostModelFault { detail: String },

    /// A programming-error-only variant: an internal invariant of the graph
    /// (snapshot shape, arena bounds, ...) did not hold. Never expected to be
    /// matched on by callers.
    #[error("internal planner error: {message}")]
    Internal { message: String },
}

impl PlannerError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::MalformedInput {
            detail: detail.into(),
        }
    }

    pub fn cost_model_fault(detail: impl Into<String>) -> Self {
        Self::CostModelFault {
            detail: detail.into(),
        }
    }
}
