//! The pluggable cost model seam.

use crate::error::PlannerError;
use crate::graph::connection::Constraint;
use crate::tree::{Filter, OrderBy};

/// The result of a single cost-model call, or of aggregating several of
/// them (a `Connection` summed over branch-patterns, a `Join`'s own
/// contribution, a `FanIn` merging its branches).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostEstimate {
    pub rows: f64,
    pub running_cost: f64,
    pub selectivity: f64,
    pub limit: Option<f64>,
}

impl CostEstimate {
    pub const fn new(rows: f64, running_cost: f64, selectivity: f64, limit: Option<f64>) -> Self {
        Self {
            rows,
            running_cost,
            selectivity,
            limit,
        }
    }

    pub const fn zero() -> Self {
        Self::new(0.0, 0.0, 1.0, None)
    }

    /// Enforces the cost-model contract: finite, non-negative
    /// `rows`/`running_cost`, and `selectivity` in `(0, 1]`. Never coerces a
    /// bad value -- a violation is always a fatal `CostModelFault`.
    pub fn validate(&self) -> Result<(), PlannerError> {
        if !self.rows.is_finite() || self.rows < 0.0 {
            return Err(PlannerError::cost_model_fault(format!(
                "rows must be finite and >= 0, got {}",
                self.rows
            )));
        }
        if !self.running_cost.is_finite() || self.running_cost < 0.0 {
            return Err(PlannerError::cost_model_fault(format!(
                "running_cost must be finite and >= 0, got {}",
                self.running_cost
            )));
        }
        if !(self.selectivity > 0.0 && self.selectivity <= 1.0) {
            return Err(PlannerError::cost_model_fault(format!(
                "selectivity must be in (0, 1], got {}",
                self.selectivity
            )));
        }
        if let Some(limit) = self.limit {
            if !limit.is_finite() || limit < 0.0 {
                return Err(PlannerError::cost_model_fault(format!(
                    "limit must be finite and >= 0, got {limit}"
                )));
            }
        }
        Ok(())
    }
}

/// An external collaborator returning a cost estimate for a connection
/// given its ordering, filter, and current constraint set.
///
/// This is a trait object (`dyn CostModel`), not a generic parameter,
/// because a single `Graph` spans every `Source` in a query and those
/// sources may have unrelated cost models (different tables, different
/// backing statistics); a generic `Graph<M: CostModel>` would force one
/// cost-model type for the whole query.
pub trait CostModel: Send + Sync {
    fn estimate(
        &self,
        ordering: &OrderBy,
        filter: &Filter,
        constraint: &Constraint,
    ) -> Result<CostEstimate, PlannerError>;
}

impl<F> CostModel for F
where
    F: Fn(&OrderBy, &Filter, &Constraint) -> Result<CostEstimate, PlannerError> + Send + Sync,
{
    fn estimate(
        &self,
        ordering: &OrderBy,
        filter: &Filter,
        constraint: &Constraint,
    ) -> Result<CostEstimate, PlannerError> {
        self(ordering, filter, constraint)
    }
}
