//! `Connection`: a single logical scan of a source.

use crate::cost::{CostEstimate, CostModel};
use crate::error::PlannerError;
use crate::ids::{ConnectionId, JoinId};
use crate::ids::{NodeRef, PlanId};
use crate::tree::{Filter, OrderBy};
use indexmap::IndexMap;
use itertools::Itertools;
use std::fmt;

/// An ordered sequence of small integers identifying which disjunction
/// branches a fetch belongs to. Empty at the root; gains one entry per
/// `FanIn` crossed on the way down from the terminus.
pub type BranchPattern = Vec<u32>;

/// `{ column -> contributing join }`. The outer key used when a Connection
/// accumulates constraints (see [`Connection::propagate_constraints`]) is
/// the *caller's* join id, used purely to make repeated propagation calls
/// idempotent; the per-column join id stored here is the provenance of that
/// specific column, which can differ from the caller when constraints have
/// been merged across a flip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Constraint(IndexMap<String, Option<JoinId>>);

impl Constraint {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column: impl Into<String>, source: Option<JoinId>) {
        self.0.entry(column.into()).or_insert(source);
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Union with `other`, keeping `self`'s provenance on overlapping
    /// columns (matches the monotonic, never-overwrite accumulation rule
    /// used by propagation).
    pub fn merge(&self, other: &Constraint) -> Constraint {
        let mut merged = self.clone();
        for (column, source) in &other.0 {
            merged.0.entry(column.clone()).or_insert(*source);
        }
        merged
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.columns().join(", "))
    }
}

pub struct Connection {
    id: ConnectionId,
    pub table: String,
    pub ordering: OrderBy,
    pub filter: Filter,
    pub plan_id: Option<PlanId>,
    downstream: NodeRef,
    /// branch-pattern -> (caller join id -> accumulated constraint).
    state: IndexMap<BranchPattern, IndexMap<Option<JoinId>, Constraint>>,
    /// Set by [`crate::graph::Graph`] when a flip elsewhere in the graph
    /// removes the implicit "first match only" short-circuit this
    /// connection used to sit under. Once set, any `limit` the cost model
    /// reports for this connection is discarded.
    unlimited: bool,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        table: impl Into<String>,
        ordering: OrderBy,
        filter: Filter,
        plan_id: Option<PlanId>,
        downstream: NodeRef,
    ) -> Self {
        Self {
            id,
            table: table.into(),
            ordering,
            filter,
            plan_id,
            downstream,
            state: IndexMap::new(),
            unlimited: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn downstream(&self) -> NodeRef {
        self.downstream
    }

    /// Marks this connection as no longer eligible for an implicit
    /// exists-first-match limit. Irreversible within an attempt, same as a
    /// join flip; reversed only by snapshot restore.
    pub(crate) fn unlimit(&mut self) {
        self.unlimited = true;
    }

    pub(crate) fn is_unlimited(&self) -> bool {
        self.unlimited
    }

    /// Used by snapshot restore, which (unlike a flip during normal
    /// operation) must be able to set this back to `false`.
    pub(crate) fn set_unlimited(&mut self, value: bool) {
        self.unlimited = value;
    }

    /// Adds `constraint` under `(branch_pattern, source_join_id)`. Never
    /// overwrites a prior entry with the same key; distinct callers
    /// (distinct `source_join_id`s) simply add new entries that are later
    /// unioned together in [`Connection::estimate_cost`].
    pub fn propagate_constraints(
        &mut self,
        branch_pattern: BranchPattern,
        constraint: Constraint,
        source_join_id: Option<JoinId>,
    ) {
        self.state
            .entry(branch_pattern)
            .or_default()
            .entry(source_join_id)
            .or_insert(constraint);
    }

    /// For each branch-pattern present, unions every constraint accumulated
    /// under it (regardless of source) and invokes the cost model once;
    /// returns the aggregate over branch-patterns.
    ///
    /// `rows` and `running_cost` are additive across branch-patterns (each
    /// one is a distinct scan that must actually run). `selectivity` and
    /// `limit` do not have an additive interpretation; with the single
    /// branch-pattern that's by far the common case they are passed through
    /// unchanged, and with more than one (only possible under a `union`-mode
    /// `FanIn`) `selectivity` is averaged and `limit` is dropped, since no
    /// single number is a faithful combination and nothing exercises a
    /// limit under a union fan-in in practice.
    pub fn estimate_cost(&self, cost_model: &dyn CostModel) -> Result<CostEstimate, PlannerError> {
        if self.state.is_empty() {
            // No propagation reached this connection (e.g. a query with no
            // `where` at all): a baseline full scan under an empty constraint.
            let estimate = cost_model.estimate(&self.ordering, &self.filter, &Constraint::empty())?;
            estimate.validate()?;
            return Ok(self.apply_unlimiting(estimate));
        }

        let mut rows = 0.0;
        let mut running_cost = 0.0;
        let mut selectivity_sum = 0.0;
        let mut single_limit = None;
        let pattern_count = self.state.len();

        for by_source in self.state.values() {
            let mut unioned = Constraint::empty();
            for constraint in by_source.values() {
                unioned = unioned.merge(constraint);
            }
            tracing::trace!(target: "planner", table = %self.table, constraint = %unioned, "estimating connection cost");
            let estimate = cost_model.estimate(&self.ordering, &self.filter, &unioned)?;
            estimate.validate()?;
            rows += estimate.rows;
            running_cost += estimate.running_cost;
            selectivity_sum += estimate.selectivity;
            if pattern_count == 1 {
                single_limit = estimate.limit;
            }
        }

        Ok(self.apply_unlimiting(CostEstimate::new(
            rows,
            running_cost,
            (selectivity_sum / pattern_count as f64).clamp(f64::MIN_POSITIVE, 1.0),
            single_limit,
        )))
    }

    /// Discards any `limit` the cost model reported once a flip elsewhere
    /// has made this connection's scan no longer implicitly first-match-only.
    fn apply_unlimiting(&self, estimate: CostEstimate) -> CostEstimate {
        if self.unlimited {
            CostEstimate::new(estimate.rows, estimate.running_cost, estimate.selectivity, None)
        } else {
            estimate
        }
    }

    /// Returns the accumulated constraint for one `(branch_pattern,
    /// source_join_id)` pair, used by a `Join` to read per-join fan-out
    /// contributions back out for semi-join selectivity.
    pub fn constraints_by_source(
        &self,
        branch_pattern: &[u32],
        source_join_id: Option<JoinId>,
    ) -> Option<&Constraint> {
        self.state.get(branch_pattern)?.get(&source_join_id)
    }

    /// Clears accumulated constraints. Does *not* touch [`Connection::unlimited`]:
    /// that bit persists across repeated propagation within one attempt, the
    /// same way a join's flip state does, and is reset only by restoring a
    /// whole-graph snapshot.
    pub fn reset(&mut self) {
        self.state.clear();
    }

    pub fn capture_constraints(&self) -> IndexMap<BranchPattern, IndexMap<Option<JoinId>, Constraint>> {
        self.state.clone()
    }

    pub fn restore_constraints(
        &mut self,
        snapshot: IndexMap<BranchPattern, IndexMap<Option<JoinId>, Constraint>>,
    ) {
        self.state = snapshot;
    }
}
