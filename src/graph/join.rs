//! `Join`: the lowered form of a single `correlatedSubquery`, holding the
//! correlation columns and the flip/semi state the planner searches over.

use crate::cost::CostEstimate;
use crate::graph::connection::Constraint;
use crate::ids::{JoinId, NodeRef};
use crate::tree::{Correlation, SubqueryOp};

/// Which side of a correlated subquery currently drives the scan.
///
/// `Semi` is the natural reading of `EXISTS`/`NOT EXISTS`: the outer
/// (`parent`) row stream is scanned and, for each row, existence against
/// `child` is probed. `Flipped` reverses that -- `child` is scanned and
/// `parent` is probed -- which is only sound when the predicate is
/// `EXISTS` (flipping a `NOT EXISTS` changes which rows survive, since
/// "no child row matches" is not equivalent to "no parent row matches").
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum JoinState {
    Semi,
    Flipped,
}

pub struct Join {
    id: JoinId,
    op: SubqueryOp,
    parent: NodeRef,
    child: NodeRef,
    downstream: NodeRef,
    state: JoinState,
    /// Correlation columns tagged with this join's id, sent to `child` in
    /// `Semi` mode.
    child_constraint: Constraint,
    /// Correlation columns tagged with this join's id, merged into whatever
    /// arrives from downstream and sent to `parent` in `Flipped` mode.
    parent_constraint: Constraint,
}

impl Join {
    pub(crate) fn new(
        id: JoinId,
        op: SubqueryOp,
        correlation: &Correlation,
        parent: NodeRef,
        child: NodeRef,
        downstream: NodeRef,
    ) -> Self {
        let mut child_constraint = Constraint::empty();
        let mut parent_constraint = Constraint::empty();
        for (parent_field, child_field) in correlation.pairs() {
            parent_constraint.insert(parent_field.to_owned(), Some(id));
            child_constraint.insert(child_field.to_owned(), Some(id));
        }
        Self {
            id,
            op,
            parent,
            child,
            downstream,
            state: JoinState::Semi,
            child_constraint,
            parent_constraint,
        }
    }

    pub fn id(&self) -> JoinId {
        self.id
    }

    pub fn state(&self) -> JoinState {
        self.state
    }

    pub fn parent(&self) -> NodeRef {
        self.parent
    }

    pub fn child(&self) -> NodeRef {
        self.child
    }

    pub fn downstream(&self) -> NodeRef {
        self.downstream
    }

    /// Patches `parent` after construction. The builder assembles a graph
    /// top-down (terminus first, sources last), so a join's own id must
    /// exist before its `parent`/`child` subtrees can be built with this
    /// join as their `downstream`; this closes that forward reference.
    pub(crate) fn set_parent(&mut self, parent: NodeRef) {
        self.parent = parent;
    }

    pub(crate) fn set_child(&mut self, child: NodeRef) {
        self.child = child;
    }

    /// Only an `EXISTS` join can be flipped; a `NOT EXISTS` join is
    /// semantically an anti-join and swapping its driving side would change
    /// the result.
    pub fn flippable(&self) -> bool {
        matches!(self.op, SubqueryOp::Exists)
    }

    /// Toggles the drive direction. Callers are expected to have already
    /// checked [`Join::flippable`]; this only flips state and never
    /// inspects `op` itself, so the search loop's `UnflippableJoin` error is
    /// raised by the caller, not here.
    pub fn flip(&mut self) {
        let from = self.state;
        self.state = match self.state {
            JoinState::Semi => JoinState::Flipped,
            JoinState::Flipped => JoinState::Semi,
        };
        tracing::trace!(target: "planner", join_id = %self.id, %from, to = %self.state, "flipped join");
    }

    pub fn set_state(&mut self, state: JoinState) {
        self.state = state;
    }

    /// The constraint to send to `child`, or `None` when `child` receives
    /// nothing in the current state (`Flipped` mode: `child` is the driving
    /// side and gets no pushed-down constraint).
    pub fn constraint_for_child(&self) -> Option<&Constraint> {
        match self.state {
            JoinState::Semi => Some(&self.child_constraint),
            JoinState::Flipped => None,
        }
    }

    /// The constraint to send to `parent`: in `Semi` mode this is whatever
    /// arrived from downstream, forwarded unchanged (`parent` drives, so it
    /// only sees constraints from further downstream, not from this join);
    /// in `Flipped` mode this join contributes its own correlation columns
    /// on top of whatever arrived.
    pub fn constraint_for_parent(&self, incoming: &Constraint) -> Constraint {
        match self.state {
            JoinState::Semi => incoming.clone(),
            JoinState::Flipped => incoming.merge(&self.parent_constraint),
        }
    }

    /// Combines the recursively-estimated costs of `parent` and `child`
    /// into this join's own contribution.
    ///
    /// `outputRows` and `selectivity` are direction-independent: the result
    /// set of a semi-join does not change when its physical direction
    /// changes. `runningCost` is where direction matters:
    ///
    /// - `Semi` (parent-driven): the parent is scanned (down to `scanEst`
    ///   rows, shrunk from `parentCost.rows` when a `limit` lets the scan
    ///   stop early), and every parent row pays a child lookup. A matching
    ///   child row typically short-circuits that lookup, so the
    ///   `(1 - childCost.selectivity)` factor is the fraction of probes
    ///   that must scan all of `childCost.rows` without an early exit.
    /// - `Flipped` (child-driven): the child is scanned in full and every
    ///   child row pays the full cost of a parent lookup (no early exit is
    ///   available once the driver is already the more selective side).
    pub fn combine_cost(&self, parent_cost: &CostEstimate, child_cost: &CostEstimate) -> CostEstimate {
        let output_rows = parent_cost.rows * child_cost.selectivity;
        let selectivity = (child_cost.selectivity * parent_cost.selectivity).clamp(f64::MIN_POSITIVE, 1.0);

        let running_cost = match self.state {
            JoinState::Semi => {
                let scan_est = match parent_cost.limit {
                    Some(limit) => parent_cost.rows.min(limit / selectivity),
                    None => parent_cost.rows,
                };
                parent_cost.running_cost
                    + scan_est * (child_cost.running_cost + child_cost.rows * (1.0 - child_cost.selectivity))
            }
            JoinState::Flipped => {
                child_cost.running_cost + child_cost.rows * (parent_cost.running_cost + parent_cost.rows)
            }
        };

        CostEstimate::new(output_rows, running_cost, selectivity, parent_cost.limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ConnectionId;
    use crate::tree::Correlation;

    fn join(op: SubqueryOp) -> Join {
        Join::new(
            JoinId(0),
            op,
            &Correlation::new(vec![("a".into(), "b".into())]),
            NodeRef::Connection(ConnectionId(0)),
            NodeRef::Connection(ConnectionId(1)),
            NodeRef::Terminus,
        )
    }

    #[test]
    fn not_exists_is_not_flippable() {
        assert!(!join(SubqueryOp::NotExists).flippable());
        assert!(join(SubqueryOp::Exists).flippable());
    }

    #[test]
    fn flip_toggles_state() {
        let mut j = join(SubqueryOp::Exists);
        assert_eq!(j.state(), JoinState::Semi);
        j.flip();
        assert_eq!(j.state(), JoinState::Flipped);
        j.flip();
        assert_eq!(j.state(), JoinState::Semi);
    }

    #[test]
    fn semi_mode_sends_nothing_extra_to_parent() {
        let j = join(SubqueryOp::Exists);
        let incoming = Constraint::empty();
        let forwarded = j.constraint_for_parent(&incoming);
        assert!(forwarded.columns().count() == 0);
        assert!(j.constraint_for_child().is_some());
    }

    #[test]
    fn flipped_mode_sends_nothing_to_child() {
        let mut j = join(SubqueryOp::Exists);
        j.flip();
        assert!(j.constraint_for_child().is_none());
        let forwarded = j.constraint_for_parent(&Constraint::empty());
        assert_eq!(forwarded.columns().count(), 1);
    }

    #[test]
    fn flip_wins_when_the_correlation_key_is_highly_selective() {
        // Mirrors a `users WHERE EXISTS posts` shape: 10000 users, 100 posts,
        // no filter, but the correlation key is effectively unique on
        // whichever side receives it as a pushed-down constraint.
        let parent_unconstrained = CostEstimate::new(10_000.0, 10_000.0, 1.0, None);
        let child_unconstrained = CostEstimate::new(100.0, 100.0, 1.0, None);
        let child_constrained = CostEstimate::new(1.0, 1.0, 0.0001, None);
        let parent_constrained = CostEstimate::new(1.0, 1.0, 0.0001, None);

        let semi = join(SubqueryOp::Exists).combine_cost(&parent_unconstrained, &child_constrained);
        let mut flipped_join = join(SubqueryOp::Exists);
        flipped_join.flip();
        let flipped = flipped_join.combine_cost(&parent_constrained, &child_unconstrained);

        assert!(flipped.running_cost < semi.running_cost);
    }
}
