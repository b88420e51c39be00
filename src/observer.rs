//! An optional, output-only set of callbacks into well-defined points of
//! [`crate::graph::Graph::plan`].
//!
//! Every method has a no-op default body, so an implementor overrides only
//! the events it cares about. All calls are synchronous and carry plain
//! values -- there is no back-pressure and no way for an observer to affect
//! planning.

use crate::ids::{ConnectionId, JoinId};

/// One candidate connection and its estimated cost, as surfaced by
/// [`PlanningObserver::step_costs`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CandidateCost {
    pub connection: ConnectionId,
    pub cost: f64,
}

pub trait PlanningObserver {
    /// A new attempt (the outer loop over `i in [0, K)`) is starting.
    fn attempt_start(&mut self, attempt: usize, starting_connection: ConnectionId) {
        let _ = (attempt, starting_connection);
    }

    /// Candidate connections and their costs, sorted ascending, at one step
    /// of the greedy loop within an attempt.
    fn step_costs(&mut self, attempt: usize, candidates: &[CandidateCost]) {
        let _ = (attempt, candidates);
    }

    /// A connection was successfully pinned, along with the joins that
    /// flipped while traversing and pinning downstream from it.
    fn connection_pinned(
        &mut self,
        attempt: usize,
        connection: ConnectionId,
        flipped_joins: &[JoinId],
    ) {
        let _ = (attempt, connection, flipped_joins);
    }

    /// The attempt finished with every connection pinned, at the given
    /// total cost.
    fn attempt_complete(&mut self, attempt: usize, total_cost: f64) {
        let _ = (attempt, total_cost);
    }

    /// The attempt could not pin every connection (an `UnflippableJoin` with
    /// no remaining candidate to try) and was abandoned.
    fn attempt_failed(&mut self, attempt: usize) {
        let _ = attempt;
    }

    /// A new best plan (lower cost than any previous attempt) was found.
    fn best_plan_found(&mut self, attempt: usize, total_cost: f64) {
        let _ = (attempt, total_cost);
    }
}

/// The default observer: every callback is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl PlanningObserver for NoopObserver {}

/// Turns every callback into a `tracing` event under the `planner` target,
/// at `debug` level for coarse milestones and `trace` for the (potentially
/// large) per-step candidate listing.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl PlanningObserver for TracingObserver {
    fn attempt_start(&mut self, attempt: usize, starting_connection: ConnectionId) {
        tracing::debug!(target: "planner", attempt, %starting_connection, "attempt start");
    }

    fn step_costs(&mut self, attempt: usize, candidates: &[CandidateCost]) {
        tracing::trace!(target: "planner", attempt, ?candidates, "candidate costs");
    }

    fn connection_pinned(
        &mut self,
        attempt: usize,
        connection: ConnectionId,
        flipped_joins: &[JoinId],
    ) {
        tracing::debug!(
            target: "planner",
            attempt,
            %connection,
            ?flipped_joins,
            "connection pinned"
        );
    }

    fn attempt_complete(&mut self, attempt: usize, total_cost: f64) {
        tracing::debug!(target: "planner", attempt, total_cost, "attempt complete");
    }

    fn attempt_failed(&mut self, attempt: usize) {
        tracing::debug!(target: "planner", attempt, "attempt failed");
    }

    fn best_plan_found(&mut self, attempt: usize, total_cost: f64) {
        tracing::debug!(target: "planner", attempt, total_cost, "best plan found");
    }
}
