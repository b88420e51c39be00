//! The planning graph: a small, fixed-shape DAG of five node kinds
//! (`Source` is a collaborator referenced by table name rather than a node
//! in the DAG proper; `Connection`, `Join`, `FanOut`, `FanIn`, `Terminus`
//! are the DAG itself), stored as typed arenas rather than behind
//! `Box<dyn Node>` since the node family is closed and small. Holds the
//! multi-start greedy search that decides each join's direction and each
//! connection's place in the scan order.

pub mod connection;
pub mod fan;
pub mod join;
pub mod source;
pub mod terminus;

use crate::cost::CostEstimate;
use crate::error::PlannerError;
use crate::ids::{ConnectionId, FanInId, FanOutId, JoinId, NodeRef};
use crate::internal_error;
use crate::observer::{CandidateCost, PlanningObserver};
use connection::{BranchPattern, Connection, Constraint};
use fan::{FanIn, FanMode, FanOut};
use indexmap::{IndexMap, IndexSet};
use join::{Join, JoinState};
use source::Source;
use std::num::NonZeroU32;
use terminus::Terminus;

/// Caps how many of a graph's connections are tried as the seed of a
/// fresh attempt. Beyond this, additional attempts rarely find a cheaper
/// plan and only cost search time.
const MAX_SEED_ATTEMPTS: usize = 6;

pub struct Graph {
    sources: IndexMap<String, Source>,
    connections: Vec<Connection>,
    joins: Vec<Join>,
    fan_outs: Vec<FanOut>,
    fan_ins: Vec<FanIn>,
    terminus: Terminus,
}

/// The outcome of a successful [`Graph::plan`] call: the total cost of the
/// cheapest fully-pinned attempt, and the set of joins that ended up
/// flipped to reach it.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub total_cost: f64,
    pub flipped_joins: IndexSet<JoinId>,
}

struct Snapshot {
    connection_states: Vec<IndexMap<BranchPattern, IndexMap<Option<JoinId>, Constraint>>>,
    connection_unlimited: Vec<bool>,
    join_states: Vec<JoinState>,
    fan_in_modes: Vec<FanMode>,
}

impl Graph {
    pub fn new() -> Self {
        Self {
            sources: IndexMap::new(),
            connections: Vec::new(),
            joins: Vec::new(),
            fan_outs: Vec::new(),
            fan_ins: Vec::new(),
            terminus: Terminus::default(),
        }
    }

    // -- construction, used by `crate::builder` ---------------------------

    pub(crate) fn add_source(&mut self, source: Source) {
        self.sources.entry(source.table.clone()).or_insert(source);
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn add_connection(
        &mut self,
        table: impl Into<String>,
        ordering: crate::tree::OrderBy,
        filter: crate::tree::Filter,
        plan_id: Option<crate::ids::PlanId>,
        downstream: NodeRef,
    ) -> ConnectionId {
        let id = ConnectionId(self.connections.len());
        self.connections
            .push(Connection::new(id, table, ordering, filter, plan_id, downstream));
        id
    }

    /// Reserves a join slot with placeholder `parent`/`child` links,
    /// returning its id so the builder can construct those subtrees with
    /// this join as their `downstream` before patching them in via
    /// [`Graph::patch_join_links`].
    pub(crate) fn reserve_join(
        &mut self,
        op: crate::tree::SubqueryOp,
        correlation: &crate::tree::Correlation,
        downstream: NodeRef,
    ) -> JoinId {
        let id = JoinId(self.joins.len());
        self.joins
            .push(Join::new(id, op, correlation, NodeRef::Terminus, NodeRef::Terminus, downstream));
        id
    }

    pub(crate) fn patch_join_links(&mut self, id: JoinId, parent: NodeRef, child: NodeRef) {
        let join = &mut self.joins[id.index()];
        join.set_parent(parent);
        join.set_child(child);
    }

    pub(crate) fn reserve_fan_out(&mut self, downstream: NodeRef) -> FanOutId {
        let id = FanOutId(self.fan_outs.len());
        self.fan_outs.push(FanOut::new(id, NodeRef::Terminus, downstream));
        id
    }

    pub(crate) fn patch_fan_out_input(&mut self, id: FanOutId, input: NodeRef) {
        self.fan_outs[id.index()].set_input(input);
    }

    pub(crate) fn reserve_fan_in(&mut self, downstream: NodeRef) -> FanInId {
        let id = FanInId(self.fan_ins.len());
        self.fan_ins.push(FanIn::new(id, Vec::new(), downstream));
        id
    }

    pub(crate) fn patch_fan_in_inputs(&mut self, id: FanInId, inputs: Vec<NodeRef>) {
        self.fan_ins[id.index()].set_inputs(inputs);
    }

    pub(crate) fn switch_fan_in_to_union(&mut self, id: FanInId) {
        self.fan_ins[id.index()].switch_to_union();
    }

    pub(crate) fn finish(&mut self, root: NodeRef) {
        self.terminus.input = Some(root);
    }

    pub fn connection_ids(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        (0..self.connections.len()).map(ConnectionId)
    }

    pub fn join(&self, id: JoinId) -> &Join {
        &self.joins[id.index()]
    }

    pub fn connection(&self, id: ConnectionId) -> &Connection {
        &self.connections[id.index()]
    }

    // -- constraint propagation --------------------------------------------

    fn reset_constraints(&mut self) {
        for c in &mut self.connections {
            c.reset();
        }
    }

    /// Re-derives every connection's accumulated constraint set from
    /// scratch, starting at the terminus and walking down to every reached
    /// connection. Called after any join flips state, since a flip changes
    /// which side receives which constraint.
    fn propagate(&mut self) -> Result<(), PlannerError> {
        self.reset_constraints();
        let root = self
            .terminus
            .input
            .ok_or_else(|| internal_error!("Graph::propagate called before Graph::finish"))?;
        self.propagate_into(root, Vec::new(), Constraint::empty(), None)
    }

    fn propagate_into(
        &mut self,
        node: NodeRef,
        branch_pattern: BranchPattern,
        constraint: Constraint,
        source_join_id: Option<JoinId>,
    ) -> Result<(), PlannerError> {
        match node {
            NodeRef::Connection(id) => {
                self.connections[id.index()].propagate_constraints(branch_pattern, constraint, source_join_id);
                Ok(())
            }
            NodeRef::Join(id) => {
                let join = &self.joins[id.index()];
                let child_constraint = join.constraint_for_child().cloned();
                let parent_constraint = join.constraint_for_parent(&constraint);
                let parent_source = match join.state() {
                    JoinState::Semi => source_join_id,
                    JoinState::Flipped => Some(id),
                };
                let (parent, child) = (join.parent(), join.child());

                if let Some(child_constraint) = child_constraint {
                    self.propagate_into(child, branch_pattern.clone(), child_constraint, Some(id))?;
                }
                self.propagate_into(parent, branch_pattern, parent_constraint, parent_source)
            }
            NodeRef::FanOut(id) => {
                let input = self.fan_outs[id.index()].input();
                self.propagate_into(input, branch_pattern, constraint, source_join_id)
            }
            NodeRef::FanIn(id) => {
                let inputs = self.fan_ins[id.index()].inputs().to_vec();
                for (index, input) in inputs.into_iter().enumerate() {
                    let mut child_pattern = branch_pattern.clone();
                    child_pattern.push(self.fan_ins[id.index()].branch_suffix(index));
                    self.propagate_into(input, child_pattern, constraint.clone(), source_join_id)?;
                }
                Ok(())
            }
            NodeRef::Terminus => Err(internal_error!("Terminus cannot be a propagation target")),
        }
    }

    // -- cost aggregation ---------------------------------------------------

    pub fn total_cost(&self) -> Result<f64, PlannerError> {
        let root = self
            .terminus
            .input
            .ok_or_else(|| internal_error!("Graph::total_cost called before Graph::finish"))?;
        Ok(self.estimate_cost(root)?.running_cost)
    }

    fn estimate_cost(&self, node: NodeRef) -> Result<CostEstimate, PlannerError> {
        match node {
            NodeRef::Connection(id) => {
                let connection = &self.connections[id.index()];
                let source = self.sources.get(&connection.table).ok_or_else(|| {
                    PlannerError::malformed(format!("no source registered for table {:?}", connection.table))
                })?;
                connection.estimate_cost(source.cost_model.as_ref())
            }
            NodeRef::Join(id) => {
                let join = &self.joins[id.index()];
                let parent_cost = self.estimate_cost(join.parent())?;
                let child_cost = self.estimate_cost(join.child())?;
                Ok(join.combine_cost(&parent_cost, &child_cost))
            }
            NodeRef::FanOut(id) => self.estimate_cost(self.fan_outs[id.index()].input()),
            NodeRef::FanIn(id) => {
                let inputs = self.fan_ins[id.index()].inputs().to_vec();
                let mut branch_costs = Vec::with_capacity(inputs.len());
                for input in inputs {
                    branch_costs.push(self.estimate_cost(input)?);
                }
                Ok(FanIn::combine_cost(&branch_costs))
            }
            NodeRef::Terminus => Err(internal_error!("Terminus has no cost of its own")),
        }
    }

    // -- snapshot / restore ---------------------------------------------------

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            connection_states: self.connections.iter().map(Connection::capture_constraints).collect(),
            connection_unlimited: self.connections.iter().map(Connection::is_unlimited).collect(),
            join_states: self.joins.iter().map(Join::state).collect(),
            fan_in_modes: self.fan_ins.iter().map(FanIn::mode).collect(),
        }
    }

    fn restore(&mut self, snapshot: Snapshot) {
        for (connection, state) in self.connections.iter_mut().zip(snapshot.connection_states) {
            connection.restore_constraints(state);
        }
        for (connection, unlimited) in self.connections.iter_mut().zip(snapshot.connection_unlimited) {
            connection.set_unlimited(unlimited);
        }
        for (join, state) in self.joins.iter_mut().zip(snapshot.join_states) {
            join.set_state(state);
        }
        for (fan_in, mode) in self.fan_ins.iter_mut().zip(snapshot.fan_in_modes) {
            if mode == FanMode::Union {
                fan_in.switch_to_union();
            }
        }
    }

    /// Walks the ancestor chain from `connection` up to the terminus,
    /// flipping every join whose `child` side leads to `connection` but
    /// which is not currently `Flipped`, and switching to `Union` any
    /// fan-in whose branches have just become distinguishable because of
    /// that flip. Returns the set of joins flipped, or
    /// `Err(PlannerError::UnflippableJoin)` the first time a `NOT EXISTS`
    /// join would need flipping.
    fn traverse_and_pin(&mut self, connection: ConnectionId) -> Result<Vec<JoinId>, PlannerError> {
        let mut flipped = Vec::new();
        let mut current = NodeRef::Connection(connection);

        loop {
            let Some(parent_ref) = self.find_parent(current) else {
                break;
            };
            match parent_ref {
                NodeRef::Join(join_id) => {
                    let join = &self.joins[join_id.index()];
                    let reached_via_child = join.child() == current;
                    let child = join.child();
                    if reached_via_child && join.state() != JoinState::Flipped {
                        if !join.flippable() {
                            return Err(PlannerError::UnflippableJoin { join_id });
                        }
                        self.joins[join_id.index()].flip();
                        self.unlimit_subgraph(child);
                        flipped.push(join_id);
                    }
                }
                NodeRef::FanIn(fan_in_id) => {
                    if !flipped.is_empty() {
                        self.switch_fan_in_to_union(fan_in_id);
                    }
                }
                _ => {}
            }
            current = parent_ref;
        }

        Ok(flipped)
    }

    /// Walks the subgraph rooted at `start` (a join's `child` immediately
    /// after that join flipped) and clears the implicit exists-first-match
    /// limit every connection it reaches. Stops at a join already in
    /// `Flipped` state -- that join's own subtree was unlimited when it
    /// flipped and nothing changes for it now -- and otherwise continues
    /// through a `Semi` join's `parent` side, the side still reached under a
    /// first-match short-circuit of its own.
    fn unlimit_subgraph(&mut self, start: NodeRef) {
        match start {
            NodeRef::Connection(id) => self.connections[id.index()].unlimit(),
            NodeRef::Join(id) => {
                if self.joins[id.index()].state() == JoinState::Semi {
                    self.unlimit_subgraph(self.joins[id.index()].parent());
                }
            }
            NodeRef::FanOut(id) => self.unlimit_subgraph(self.fan_outs[id.index()].input()),
            NodeRef::FanIn(id) => {
                for input in self.fan_ins[id.index()].inputs().to_vec() {
                    self.unlimit_subgraph(input);
                }
            }
            NodeRef::Terminus => {}
        }
    }

    /// Finds the node whose `parent`/`child`/`input`/`inputs` points at
    /// `node`, i.e. the structural opposite of `downstream`. Linear in the
    /// graph's size; graphs here are small (one node per subquery/table),
    /// so this is not a bottleneck worth indexing.
    fn find_parent(&self, node: NodeRef) -> Option<NodeRef> {
        for (index, join) in self.joins.iter().enumerate() {
            if join.parent() == node || join.child() == node {
                return Some(NodeRef::Join(JoinId(index)));
            }
        }
        for (index, fan_out) in self.fan_outs.iter().enumerate() {
            if fan_out.input() == node {
                return Some(NodeRef::FanOut(FanOutId(index)));
            }
        }
        for (index, fan_in) in self.fan_ins.iter().enumerate() {
            if fan_in.inputs().contains(&node) {
                return Some(NodeRef::FanIn(FanInId(index)));
            }
        }
        None
    }

    /// Runs the multi-start greedy search: up to `min(connections, 6)`
    /// attempts, each seeded at a different connection, each repeatedly
    /// picking the cheapest remaining connection to pin next until every
    /// connection is pinned or no candidate can be reached without an
    /// unflippable join. Returns the cheapest attempt's outcome, or `None`
    /// if every attempt failed.
    pub fn plan(
        &mut self,
        max_attempts: NonZeroU32,
        observer: &mut dyn PlanningObserver,
    ) -> Result<Option<PlanOutcome>, PlannerError> {
        let connection_count = self.connections.len();
        if connection_count == 0 {
            return Ok(Some(PlanOutcome {
                total_cost: 0.0,
                flipped_joins: IndexSet::new(),
            }));
        }

        let attempts = connection_count.min(MAX_SEED_ATTEMPTS).min(max_attempts.get() as usize).max(1);
        let clean_slate = self.snapshot();
        let mut best: Option<(Snapshot, PlanOutcome)> = None;

        for attempt in 0..attempts {
            self.restore(Snapshot {
                connection_states: clean_slate.connection_states.clone(),
                connection_unlimited: clean_slate.connection_unlimited.clone(),
                join_states: clean_slate.join_states.clone(),
                fan_in_modes: clean_slate.fan_in_modes.clone(),
            });

            // Prime every connection's baseline cost against the untouched
            // graph, then seed this attempt with the `attempt`-th cheapest
            // connection overall: attempt 0 starts from the single cheapest
            // scan, attempt 1 from the next-cheapest, and so on. Every
            // attempt starts from the same clean slate, so this ranking is
            // identical across attempts and only needs computing once per
            // attempt's reset, not threaded through the search.
            self.propagate()?;
            let seed_candidates = self.rank_unpinned(&IndexSet::new())?;
            let Some(seed) = seed_candidates.get(attempt).map(|c| c.connection) else {
                break;
            };
            observer.attempt_start(attempt, seed);

            match self.run_attempt(attempt, seed, observer)? {
                Some(outcome) => {
                    observer.attempt_complete(attempt, outcome.total_cost);
                    let is_new_best = match &best {
                        Some((_, b)) => outcome.total_cost < b.total_cost,
                        None => true,
                    };
                    if is_new_best {
                        observer.best_plan_found(attempt, outcome.total_cost);
                        best = Some((self.snapshot(), outcome));
                    }
                }
                None => observer.attempt_failed(attempt),
            }
        }

        match best {
            Some((snapshot, outcome)) => {
                self.restore(snapshot);
                Ok(Some(outcome))
            }
            None => {
                self.restore(clean_slate);
                Ok(None)
            }
        }
    }

    /// Pins `seed` as the attempt's initial root (§4.f step 4), then runs
    /// the greedy loop (step 6) until every connection is pinned or no
    /// remaining candidate can be reached without an illegal flip.
    ///
    /// The initial root gets no fallback: an `UnflippableJoin` there aborts
    /// the whole attempt, per spec. The greedy loop, by contrast, tries
    /// every remaining candidate in increasing-cost order, restoring a
    /// per-candidate snapshot on each failure -- `traverse_and_pin` mutates
    /// join/connection state as it walks, so a candidate that fails partway
    /// through a flip chain must not leave those flips behind for the next
    /// candidate to inherit.
    fn run_attempt(
        &mut self,
        attempt: usize,
        seed: ConnectionId,
        observer: &mut dyn PlanningObserver,
    ) -> Result<Option<PlanOutcome>, PlannerError> {
        let mut pinned: IndexSet<ConnectionId> = IndexSet::new();
        let mut flipped_joins: IndexSet<JoinId> = IndexSet::new();

        let before_seed = self.snapshot();
        match self.try_pin(seed) {
            Ok(newly_flipped) => {
                pinned.insert(seed);
                flipped_joins.extend(newly_flipped.iter().copied());
                observer.connection_pinned(attempt, seed, &newly_flipped);
            }
            Err(PlannerError::UnflippableJoin { .. }) => {
                self.restore(before_seed);
                return Ok(None);
            }
            Err(other) => return Err(other),
        }
        self.propagate()?;

        while pinned.len() < self.connections.len() {
            let candidates = self.rank_unpinned(&pinned)?;
            observer.step_costs(attempt, &candidates);

            let mut accepted = None;
            for candidate in &candidates {
                let before_candidate = self.snapshot();
                match self.try_pin(candidate.connection) {
                    Ok(newly_flipped) => {
                        accepted = Some((candidate.connection, newly_flipped));
                        break;
                    }
                    Err(PlannerError::UnflippableJoin { .. }) => {
                        self.restore(before_candidate);
                    }
                    Err(other) => return Err(other),
                }
            }

            match accepted {
                Some((connection, newly_flipped)) => {
                    pinned.insert(connection);
                    flipped_joins.extend(newly_flipped.iter().copied());
                    observer.connection_pinned(attempt, connection, &newly_flipped);
                    self.propagate()?;
                }
                None => return Ok(None),
            }
        }

        Ok(Some(PlanOutcome {
            total_cost: self.total_cost()?,
            flipped_joins,
        }))
    }

    fn try_pin(&mut self, connection: ConnectionId) -> Result<Vec<JoinId>, PlannerError> {
        let flipped = self.traverse_and_pin(connection)?;
        Ok(flipped)
    }

    fn rank_unpinned(&self, pinned: &IndexSet<ConnectionId>) -> Result<Vec<CandidateCost>, PlannerError> {
        let mut candidates = Vec::new();
        for id in self.connection_ids() {
            if pinned.contains(&id) {
                continue;
            }
            let source = self.sources.get(&self.connections[id.index()].table).ok_or_else(|| {
                PlannerError::malformed(format!(
                    "no source registered for table {:?}",
                    self.connections[id.index()].table
                ))
            })?;
            let cost = self.connections[id.index()].estimate_cost(source.cost_model.as_ref())?;
            candidates.push(CandidateCost {
                connection: id,
                cost: cost.running_cost,
            });
        }
        candidates.sort_by(|a, b| a.cost.total_cmp(&b.cost));
        Ok(candidates)
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}
