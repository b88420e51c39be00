//! `FanOut` and `FanIn`: the two multi-edge node kinds. A `FanOut` is a
//! table shared by more than one correlated join (many `Join::parent`s
//! point at the same `FanOut`); a `FanIn` is the convergence point of an
//! `OR`-ed set of branch subgraphs, each of which may itself contain
//! further joins and fan-outs.

use crate::cost::CostEstimate;
use crate::ids::{FanInId, FanOutId, NodeRef};

pub struct FanOut {
    id: FanOutId,
    input: NodeRef,
    downstream: NodeRef,
}

impl FanOut {
    pub(crate) fn new(id: FanOutId, input: NodeRef, downstream: NodeRef) -> Self {
        Self {
            id,
            input,
            downstream,
        }
    }

    pub fn id(&self) -> FanOutId {
        self.id
    }

    pub fn input(&self) -> NodeRef {
        self.input
    }

    pub fn downstream(&self) -> NodeRef {
        self.downstream
    }

    /// Patches `input` after construction, for the same forward-reference
    /// reason as `Join::set_parent`.
    pub(crate) fn set_input(&mut self, input: NodeRef) {
        self.input = input;
    }
}

/// How a `FanIn` labels its branches when composing the branch-pattern
/// prefix it hands each input.
///
/// `Plain` is the starting mode: every branch is tagged with the same `0`,
/// since as long as no branch has flipped a join, the branches are
/// interchangeable scans whose constraints never need to be told apart.
/// Once a flip occurs inside one of the branches, that branch's
/// constraints are no longer equivalent to its siblings' (a flipped join
/// pushes a different constraint down its subtree than an unflipped one
/// would), so the planner switches the `FanIn` to `Union`, which gives each
/// input its own distinct index and keeps their accumulated constraints
/// from being conflated at any `Connection` they happen to share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanMode {
    Plain,
    Union,
}

pub struct FanIn {
    id: FanInId,
    inputs: Vec<NodeRef>,
    downstream: NodeRef,
    mode: FanMode,
}

impl FanIn {
    pub(crate) fn new(id: FanInId, inputs: Vec<NodeRef>, downstream: NodeRef) -> Self {
        Self {
            id,
            inputs,
            downstream,
            mode: FanMode::Plain,
        }
    }

    pub fn id(&self) -> FanInId {
        self.id
    }

    pub fn inputs(&self) -> &[NodeRef] {
        &self.inputs
    }

    pub fn downstream(&self) -> NodeRef {
        self.downstream
    }

    pub fn mode(&self) -> FanMode {
        self.mode
    }

    /// Patches `inputs` after construction, for the same forward-reference
    /// reason as `Join::set_parent`.
    pub(crate) fn set_inputs(&mut self, inputs: Vec<NodeRef>) {
        self.inputs = inputs;
    }

    /// Switches this fan-in to `Union` mode. Idempotent; a caller need not
    /// check whether it already switched.
    pub fn switch_to_union(&mut self) {
        self.mode = FanMode::Union;
    }

    /// The branch-pattern suffix to append for `input_index`, given this
    /// fan-in's current mode.
    pub fn branch_suffix(&self, input_index: usize) -> u32 {
        match self.mode {
            FanMode::Plain => 0,
            FanMode::Union => input_index as u32,
        }
    }

    /// Combines the recursively-estimated cost of every branch into this
    /// fan-in's own contribution.
    ///
    /// `running_cost` is additive: every branch is an independent subgraph
    /// that must actually run. `selectivity` follows the `OR` rule (one
    /// minus the product of complements). `rows` has no single correct
    /// combination for an arbitrary mix of branches with different
    /// cardinalities; this averages them, which is exact when branches are
    /// mutually exclusive and otherwise an acknowledged approximation.
    /// `limit` is dropped rather than guessed at, matching `Connection`'s
    /// aggregation under a union fan-in.
    pub fn combine_cost(branch_costs: &[CostEstimate]) -> CostEstimate {
        if branch_costs.is_empty() {
            return CostEstimate::zero();
        }

        let running_cost: f64 = branch_costs.iter().map(|c| c.running_cost).sum();
        let complement: f64 = branch_costs.iter().map(|c| 1.0 - c.selectivity).product();
        let selectivity = (1.0 - complement).clamp(f64::MIN_POSITIVE, 1.0);
        let rows = branch_costs.iter().map(|c| c.rows).sum::<f64>() / branch_costs.len() as f64;

        CostEstimate::new(rows, running_cost, selectivity, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_mode_tags_every_branch_zero() {
        let f = FanIn::new(FanInId(0), vec![NodeRef::Terminus, NodeRef::Terminus], NodeRef::Terminus);
        assert_eq!(f.branch_suffix(0), 0);
        assert_eq!(f.branch_suffix(1), 0);
    }

    #[test]
    fn union_mode_tags_branches_distinctly() {
        let mut f = FanIn::new(FanInId(0), vec![NodeRef::Terminus, NodeRef::Terminus], NodeRef::Terminus);
        f.switch_to_union();
        assert_eq!(f.branch_suffix(0), 0);
        assert_eq!(f.branch_suffix(1), 1);
    }

    #[test]
    fn combine_cost_is_additive_on_running_cost() {
        let a = CostEstimate::new(10.0, 5.0, 0.5, None);
        let b = CostEstimate::new(20.0, 7.0, 0.25, None);
        let combined = FanIn::combine_cost(&[a, b]);
        assert!((combined.running_cost - 12.0).abs() < 1e-9);
    }
}
