//! `Terminus`: the single sink every graph converges on. It owns no state
//! of its own beyond a reference to whatever sits at its one input; it
//! exists so every other node's `downstream` field has something to point
//! at uniformly, including nodes that sit directly under the query root.

use crate::ids::NodeRef;

#[derive(Default)]
pub struct Terminus {
    /// `None` until the builder finishes assembling the graph.
    pub input: Option<NodeRef>,
}
