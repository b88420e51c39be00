//! Small newtype indices into the [`crate::graph::Graph`]'s node arenas.
//!
//! The graph's node family is a closed set of five variants (connection,
//! join, fan-out, fan-in, terminus), so it is stored as four parallel
//! arenas plus one terminus rather than behind `Box<dyn Node>`. These ids
//! are the only way code outside `graph::Graph` ever refers to a node;
//! resolving one to actual state always goes back through the owning
//! `Graph`.

use std::fmt;

macro_rules! node_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) usize);

        impl $name {
            pub(crate) fn index(self) -> usize {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

node_id!(ConnectionId);
node_id!(JoinId);
node_id!(FanOutId);
node_id!(FanInId);

/// Unique, stable identifier assigned to a `correlatedSubquery` node in the
/// *input* query tree. Preserved end-to-end between that node and the
/// `Join` the builder creates for it, end-to-end through planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct PlanId(pub u32);

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A reference to whichever node sits downstream of (or is an input to)
/// another node. The variant set is closed and dispatch on it is a plain
/// `match`, never a vtable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRef {
    Connection(ConnectionId),
    Join(JoinId),
    FanOut(FanOutId),
    FanIn(FanInId),
    Terminus,
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRef::Connection(id) => write!(f, "{id}"),
            NodeRef::Join(id) => write!(f, "{id}"),
            NodeRef::FanOut(id) => write!(f, "{id}"),
            NodeRef::FanIn(id) => write!(f, "{id}"),
            NodeRef::Terminus => write!(f, "Terminus"),
        }
    }
}
