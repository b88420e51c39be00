//! The query tree: the planner's only input and output type.
//!
//! A [`QueryNode`] is the algebraic recursive tree described by this crate:
//! a table, an ordering, an optional filter tree, and a list of related
//! (sibling) subqueries. Planning only ever *annotates* a tree of this
//! shape (assigning [`PlanId`]s and `flip` flags to the
//! [`CorrelatedSubquery`] nodes it contains) -- it never changes its
//! structure. All types here derive `serde::{Serialize, Deserialize}` so
//! that callers embedding this crate, and the `cli` binary, can move a tree
//! across a process boundary; the planner itself never serializes anything.

use crate::ids::PlanId;
use serde::{Deserialize, Serialize};

/// A column ordering a connection is scanned under.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy(pub Vec<OrderKey>);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderKey {
    pub column: String,
    pub descending: bool,
}

impl OrderBy {
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|k| k.column.as_str())
    }
}

/// A single, non-subquery predicate on one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleCondition {
    pub column: String,
    pub op: SimpleOp,
}

/// The shape of a non-subquery predicate, matching the PostgreSQL-style
/// selectivity defaults this crate's statistics layer falls back to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SimpleOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    /// `IN (...)` with the literal count of values, used for the
    /// `min(n/cardinality, 1)` default.
    In(u32),
    NotIn(u32),
    Like,
    Ilike,
    NotLike,
    /// An opaque boolean this crate's statistics layer cannot classify;
    /// treated as a coin flip (selectivity 0.5).
    Unknown,
}

/// The residual, non-subquery part of a `where` clause: what's left on a
/// `Connection` as its immutable `filter` once every `correlatedSubquery`
/// has been lowered into a `Join` by the builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    None,
    Simple(SimpleCondition),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Default for Filter {
    fn default() -> Self {
        Filter::None
    }
}

/// The full condition tree appearing in a query node's `where`, before the
/// builder separates subquery conditions (which become `Join`s) from
/// simple ones (which become `Filter`s).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    Simple(SimpleCondition),
    And(Vec<Condition>),
    Or(Vec<Condition>),
    CorrelatedSubquery(CorrelatedSubquery),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubqueryOp {
    Exists,
    NotExists,
}

/// A parent/child field-list pairing correlating a subquery to its parent.
/// The two lists have equal length; `parent_fields[i]` corresponds to
/// `child_fields[i]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correlation {
    pub parent_fields: Vec<String>,
    pub child_fields: Vec<String>,
}

impl Correlation {
    pub fn new(pairs: Vec<(String, String)>) -> Self {
        let (parent_fields, child_fields) = pairs.into_iter().unzip();
        Self {
            parent_fields,
            child_fields,
        }
    }

    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.parent_fields
            .iter()
            .map(String::as_str)
            .zip(self.child_fields.iter().map(String::as_str))
    }
}

/// An `EXISTS`/`NOT EXISTS` condition, or (when it carries an `alias`) a
/// `related` sibling subquery. The planner writes `plan_id` and `flip` back
/// onto these nodes; everything else is caller-supplied input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelatedSubquery {
    pub op: SubqueryOp,
    pub correlation: Correlation,
    pub subquery: Box<QueryNode>,
    /// Required when this node is reached via `QueryNode::related`;
    /// meaningless (and left `None`) when it is a condition inside `where`.
    pub alias: Option<String>,
    /// Set by the builder during `build`, before planning runs.
    pub plan_id: Option<PlanId>,
    /// Set by the builder after `plan` returns: `Some(true)` iff the
    /// corresponding join ended up flipped. Left `None` otherwise; a
    /// non-flipped join is never distinguished from one that was never
    /// visited, so this is never `Some(false)`.
    pub flip: Option<bool>,
}

impl CorrelatedSubquery {
    pub fn new(op: SubqueryOp, correlation: Correlation, subquery: QueryNode) -> Self {
        Self {
            op,
            correlation,
            subquery: Box::new(subquery),
            alias: None,
            plan_id: None,
            flip: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryNode {
    pub table: String,
    #[serde(default)]
    pub order_by: OrderBy,
    #[serde(rename = "where", default)]
    pub where_: Option<Condition>,
    #[serde(default)]
    pub related: Vec<CorrelatedSubquery>,
}

impl QueryNode {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            order_by: OrderBy::default(),
            where_: None,
            related: Vec::new(),
        }
    }

    pub fn with_where(mut self, condition: Condition) -> Self {
        self.where_ = Some(condition);
        self
    }

    pub fn with_related(mut self, related: CorrelatedSubquery) -> Self {
        self.related.push(related);
        self
    }

    pub fn with_order_by(mut self, order_by: OrderBy) -> Self {
        self.order_by = order_by;
        self
    }
}

/// The output of [`crate::plan_query`]: the annotated main tree plus one
/// independently-planned subplan per `related` alias, recursively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedQuery {
    pub tree: QueryNode,
    /// Keyed by `related` alias; populated for every `related` entry
    /// regardless of whether its own planning found a flip.
    pub related_plans: indexmap::IndexMap<String, PlannedQuery>,
    pub cost: f64,
}
