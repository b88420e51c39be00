//! A cost-based planner for `EXISTS`/`NOT EXISTS` subqueries.
//!
//! Given a [`tree::QueryNode`] containing arbitrarily nested correlated
//! subqueries and `AND`/`OR` combinators, [`plan_query`] decides, for every
//! `EXISTS`-style condition, which side of the join drives the scan (a
//! parent-driven semi-join, or a child-driven flipped join) and in what
//! order the query's table scans should be opened, so that each scan is
//! estimated cheapest given the constraints already chosen ahead of it.
//!
//! The heavy lifting happens in [`graph`]: [`builder::Builder`] lowers a
//! query tree into a [`graph::Graph`], [`graph::Graph::plan`] runs the
//! multi-start greedy search described in the crate's design notes, and
//! this module's [`plan_query`] reads the result back onto the tree as
//! `flip` annotations and recurses into `related` sibling subplans.

pub mod builder;
pub mod cost;
pub mod error;
pub mod graph;
pub mod ids;
pub mod observer;
pub mod stats;
pub mod tree;

use builder::{Builder, SourceProvider};
use error::PlannerError;
use ids::JoinId;
use indexmap::{IndexMap, IndexSet};
use observer::{NoopObserver, PlanningObserver};
use std::num::NonZeroU32;
use tree::{Condition, CorrelatedSubquery, PlannedQuery, QueryNode};

/// Bounds on the multi-start greedy search of §4.f.
///
/// The only knob this crate exposes: `max_attempts` caps `K`, the number of
/// differently-seeded attempts `Graph::plan` tries (itself already capped at
/// `min(num_connections, 6)`). Lowering it trades plan quality for a tighter
/// latency budget; there is no other planner-wide configuration surface, so
/// this stays a one-field struct.
#[derive(Debug, Clone, Copy)]
pub struct PlannerConfig {
    pub max_attempts: NonZeroU32,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            // SAFETY-free: 6 is a non-zero literal.
            max_attempts: NonZeroU32::new(6).unwrap(),
        }
    }
}

/// Plans `tree`, mutating it in place with `plan_id`/`flip` annotations,
/// and returns the planned output. Uses a [`observer::NoopObserver`]; see
/// [`plan_query_with_observer`] to receive the debug delegate's callbacks.
///
/// Returns `Ok(None)` when no attempt finds a fully-pinned plan for this
/// tree's own `where` clause (`ImpossiblePlan`, §7) -- not a `PlannerError`,
/// since the caller can always fall back to the unflipped tree, which
/// remains executable under default semi-join semantics. `related` sibling
/// subqueries are planned independently of this outcome (see below) and are
/// always annotated onto `tree` regardless of whether the main `where`
/// clause itself found a plan.
pub fn plan_query(
    tree: &mut QueryNode,
    sources: &dyn SourceProvider,
    config: PlannerConfig,
) -> Result<Option<PlannedQuery>, PlannerError> {
    plan_query_with_observer(tree, sources, config, &mut NoopObserver)
}

/// Like [`plan_query`], but routes every [`PlanningObserver`] callback
/// (attempt boundaries, pin decisions, flips) through `observer`.
#[tracing::instrument(skip_all, fields(table = %tree.table))]
pub fn plan_query_with_observer(
    tree: &mut QueryNode,
    sources: &dyn SourceProvider,
    config: PlannerConfig,
    observer: &mut dyn PlanningObserver,
) -> Result<Option<PlannedQuery>, PlannerError> {
    let outcome = {
        let mut graph = Builder::new().build(tree, sources)?;
        graph.plan(config.max_attempts, observer)?
    };

    if let Some(outcome) = &outcome {
        annotate_flips(tree, &outcome.flipped_joins);
    }

    // `related` entries are planned as fully independent top-level queries
    // (fresh graph per alias, §3 Lifecycle) regardless of whether the main
    // `where` clause found a plan: a sibling subquery shares no join with
    // this tree's own graph, so one having no valid plan says nothing about
    // the other. They are always recursed into and their annotations always
    // written back onto `tree.related`, even when this function ultimately
    // returns `Ok(None)` for the outer tree.
    let mut related_plans = IndexMap::new();
    for entry in &mut tree.related {
        let alias = entry
            .alias
            .clone()
            .ok_or_else(|| PlannerError::malformed("a `related` correlatedSubquery is missing its alias"))?;
        if let Some(planned) = plan_query_with_observer(&mut entry.subquery, sources, config, observer)? {
            related_plans.insert(alias, planned);
        }
    }

    match outcome {
        Some(outcome) => Ok(Some(PlannedQuery {
            tree: tree.clone(),
            related_plans,
            cost: outcome.total_cost,
        })),
        None => Ok(None),
    }
}

/// Walks `node`'s `where` clause (not `related` -- those get their own
/// independent [`plan_query_with_observer`] call) and sets `flip = Some(true)`
/// on every `correlatedSubquery` whose `plan_id` names a join in
/// `flipped`. Recurses into each subquery's own `where`, since nested
/// correlated subqueries share this tree's graph.
fn annotate_flips(node: &mut QueryNode, flipped: &IndexSet<JoinId>) {
    if let Some(condition) = &mut node.where_ {
        annotate_condition(condition, flipped);
    }
}

fn annotate_condition(condition: &mut Condition, flipped: &IndexSet<JoinId>) {
    match condition {
        Condition::Simple(_) => {}
        Condition::And(children) | Condition::Or(children) => {
            for child in children {
                annotate_condition(child, flipped);
            }
        }
        Condition::CorrelatedSubquery(cs) => annotate_subquery(cs, flipped),
    }
}

fn annotate_subquery(cs: &mut CorrelatedSubquery, flipped: &IndexSet<JoinId>) {
    if let Some(plan_id) = cs.plan_id {
        if flipped.contains(&JoinId(plan_id.0 as usize)) {
            cs.flip = Some(true);
        }
    }
    annotate_flips(&mut cs.subquery, flipped);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::{CostEstimate, CostModel};
    use crate::stats::{DefaultStatistics, TableCostModel};
    use crate::tree::{Condition, Correlation, OrderBy, SimpleCondition, SimpleOp, SubqueryOp};
    use std::sync::Arc;

    fn fixed_cost_sources(rows_by_table: Vec<(&'static str, f64)>) -> impl SourceProvider {
        let rows_by_table: IndexMap<String, f64> = rows_by_table.into_iter().map(|(t, r)| (t.to_owned(), r)).collect();
        move |table: &str| -> Result<Arc<dyn CostModel>, PlannerError> {
            let rows = rows_by_table.get(table).copied().ok_or_else(|| {
                PlannerError::malformed(format!("unknown table {table:?}"))
            })?;
            let stats = DefaultStatistics::new().with_row_count(table, rows);
            Ok(Arc::new(TableCostModel::new(table, stats)))
        }
    }

    #[test]
    fn empty_where_single_table_yields_one_pinned_connection() {
        let mut tree = QueryNode::new("widgets");
        let sources = fixed_cost_sources(vec![("widgets", 42.0)]);
        let planned = plan_query(&mut tree, &sources, PlannerConfig::default()).unwrap().unwrap();
        assert_eq!(planned.cost, 42.0);
        assert!(planned.related_plans.is_empty());
    }

    #[test]
    fn exists_flips_when_the_child_is_far_more_selective() {
        let mut tree = QueryNode::new("users").with_where(Condition::CorrelatedSubquery(CorrelatedSubquery::new(
            SubqueryOp::Exists,
            Correlation::new(vec![("id".into(), "user_id".into())]),
            QueryNode::new("posts"),
        )));
        // `users.id` is (close to) unique, so once the join flips and pushes
        // a constraint on it back onto `users`, a lookup should return
        // about one row rather than the full table -- `DefaultStatistics`'s
        // fallback fan-out (the whole row count, see `stats.rs`) would
        // otherwise make a flipped plan no cheaper than a semi one.
        let sources = move |table: &str| -> Result<Arc<dyn CostModel>, PlannerError> {
            let stats = match table {
                "users" => DefaultStatistics::new()
                    .with_row_count("users", 10_000.0)
                    .with_fan_out("users", vec!["id".into()], 1.0),
                "posts" => DefaultStatistics::new().with_row_count("posts", 100.0),
                other => return Err(PlannerError::malformed(format!("unknown table {other:?}"))),
            };
            Ok(Arc::new(TableCostModel::new(table, stats)))
        };
        let planned = plan_query(&mut tree, &sources, PlannerConfig::default()).unwrap().unwrap();

        match tree.where_.unwrap() {
            Condition::CorrelatedSubquery(cs) => assert_eq!(cs.flip, Some(true)),
            _ => panic!("expected a correlated subquery"),
        }
        // Flipped: posts (100 rows, unconstrained) drives, each probing a
        // users lookup narrowed by fan-out to ~1 row: 100 + 100*(1+1) = 300,
        // far below the semi plan's unconstrained 10000*100 = 1,000,000.
        assert!(planned.cost < 1_000.0, "expected the flipped plan to be cheap, got {}", planned.cost);
    }

    #[test]
    fn not_exists_never_flips() {
        let mut tree = QueryNode::new("users").with_where(Condition::CorrelatedSubquery(CorrelatedSubquery::new(
            SubqueryOp::NotExists,
            Correlation::new(vec![("id".into(), "user_id".into())]),
            QueryNode::new("posts"),
        )));
        let sources = fixed_cost_sources(vec![("users", 10_000.0), ("posts", 100.0)]);
        let planned = plan_query(&mut tree, &sources, PlannerConfig::default()).unwrap();

        match tree.where_.unwrap() {
            Condition::CorrelatedSubquery(cs) => assert_eq!(cs.flip, None),
            _ => panic!("expected a correlated subquery"),
        }
        assert!(planned.is_some(), "a lone NOT EXISTS always admits a semi-only plan");
    }

    #[test]
    fn related_subqueries_are_planned_independently_of_the_main_tree() {
        let mut tree = QueryNode::new("users").with_related(
            CorrelatedSubquery::new(
                SubqueryOp::Exists,
                Correlation::new(vec![("id".into(), "user_id".into())]),
                QueryNode::new("posts").with_where(Condition::CorrelatedSubquery(CorrelatedSubquery::new(
                    SubqueryOp::Exists,
                    Correlation::new(vec![("id".into(), "post_id".into())]),
                    QueryNode::new("comments"),
                ))),
            )
            .with_alias("posts"),
        );
        let sources = fixed_cost_sources(vec![("users", 1.0), ("posts", 500.0), ("comments", 5.0)]);
        let planned = plan_query(&mut tree, &sources, PlannerConfig::default()).unwrap().unwrap();

        // main plan: one connection (`users`), no joins.
        assert_eq!(planned.cost, 1.0);
        let sub = &planned.related_plans["posts"];
        // `posts` + `comments`: two connections, one join.
        assert!(sub.cost > 0.0);
    }

    #[test]
    fn missing_alias_on_a_related_entry_is_malformed_input() {
        let mut tree = QueryNode::new("users").with_related(CorrelatedSubquery::new(
            SubqueryOp::Exists,
            Correlation::new(vec![("id".into(), "user_id".into())]),
            QueryNode::new("posts"),
        ));
        let sources = fixed_cost_sources(vec![("users", 1.0), ("posts", 1.0)]);
        let err = plan_query(&mut tree, &sources, PlannerConfig::default()).unwrap_err();
        assert!(matches!(err, PlannerError::MalformedInput { .. }));
    }

    #[test]
    fn an_unknown_table_is_malformed_input() {
        let mut tree = QueryNode::new("ghost_table");
        let sources = fixed_cost_sources(vec![]);
        let err = plan_query(&mut tree, &sources, PlannerConfig::default()).unwrap_err();
        assert!(matches!(err, PlannerError::MalformedInput { .. }));
    }

    #[test]
    fn a_dangling_order_by_column_is_malformed_input() {
        let mut tree = QueryNode::new("users").with_order_by(OrderBy(vec![crate::tree::OrderKey {
            column: "does_not_exist".into(),
            descending: false,
        }]));

        struct SchemaAware;
        impl SourceProvider for SchemaAware {
            fn cost_model_for(&self, table: &str) -> Result<Arc<dyn CostModel>, PlannerError> {
                let stats = DefaultStatistics::new().with_row_count(table, 1.0);
                Ok(Arc::new(TableCostModel::new(table, stats)))
            }

            fn has_column(&self, _table: &str, column: &str) -> bool {
                column == "id"
            }
        }

        let err = plan_query(&mut tree, &SchemaAware, PlannerConfig::default()).unwrap_err();
        assert!(matches!(err, PlannerError::MalformedInput { .. }));
    }

    #[test]
    fn a_non_finite_cost_model_output_is_a_cost_model_fault() {
        struct BrokenModel;
        impl CostModel for BrokenModel {
            fn estimate(
                &self,
                _: &OrderBy,
                _: &crate::tree::Filter,
                _: &crate::graph::connection::Constraint,
            ) -> Result<CostEstimate, PlannerError> {
                Ok(CostEstimate::new(f64::NAN, 1.0, 1.0, None))
            }
        }
        let sources = move |_: &str| -> Result<Arc<dyn CostModel>, PlannerError> { Ok(Arc::new(BrokenModel)) };
        let mut tree = QueryNode::new("users").with_where(Condition::Simple(SimpleCondition {
            column: "active".into(),
            op: SimpleOp::Eq,
        }));
        let err = plan_query(&mut tree, &sources, PlannerConfig::default()).unwrap_err();
        assert!(matches!(err, PlannerError::CostModelFault { .. }));
    }

    #[test]
    fn replanning_the_same_input_twice_is_deterministic() {
        let mut tree_a = QueryNode::new("issue").with_where(Condition::CorrelatedSubquery(CorrelatedSubquery::new(
            SubqueryOp::Exists,
            Correlation::new(vec![("project_id".into(), "id".into())]),
            QueryNode::new("project"),
        )));
        let mut tree_b = tree_a.clone();
        let sources = fixed_cost_sources(vec![("issue", 10_000.0), ("project", 100.0)]);

        let a = plan_query(&mut tree_a, &sources, PlannerConfig::default()).unwrap();
        let b = plan_query(&mut tree_b, &sources, PlannerConfig::default()).unwrap();
        assert_eq!(a, b);
        assert_eq!(tree_a, tree_b);
    }
}
