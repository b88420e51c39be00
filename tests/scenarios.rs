//! End-to-end planning scenarios, exercised through the public API only.

use indexmap::IndexMap;
use std::sync::{Arc, Mutex};
use subquery_planner::builder::SourceProvider;
use subquery_planner::cost::{CostEstimate, CostModel};
use subquery_planner::error::PlannerError;
use subquery_planner::observer::{CandidateCost, PlanningObserver};
use subquery_planner::stats::{DefaultStatistics, TableCostModel};
use subquery_planner::tree::{Condition, Correlation, CorrelatedSubquery, QueryNode, SubqueryOp};
use subquery_planner::{plan_query, plan_query_with_observer, PlannerConfig};

/// A flat per-table base cost, reduced by a fixed divisor whenever the
/// connection carries any constraint at all -- enough to make a chain's
/// outer tables attractive to constrain without needing a real statistics
/// model.
struct DivisorCostModel {
    base_rows: f64,
    divisor_when_constrained: f64,
}

impl CostModel for DivisorCostModel {
    fn estimate(
        &self,
        _ordering: &subquery_planner::tree::OrderBy,
        _filter: &subquery_planner::tree::Filter,
        constraint: &subquery_planner::graph::connection::Constraint,
    ) -> Result<CostEstimate, PlannerError> {
        let rows = if constraint.is_empty() {
            self.base_rows
        } else {
            self.base_rows / self.divisor_when_constrained
        };
        Ok(CostEstimate::new(rows, rows, 1.0, None))
    }
}

fn divisor_sources(rows_by_table: Vec<(&'static str, f64, f64)>) -> impl SourceProvider {
    let table_costs: IndexMap<String, (f64, f64)> = rows_by_table
        .into_iter()
        .map(|(t, rows, divisor)| (t.to_owned(), (rows, divisor)))
        .collect();
    move |table: &str| -> Result<Arc<dyn CostModel>, PlannerError> {
        let (base_rows, divisor_when_constrained) = table_costs
            .get(table)
            .copied()
            .ok_or_else(|| PlannerError::malformed(format!("unknown table {table:?}")))?;
        Ok(Arc::new(DivisorCostModel {
            base_rows,
            divisor_when_constrained,
        }))
    }
}

fn exists(parent_field: &str, child_field: &str, subquery: QueryNode) -> Condition {
    Condition::CorrelatedSubquery(CorrelatedSubquery::new(
        SubqueryOp::Exists,
        Correlation::new(vec![(parent_field.into(), child_field.into())]),
        subquery,
    ))
}

/// A four-table correlated chain (`issue` at the root, nesting down to
/// `creator`), with the outermost table far more expensive than any of its
/// descendants and every table's cost collapsing once it picks up a
/// constraint. The cheapest-first greedy search should chase constraints
/// toward `issue` rather than leaving it as an unconstrained full scan.
#[test]
fn four_table_chain_flips_toward_the_cheapest_leaf() {
    let mut tree = QueryNode::new("issue").with_where(exists(
        "project_id",
        "id",
        QueryNode::new("project").with_where(exists(
            "id",
            "project_id",
            QueryNode::new("project_member").with_where(exists(
                "creator_id",
                "id",
                QueryNode::new("creator"),
            )),
        )),
    ));

    let sources = divisor_sources(vec![
        ("issue", 10_000.0, 500.0),
        ("project", 100.0, 10.0),
        ("project_member", 1.0, 1.0),
        ("creator", 2.0, 1.0),
    ]);

    let planned = plan_query(&mut tree, &sources, PlannerConfig::default())
        .unwrap()
        .expect("a linear EXISTS chain with every join flippable always admits a plan");

    // Without any flip, `issue`'s own baseline scan alone already costs
    // 10,000; a search that chases the cheap leaf connections first and
    // flips outer joins to constrain `issue` must land well below that.
    assert!(
        planned.cost < 10_000.0,
        "expected the greedy search to beat an unconstrained issue scan, got {}",
        planned.cost
    );
}

/// `users WHERE EXISTS posts OR EXISTS comments`: exactly one FanOut/FanIn
/// pair and two joins, both independently flippable regardless of the
/// disjunction they sit under.
#[test]
fn or_of_two_exists_finds_a_plan_with_both_joins_independently_flippable() {
    let mut tree = QueryNode::new("users").with_where(Condition::Or(vec![
        exists("id", "user_id", QueryNode::new("posts")),
        exists("id", "user_id", QueryNode::new("comments")),
    ]));

    let sources = fixed_cost(vec![("users", 10_000.0), ("posts", 5.0), ("comments", 5.0)]);
    let planned = plan_query(&mut tree, &sources, PlannerConfig::default())
        .unwrap()
        .expect("an OR of two EXISTS, both EXISTS, always admits a plan");

    assert!(planned.cost > 0.0);
    match tree.where_.unwrap() {
        Condition::Or(children) => assert_eq!(children.len(), 2),
        other => panic!("expected the OR to survive lowering, got {other:?}"),
    }
}

/// `users WHERE EXISTS(posts WHERE EXISTS comments)`: a nested nested
/// topology. Whichever joins end up flipped, the plan must be valid and its
/// cost must not regress past the unconstrained baseline.
#[test]
fn nested_exists_finds_a_valid_topology() {
    let mut tree = QueryNode::new("users").with_where(exists(
        "id",
        "user_id",
        QueryNode::new("posts").with_where(exists("id", "post_id", QueryNode::new("comments"))),
    ));

    let sources = fixed_cost(vec![("users", 10_000.0), ("posts", 500.0), ("comments", 5_000.0)]);
    let planned = plan_query(&mut tree, &sources, PlannerConfig::default()).unwrap();
    assert!(planned.is_some(), "a fully-EXISTS nested chain always admits a plan");
}

fn fixed_cost(rows_by_table: Vec<(&'static str, f64)>) -> impl SourceProvider {
    let rows_by_table: IndexMap<String, f64> = rows_by_table.into_iter().map(|(t, r)| (t.to_owned(), r)).collect();
    move |table: &str| -> Result<Arc<dyn CostModel>, PlannerError> {
        let rows = rows_by_table
            .get(table)
            .copied()
            .ok_or_else(|| PlannerError::malformed(format!("unknown table {table:?}")))?;
        let stats = DefaultStatistics::new().with_row_count(table, rows);
        Ok(Arc::new(TableCostModel::new(table, stats)))
    }
}

/// A `PlanningObserver` test double recording every callback invocation, so
/// the attempt/pin/flip protocol can be asserted against rather than
/// inferred from the final annotated tree alone.
#[derive(Default)]
struct RecordingObserver {
    attempt_starts: Vec<usize>,
    attempt_completes: Vec<(usize, f64)>,
    attempt_failures: Vec<usize>,
    best_plans: Vec<(usize, f64)>,
    pins: Vec<usize>,
    step_costs: Vec<usize>,
}

/// Wraps the recorder behind a `Mutex` so the observer's `&mut self`
/// callbacks can be driven while a shared reference to the recorded log is
/// kept around for the assertions below.
struct SharedRecorder(Arc<Mutex<RecordingObserver>>);

impl PlanningObserver for SharedRecorder {
    fn attempt_start(&mut self, attempt: usize, _starting_connection: subquery_planner::ids::ConnectionId) {
        self.0.lock().unwrap().attempt_starts.push(attempt);
    }

    fn step_costs(&mut self, attempt: usize, _candidates: &[CandidateCost]) {
        self.0.lock().unwrap().step_costs.push(attempt);
    }

    fn connection_pinned(
        &mut self,
        attempt: usize,
        _connection: subquery_planner::ids::ConnectionId,
        _flipped_joins: &[subquery_planner::ids::JoinId],
    ) {
        self.0.lock().unwrap().pins.push(attempt);
    }

    fn attempt_complete(&mut self, attempt: usize, total_cost: f64) {
        self.0.lock().unwrap().attempt_completes.push((attempt, total_cost));
    }

    fn attempt_failed(&mut self, attempt: usize) {
        self.0.lock().unwrap().attempt_failures.push(attempt);
    }

    fn best_plan_found(&mut self, attempt: usize, total_cost: f64) {
        self.0.lock().unwrap().best_plans.push((attempt, total_cost));
    }
}

#[test]
fn observer_sees_every_attempt_and_at_least_one_best_plan() {
    let mut tree = QueryNode::new("users").with_where(exists("id", "user_id", QueryNode::new("posts")));
    let sources = fixed_cost(vec![("users", 10_000.0), ("posts", 100.0)]);

    let recorder = Arc::new(Mutex::new(RecordingObserver::default()));
    let mut observer = SharedRecorder(Arc::clone(&recorder));
    let planned = plan_query_with_observer(&mut tree, &sources, PlannerConfig::default(), &mut observer).unwrap();
    assert!(planned.is_some());

    let recorded = recorder.lock().unwrap();
    assert_eq!(
        recorded.attempt_starts.len(),
        recorded.attempt_completes.len() + recorded.attempt_failures.len(),
        "every started attempt must either complete or fail, exactly once each"
    );
    assert!(!recorded.best_plans.is_empty(), "at least one attempt must register a best plan");
    assert!(!recorded.pins.is_empty(), "at least one connection must be pinned");
}
