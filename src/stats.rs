//! The statistics provider seam and a default PostgreSQL-style
//! implementation of its selectivity rules.

use crate::cost::{CostEstimate, CostModel};
use crate::error::PlannerError;
use crate::graph::connection::Constraint;
use crate::tree::{Filter, OrderBy, SimpleOp};
use indexmap::IndexMap;

/// How a [`Statistics`] implementation arrived at a fan-out estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    /// Backed by a cardinality sketch (e.g. HyperLogLog) over real data.
    Sketch,
    /// A guessed default, used when no sketch is available.
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FanOutEstimate {
    pub average: f64,
    pub confidence: Confidence,
}

/// Row count, cardinality, fan-out, and filter-selectivity capabilities a
/// cost model needs, kept behind a trait so a caller with real sketches or
/// catalog statistics can supply them without reimplementing [`CostModel`]
/// from scratch (see [`TableCostModel`]).
pub trait Statistics: Send + Sync {
    fn row_count(&self, table: &str) -> f64;

    /// Distinct-value cardinality for a column. `None` when unknown; callers
    /// generally fall back to `row_count` (every row distinct) in that case,
    /// which is what [`DefaultStatistics`] does.
    fn cardinality(&self, table: &str, column: &str) -> Option<f64>;

    fn fan_out(&self, table: &str, columns: &[String]) -> FanOutEstimate;

    /// Selectivity of a filter tree, using the PostgreSQL-style defaults
    /// below when no sketch is available.
    fn selectivity(&self, table: &str, filter: &Filter) -> f64 {
        default_selectivity(self, table, filter)
    }
}

/// The PostgreSQL-style default selectivity rules, implemented against any
/// `Statistics` so both `DefaultStatistics` and a caller's custom
/// implementation can reuse them via `Statistics::selectivity`'s default
/// body.
fn default_selectivity<S: Statistics + ?Sized>(stats: &S, table: &str, filter: &Filter) -> f64 {
    match filter {
        Filter::None => 1.0,
        Filter::Simple(cond) => {
            let cardinality = stats
                .cardinality(table, &cond.column)
                .unwrap_or_else(|| stats.row_count(table).max(1.0));
            match &cond.op {
                SimpleOp::Eq => (1.0 / cardinality).min(1.0),
                SimpleOp::Neq => 1.0 - (1.0 / cardinality).min(1.0),
                SimpleOp::In(n) => (f64::from(*n) / cardinality).min(1.0),
                SimpleOp::NotIn(n) => 1.0 - (f64::from(*n) / cardinality).min(1.0),
                SimpleOp::Lt | SimpleOp::Lte | SimpleOp::Gt | SimpleOp::Gte => 0.333,
                SimpleOp::Like | SimpleOp::Ilike => 0.1,
                SimpleOp::NotLike => 0.9,
                SimpleOp::Unknown => 0.5,
            }
        }
        Filter::And(children) => children
            .iter()
            .map(|c| default_selectivity(stats, table, c))
            .product(),
        Filter::Or(children) => {
            let complement: f64 = children
                .iter()
                .map(|c| 1.0 - default_selectivity(stats, table, c))
                .product();
            1.0 - complement
        }
    }
}

/// An in-memory `Statistics` provider holding explicit per-table row counts,
/// per-column cardinalities, and per-column-list fan-outs, applying the
/// default selectivity rules above. Suitable as a fixture in tests and the
/// CLI; production callers with real sketches implement `Statistics`
/// directly.
#[derive(Debug, Clone, Default)]
pub struct DefaultStatistics {
    row_counts: IndexMap<String, f64>,
    cardinalities: IndexMap<(String, String), f64>,
    fan_outs: IndexMap<(String, Vec<String>), FanOutEstimate>,
}

impl DefaultStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_row_count(mut self, table: impl Into<String>, rows: f64) -> Self {
        self.row_counts.insert(table.into(), rows);
        self
    }

    pub fn with_cardinality(
        mut self,
        table: impl Into<String>,
        column: impl Into<String>,
        cardinality: f64,
    ) -> Self {
        self.cardinalities
            .insert((table.into(), column.into()), cardinality);
        self
    }

    pub fn with_fan_out(
        mut self,
        table: impl Into<String>,
        columns: Vec<String>,
        average: f64,
    ) -> Self {
        self.fan_outs.insert(
            (table.into(), columns),
            FanOutEstimate {
                average,
                confidence: Confidence::Sketch,
            },
        );
        self
    }
}

impl Statistics for DefaultStatistics {
    fn row_count(&self, table: &str) -> f64 {
        self.row_counts.get(table).copied().unwrap_or(0.0)
    }

    fn cardinality(&self, table: &str, column: &str) -> Option<f64> {
        self.cardinalities
            .get(&(table.to_owned(), column.to_owned()))
            .copied()
    }

    fn fan_out(&self, table: &str, columns: &[String]) -> FanOutEstimate {
        self.fan_outs
            .get(&(table.to_owned(), columns.to_vec()))
            .copied()
            .unwrap_or(FanOutEstimate {
                average: self.row_count(table).max(1.0),
                confidence: Confidence::Default,
            })
    }
}

/// Composes a [`Statistics`] implementation into a [`CostModel`] for a
/// single table: a straightforward sequential-scan baseline (`running_cost`
/// proportional to the rows actually read) reduced by the filter's
/// selectivity and, when a constraint is present, by an equality-lookup
/// selectivity per constrained column (`1/cardinality`).
pub struct TableCostModel<S> {
    table: String,
    stats: S,
}

impl<S: Statistics> TableCostModel<S> {
    pub fn new(table: impl Into<String>, stats: S) -> Self {
        Self {
            table: table.into(),
            stats,
        }
    }
}

impl<S: Statistics> CostModel for TableCostModel<S> {
    fn estimate(
        &self,
        _ordering: &OrderBy,
        filter: &Filter,
        constraint: &Constraint,
    ) -> Result<CostEstimate, PlannerError> {
        let base_rows = self.stats.row_count(&self.table).max(0.0);
        let filter_selectivity = self.stats.selectivity(&self.table, filter).clamp(f64::MIN_POSITIVE, 1.0);

        // With no constraint this is a baseline full scan under `filter`
        // alone, per the cost-model contract's `constraint` empty case.
        // With one, the constrained columns are priced via the provider's
        // fan-out for that (table, ordered-column-list) pair -- the rows a
        // single probe against this table's constrained side is expected
        // to return -- rather than a per-column `1/cardinality` estimate,
        // since fan-out is exactly "rows per distinct key" and composes
        // correctly across a multi-column correlation.
        let rows = if constraint.is_empty() {
            base_rows * filter_selectivity
        } else {
            let columns: Vec<String> = constraint.columns().map(str::to_owned).collect();
            let fan_out = self.stats.fan_out(&self.table, &columns);
            (fan_out.average.max(0.0) * filter_selectivity).min(base_rows)
        };
        let selectivity = if base_rows > 0.0 {
            (rows / base_rows).clamp(f64::MIN_POSITIVE, 1.0)
        } else {
            filter_selectivity
        };

        Ok(CostEstimate::new(rows, rows, selectivity, None))
    }
}

/// Lets an `Arc<dyn Statistics>` or `Arc<DefaultStatistics>` be shared
/// across several `TableCostModel`s (one per table) without cloning the
/// underlying provider, the same way `Source` shares one `Arc<dyn
/// CostModel>` across repeated scans of the same table.
impl<S: Statistics + ?Sized> Statistics for std::sync::Arc<S> {
    fn row_count(&self, table: &str) -> f64 {
        (**self).row_count(table)
    }

    fn cardinality(&self, table: &str, column: &str) -> Option<f64> {
        (**self).cardinality(table, column)
    }

    fn fan_out(&self, table: &str, columns: &[String]) -> FanOutEstimate {
        (**self).fan_out(table, columns)
    }

    fn selectivity(&self, table: &str, filter: &Filter) -> f64 {
        (**self).selectivity(table, filter)
    }
}
