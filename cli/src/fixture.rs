//! The JSON input shape this binary accepts: a query tree plus the
//! statistics fixture to price it with. Kept separate from the library's
//! own types since this shape (flat lists rather than the library's
//! `IndexMap`-keyed internals) exists purely for hand-writable JSON
//! fixtures, not as something the library itself needs to know about.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use subquery_planner::builder::SourceProvider;
use subquery_planner::cost::CostModel;
use subquery_planner::error::PlannerError;
use subquery_planner::stats::{DefaultStatistics, TableCostModel};
use subquery_planner::tree::QueryNode;

#[derive(Deserialize)]
pub struct Fixture {
    pub tree: QueryNode,
    #[serde(default)]
    pub stats: StatsFixture,
}

#[derive(Deserialize, Default)]
pub struct StatsFixture {
    #[serde(default)]
    row_counts: HashMap<String, f64>,
    #[serde(default)]
    cardinalities: Vec<ColumnCardinality>,
    #[serde(default)]
    fan_outs: Vec<FanOutFixture>,
    /// Optional column catalog, `table -> valid columns`. When present,
    /// `orderBy` columns outside this set are rejected as `MalformedInput`
    /// by [`FixtureSourceProvider::has_column`]; when a table is absent
    /// from this map entirely, its `orderBy` columns are accepted
    /// unchecked (no catalog supplied for it).
    #[serde(default)]
    columns: HashMap<String, Vec<String>>,
}

#[derive(Deserialize)]
struct ColumnCardinality {
    table: String,
    column: String,
    cardinality: f64,
}

#[derive(Deserialize)]
struct FanOutFixture {
    table: String,
    columns: Vec<String>,
    average: f64,
}

impl StatsFixture {
    pub fn into_source_provider(self) -> FixtureSourceProvider {
        let columns = self.columns.clone();
        let mut stats = DefaultStatistics::new();
        for (table, rows) in self.row_counts {
            stats = stats.with_row_count(table, rows);
        }
        for c in self.cardinalities {
            stats = stats.with_cardinality(c.table, c.column, c.cardinality);
        }
        for f in self.fan_outs {
            stats = stats.with_fan_out(f.table, f.columns, f.average);
        }
        FixtureSourceProvider {
            columns,
            stats: Arc::new(stats),
        }
    }
}

pub struct FixtureSourceProvider {
    columns: HashMap<String, Vec<String>>,
    stats: Arc<DefaultStatistics>,
}

impl SourceProvider for FixtureSourceProvider {
    fn cost_model_for(&self, table: &str) -> Result<Arc<dyn CostModel>, PlannerError> {
        Ok(Arc::new(TableCostModel::new(table, Arc::clone(&self.stats))))
    }

    fn has_column(&self, table: &str, column: &str) -> bool {
        match self.columns.get(table) {
            Some(known) => known.iter().any(|c| c == column),
            None => true,
        }
    }
}
