//! `Source`: a named table together with the cost model that prices scans
//! of it. Sources are deduplicated by table name within a `Graph` so two
//! joins against the same table share one `CostModel` instance.

use crate::cost::CostModel;
use std::sync::Arc;

pub struct Source {
    pub table: String,
    pub cost_model: Arc<dyn CostModel>,
}

impl Source {
    pub fn new(table: impl Into<String>, cost_model: Arc<dyn CostModel>) -> Self {
        Self {
            table: table.into(),
            cost_model,
        }
    }
}
