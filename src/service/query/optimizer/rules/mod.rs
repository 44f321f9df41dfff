// Copyright 2025 Datapunk Contributors.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

mod join_reorder;
mod prune;
mod pushdown;
mod temporal;

use std::sync::Arc;

use config::meta::{plan::PlanNode, query::Predicate};
use infra::errors::*;

pub use self::{
    join_reorder::JoinReorder, prune::ColumnPrune, pushdown::PredicatePushdown,
    temporal::{GridRewrite, TemporalRewrite},
};
pub(crate) use super::stats;

/// One rewrite. `apply` returns a new plan (possibly unchanged); the engine
/// decides acceptance by cost.
pub trait OptimizationRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, plan: &PlanNode) -> Result<PlanNode>;
}

pub fn default_rules() -> Vec<Arc<dyn OptimizationRule>> {
    vec![
        Arc::new(PredicatePushdown),
        Arc::new(TemporalRewrite),
        Arc::new(GridRewrite),
        Arc::new(JoinReorder),
        Arc::new(ColumnPrune),
    ]
}

/// estimated fraction of rows surviving a predicate
pub fn selectivity(predicate: &Predicate) -> f64 {
    use config::meta::query::CmpOp;
    match predicate {
        Predicate::Cmp { op, .. } => match op {
            CmpOp::Eq => stats::EQUALITY_PRIOR,
            _ => stats::RANGE_PRIOR,
        },
        Predicate::In { values, .. } => {
            (stats::EQUALITY_PRIOR * values.len() as f64).min(1.0)
        }
        Predicate::Exists { .. } => 0.9,
        Predicate::Regex { .. } | Predicate::Text { .. } => stats::RANGE_PRIOR,
        Predicate::Geo(_) => stats::EQUALITY_PRIOR,
        Predicate::And(parts) => parts
            .iter()
            .map(selectivity)
            .product::<f64>()
            .max(0.001),
        Predicate::Or(parts) => parts.iter().map(selectivity).sum::<f64>().min(1.0),
        Predicate::Not(inner) => (1.0 - selectivity(inner)).max(0.001),
    }
}

/// rebuild a node bottom-up via the rewriter, children first
pub fn rewrite_bottom_up(
    plan: &PlanNode,
    rewrite: &impl Fn(PlanNode) -> PlanNode,
) -> PlanNode {
    let new_inputs: Vec<PlanNode> = plan
        .inputs()
        .into_iter()
        .map(|input| rewrite_bottom_up(input, rewrite))
        .collect();
    let rebuilt = if new_inputs.is_empty() {
        plan.clone()
    } else {
        plan.with_inputs(new_inputs)
    };
    rewrite(rebuilt)
}
