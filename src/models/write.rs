use time::Date;

use super::{BudgetId, BudgetScope, BudgetType, DimensionId, DimensionKind};

/// Insert-or-update command for a budget, keyed on
/// (original_identifier, type, scope).
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetUpsert {
    pub original_identifier: String,
    pub name: String,
    pub name_translated: Option<String>,
    pub description: Option<String>,
    pub description_translated: Option<String>,
    pub budget_type: BudgetType,
    pub scope: BudgetScope,
    pub published_at: Date,
    pub planned_at: Option<Date>,
}

/// Insert-or-update command for a dimension, keyed on
/// (kind, original_identifier). The parent must already hold a row id;
/// translating a source parent reference into an id is the resolver's job.
#[derive(Debug, Clone, PartialEq)]
pub struct DimensionUpsert {
    pub kind: DimensionKind,
    pub original_identifier: String,
    pub name: String,
    pub name_translated: Option<String>,
    pub parent_id: Option<DimensionId>,
}

/// Insert-or-update command for an expense, keyed on
/// (budget_id, original_identifier).
#[derive(Debug, Clone, PartialEq)]
pub struct ExpenseUpsert {
    pub budget_id: BudgetId,
    pub original_identifier: String,
    pub value: f64,
}

/// Insert-or-update command for one rate validity window, keyed on
/// (pair, started_at).
#[derive(Debug, Clone, PartialEq)]
pub struct RateWindowUpsert {
    pub pair: String,
    pub rate: f64,
    pub started_at: Option<Date>,
    pub ended_at: Option<Date>,
}
