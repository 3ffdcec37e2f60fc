use std::fmt;
use std::str::FromStr;

use time::{Date, OffsetDateTime};

pub mod write;

/// Kind of a budget document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BudgetType {
    Draft,
    Law,
    Report,
    Total,
}

impl BudgetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetType::Draft => "DRAFT",
            BudgetType::Law => "LAW",
            BudgetType::Report => "REPORT",
            BudgetType::Total => "TOTAL",
        }
    }
}

impl FromStr for BudgetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DRAFT" => Ok(BudgetType::Draft),
            "LAW" => Ok(BudgetType::Law),
            "REPORT" => Ok(BudgetType::Report),
            "TOTAL" => Ok(BudgetType::Total),
            other => Err(format!("unknown budget type: {other}")),
        }
    }
}

impl fmt::Display for BudgetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time period a budget covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BudgetScope {
    Yearly,
    Quarterly,
    Monthly,
}

impl BudgetScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetScope::Yearly => "YEARLY",
            BudgetScope::Quarterly => "QUARTERLY",
            BudgetScope::Monthly => "MONTHLY",
        }
    }
}

impl FromStr for BudgetScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "YEARLY" => Ok(BudgetScope::Yearly),
            "QUARTERLY" => Ok(BudgetScope::Quarterly),
            "MONTHLY" => Ok(BudgetScope::Monthly),
            other => Err(format!("unknown budget scope: {other}")),
        }
    }
}

impl fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Categorical axis a dimension belongs to.
///
/// Open-ended: sources occasionally introduce new axes, so unrecognized
/// strings round-trip through `Other` instead of failing the import.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DimensionKind {
    Ministry,
    Chapter,
    SubChapter,
    Program,
    ExpenseType,
    Other(String),
}

impl DimensionKind {
    pub fn as_str(&self) -> &str {
        match self {
            DimensionKind::Ministry => "MINISTRY",
            DimensionKind::Chapter => "CHAPTER",
            DimensionKind::SubChapter => "SUBCHAPTER",
            DimensionKind::Program => "PROGRAM",
            DimensionKind::ExpenseType => "EXPENSE_TYPE",
            DimensionKind::Other(s) => s.as_str(),
        }
    }
}

impl FromStr for DimensionKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "MINISTRY" => DimensionKind::Ministry,
            "CHAPTER" => DimensionKind::Chapter,
            "SUBCHAPTER" => DimensionKind::SubChapter,
            "PROGRAM" => DimensionKind::Program,
            "EXPENSE_TYPE" => DimensionKind::ExpenseType,
            other => DimensionKind::Other(other.to_string()),
        })
    }
}

impl fmt::Display for DimensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type BudgetId = i64;
pub type DimensionId = i64;
pub type ExpenseId = i64;

/// A budget document (law, draft, report or realized total) as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Budget {
    pub id: BudgetId,
    /// Identifier carried over from the data source, e.g. "LAW-2024".
    /// Unique within (type, scope).
    pub original_identifier: String,
    pub name: String,
    pub name_translated: Option<String>,
    pub description: Option<String>,
    pub description_translated: Option<String>,
    pub budget_type: BudgetType,
    pub scope: BudgetScope,
    /// First day of the period the budget relates to.
    pub published_at: Date,
    /// First day of the period the budget was planned in.
    pub planned_at: Option<Date>,
    pub created_at: OffsetDateTime,
    pub updated_at: Option<OffsetDateTime>,
}

/// A hierarchical categorical tag attachable to expenses.
///
/// `parent_id` forms a tree over stable row ids; the parent chain is finite
/// and acyclic, which the resolver enforces with a bounded ancestor walk.
#[derive(Debug, Clone, PartialEq)]
pub struct Dimension {
    pub id: DimensionId,
    pub parent_id: Option<DimensionId>,
    /// Source identifier, unique within the kind.
    pub original_identifier: String,
    pub kind: DimensionKind,
    pub name: String,
    pub name_translated: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: Option<OffsetDateTime>,
}

/// A single monetary line item owned by exactly one budget.
#[derive(Debug, Clone, PartialEq)]
pub struct Expense {
    pub id: ExpenseId,
    pub budget_id: BudgetId,
    /// Source row identifier, unique within the budget.
    pub original_identifier: String,
    /// Non-negative amount in the source currency implied by the budget.
    pub value: f64,
    pub created_at: OffsetDateTime,
    pub updated_at: Option<OffsetDateTime>,
}

/// One validity window of a currency-pair conversion rate.
///
/// The window is `[started_at, ended_at)`; a missing bound is unbounded on
/// that side. Windows for the same pair must never overlap.
#[derive(Debug, Clone, PartialEq)]
pub struct RateWindow {
    /// Directional pair name, e.g. "RUB_USD" for RUB -> USD.
    pub pair: String,
    pub rate: f64,
    pub started_at: Option<Date>,
    pub ended_at: Option<Date>,
}

impl RateWindow {
    /// Whether `on` falls inside this window.
    pub fn contains(&self, on: Date) -> bool {
        if let Some(start) = self.started_at {
            if on < start {
                return false;
            }
        }
        if let Some(end) = self.ended_at {
            if on >= end {
                return false;
            }
        }
        true
    }
}
