use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::models::{BudgetId, BudgetScope};
use crate::storage::{StorageBackend, StorageError};

/// Order-insensitive set of (kind, identifier) tags identifying one
/// dimension combination. Two expenses tagged MINISTRY:001 + EXPENSE_TYPE:200
/// land under the same key regardless of tag order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DimensionKey(BTreeSet<(String, String)>);

impl DimensionKey {
    fn from_tags(tags: impl IntoIterator<Item = (String, String)>) -> Self {
        Self(tags.into_iter().collect())
    }
}

impl fmt::Display for DimensionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (kind, identifier) in &self.0 {
            if !first {
                f.write_str("/")?;
            }
            write!(f, "{kind}:{identifier}")?;
            first = false;
        }
        Ok(())
    }
}

impl Serialize for DimensionKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VarianceLine {
    pub total_value: f64,
    pub comparison_value: f64,
    /// total_value - comparison_value.
    pub variance: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct VarianceReport {
    pub total_budget: String,
    pub comparison_budget: String,
    #[serde(serialize_with = "scope_as_str")]
    pub scope: BudgetScope,
    pub lines: BTreeMap<DimensionKey, VarianceLine>,
}

fn scope_as_str<S: serde::Serializer>(scope: &BudgetScope, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(scope.as_str())
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("budgets have different scopes: {total} vs {comparison}")]
    IncompatibleScope {
        total: BudgetScope,
        comparison: BudgetScope,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Diffs a retrospective TOTAL budget against a planned or published one.
///
/// The computation is symmetric (swapping the arguments negates every
/// variance); by convention the TOTAL budget is passed first so positive
/// variance reads as overspend.
pub struct ReconciliationEngine<'a> {
    store: &'a dyn StorageBackend,
}

impl<'a> ReconciliationEngine<'a> {
    pub fn new(store: &'a dyn StorageBackend) -> Self {
        Self { store }
    }

    pub fn reconcile(
        &self,
        total_id: BudgetId,
        comparison_id: BudgetId,
    ) -> Result<VarianceReport, ReconcileError> {
        let total = self.store.get_budget(total_id)?;
        let comparison = self.store.get_budget(comparison_id)?;
        if total.scope != comparison.scope {
            return Err(ReconcileError::IncompatibleScope {
                total: total.scope,
                comparison: comparison.scope,
            });
        }

        let total_sums = self.aggregate(total_id)?;
        let comparison_sums = self.aggregate(comparison_id)?;

        let mut lines = BTreeMap::new();
        for key in total_sums.keys().chain(comparison_sums.keys()) {
            if lines.contains_key(key) {
                continue;
            }
            let total_value = total_sums.get(key).copied().unwrap_or(0.0);
            let comparison_value = comparison_sums.get(key).copied().unwrap_or(0.0);
            lines.insert(
                key.clone(),
                VarianceLine {
                    total_value,
                    comparison_value,
                    variance: total_value - comparison_value,
                },
            );
        }

        Ok(VarianceReport {
            total_budget: total.original_identifier,
            comparison_budget: comparison.original_identifier,
            scope: total.scope,
            lines,
        })
    }

    /// Sums expense values per dimension combination for one budget.
    fn aggregate(&self, budget_id: BudgetId) -> Result<BTreeMap<DimensionKey, f64>, ReconcileError> {
        let mut sums = BTreeMap::new();
        for expense in self.store.expenses_for_budget(budget_id)? {
            let mut tags = Vec::new();
            for dim_id in self.store.expense_dimensions(expense.id)? {
                let dim = self.store.get_dimension(dim_id)?;
                tags.push((dim.kind.to_string(), dim.original_identifier));
            }
            *sums.entry(DimensionKey::from_tags(tags)).or_insert(0.0) += expense.value;
        }
        Ok(sums)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::{BudgetDocument, ExpenseRow, ImportPipeline};
    use crate::models::{write::BudgetUpsert, BudgetType, DimensionKind};
    use crate::resolver::DimensionSpec;
    use crate::storage::InMemoryStorage;
    use time::macros::date;

    fn budget(identifier: &str, budget_type: BudgetType, scope: BudgetScope) -> BudgetUpsert {
        BudgetUpsert {
            original_identifier: identifier.to_string(),
            name: identifier.to_string(),
            name_translated: None,
            description: None,
            description_translated: None,
            budget_type,
            scope,
            published_at: date!(2024 - 01 - 01),
            planned_at: None,
        }
    }

    fn row(identifier: &str, value: f64, ministry: &str, expense_type: &str) -> ExpenseRow {
        ExpenseRow {
            original_identifier: identifier.to_string(),
            value,
            dimensions: vec![
                DimensionSpec::new(DimensionKind::Ministry, ministry, ministry),
                DimensionSpec::new(DimensionKind::ExpenseType, expense_type, expense_type),
            ],
        }
    }

    fn import(
        store: &InMemoryStorage,
        identifier: &str,
        budget_type: BudgetType,
        scope: BudgetScope,
        rows: Vec<ExpenseRow>,
    ) -> crate::models::BudgetId {
        let pipeline = ImportPipeline::new(store);
        let report = pipeline
            .import_budget(&BudgetDocument {
                budget: budget(identifier, budget_type, scope),
                dimensions: vec![],
                rows,
            })
            .unwrap();
        assert_eq!(report.failed, 0);
        store
            .find_budget(identifier, budget_type, scope)
            .unwrap()
            .unwrap()
            .id
    }

    #[test]
    fn total_vs_law_variance() {
        let store = InMemoryStorage::new();
        let law_id = import(
            &store,
            "2024-LAW",
            BudgetType::Law,
            BudgetScope::Quarterly,
            vec![
                row("1", 100.0, "Defense", "Salaries"),
                row("2", 50.0, "Defense", "Equipment"),
            ],
        );
        let total_id = import(
            &store,
            "2024-TOTAL",
            BudgetType::Total,
            BudgetScope::Quarterly,
            vec![row("1", 120.0, "Defense", "Salaries")],
        );

        let report = ReconciliationEngine::new(&store)
            .reconcile(total_id, law_id)
            .unwrap();

        assert_eq!(report.lines.len(), 2);
        let salaries = &report.lines[&DimensionKey::from_tags([
            ("MINISTRY".to_string(), "Defense".to_string()),
            ("EXPENSE_TYPE".to_string(), "Salaries".to_string()),
        ])];
        assert_eq!(salaries.variance, 20.0);
        let equipment = &report.lines[&DimensionKey::from_tags([
            ("MINISTRY".to_string(), "Defense".to_string()),
            ("EXPENSE_TYPE".to_string(), "Equipment".to_string()),
        ])];
        assert_eq!(equipment.total_value, 0.0);
        assert_eq!(equipment.variance, -50.0);
    }

    #[test]
    fn swapping_arguments_negates_every_variance() {
        let store = InMemoryStorage::new();
        let a = import(
            &store,
            "A",
            BudgetType::Law,
            BudgetScope::Yearly,
            vec![row("1", 10.0, "M1", "E1"), row("2", 30.0, "M2", "E1")],
        );
        let b = import(
            &store,
            "B",
            BudgetType::Total,
            BudgetScope::Yearly,
            vec![row("1", 25.0, "M1", "E1"), row("2", 5.0, "M3", "E2")],
        );

        let engine = ReconciliationEngine::new(&store);
        let forward = engine.reconcile(a, b).unwrap();
        let backward = engine.reconcile(b, a).unwrap();
        assert_eq!(forward.lines.len(), backward.lines.len());
        for (key, line) in &forward.lines {
            assert_eq!(backward.lines[key].variance, -line.variance);
        }
    }

    #[test]
    fn mismatched_scopes_are_rejected() {
        let store = InMemoryStorage::new();
        let yearly = import(&store, "Y", BudgetType::Law, BudgetScope::Yearly, vec![]);
        let quarterly = import(
            &store,
            "Q",
            BudgetType::Total,
            BudgetScope::Quarterly,
            vec![],
        );
        assert!(matches!(
            ReconciliationEngine::new(&store).reconcile(quarterly, yearly),
            Err(ReconcileError::IncompatibleScope { .. })
        ));
    }

    #[test]
    fn same_key_expenses_are_summed() {
        let store = InMemoryStorage::new();
        let a = import(
            &store,
            "A",
            BudgetType::Law,
            BudgetScope::Yearly,
            vec![row("1", 10.0, "M1", "E1"), row("2", 15.0, "M1", "E1")],
        );
        let b = import(
            &store,
            "B",
            BudgetType::Total,
            BudgetScope::Yearly,
            vec![row("1", 30.0, "M1", "E1")],
        );
        let report = ReconciliationEngine::new(&store).reconcile(b, a).unwrap();
        assert_eq!(report.lines.len(), 1);
        let line = report.lines.values().next().unwrap();
        assert_eq!(line.variance, 5.0);
    }
}
