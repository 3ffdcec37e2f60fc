use serde::Serialize;
use thiserror::Error;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::models::{
    write::{BudgetUpsert, ExpenseUpsert},
    BudgetId,
};
use crate::resolver::{DimensionResolver, DimensionSpec};
use crate::storage::{StorageBackend, StorageError, Upserted};

/// One expense-defining source row, already normalized by a source adapter.
/// Dimension specs are listed parents-first so the resolver sees every
/// parent before the row that needs it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpenseRow {
    /// Stable row identifier within the budget, e.g. "001-0102-200".
    pub original_identifier: String,
    pub value: f64,
    pub dimensions: Vec<DimensionSpec>,
}

/// A parsed source file: the budget it defines, the dimensions its header
/// and section rows define, and its expense rows. Import order within a
/// batch is budget, then dimensions, then rows, so row-level dimension
/// references always resolve against already-imported definitions.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetDocument {
    pub budget: BudgetUpsert,
    pub dimensions: Vec<DimensionSpec>,
    pub rows: Vec<ExpenseRow>,
}

#[derive(Debug, Error)]
pub enum ImportError {
    /// Structural: the budget record itself is unusable, nothing commits.
    #[error("invalid budget {identifier}: {reason}")]
    InvalidBudget { identifier: String, reason: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Serialize)]
pub struct RowFailure {
    pub identifier: String,
    pub reason: String,
}

/// Per-batch outcome summary. Every row lands in exactly one of
/// created/updated/skipped/failed; `skipped` means the row already existed
/// with identical values.
#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub batch_id: String,
    pub budget_identifier: String,
    pub budget_outcome: &'static str,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub failures: Vec<RowFailure>,
}

impl ImportReport {
    fn new(budget_identifier: &str, budget_outcome: Upserted) -> Self {
        Self {
            batch_id: Uuid::new_v4().to_string(),
            budget_identifier: budget_identifier.to_string(),
            budget_outcome: outcome_str(budget_outcome),
            created: 0,
            updated: 0,
            skipped: 0,
            failed: 0,
            failures: Vec::new(),
        }
    }

    pub fn rows_processed(&self) -> usize {
        self.created + self.updated + self.skipped + self.failed
    }

    /// Every row failed. The CLI treats this as a batch failure even though
    /// the batch itself committed.
    pub fn is_total_failure(&self) -> bool {
        self.failed > 0 && self.failed == self.rows_processed()
    }
}

fn outcome_str(outcome: Upserted) -> &'static str {
    match outcome {
        Upserted::Created => "created",
        Upserted::Updated => "updated",
        Upserted::Unchanged => "unchanged",
    }
}

/// Row-by-row ingestion of normalized source documents.
///
/// Each call runs as one atomic batch: either the whole document commits or
/// nothing does. Malformed rows are recorded and skipped; only structural
/// failures (bad budget record, broken store) abort the batch.
pub struct ImportPipeline<'a> {
    store: &'a dyn StorageBackend,
}

impl<'a> ImportPipeline<'a> {
    pub fn new(store: &'a dyn StorageBackend) -> Self {
        Self { store }
    }

    /// Imports a budget-defining document: upserts the budget, then its rows.
    pub fn import_budget(&self, doc: &BudgetDocument) -> Result<ImportReport, ImportError> {
        validate_budget(&doc.budget)?;
        self.in_transaction(|| {
            let (budget_id, outcome) = self.store.upsert_budget(&doc.budget)?;
            let mut report = ImportReport::new(&doc.budget.original_identifier, outcome);
            self.import_dimensions(&doc.dimensions, &mut report)?;
            self.import_rows(budget_id, &doc.rows, &mut report)?;
            Ok(report)
        })
    }

    /// Imports expense rows into an existing budget.
    pub fn import_expenses(
        &self,
        budget_id: BudgetId,
        rows: &[ExpenseRow],
    ) -> Result<ImportReport, ImportError> {
        self.in_transaction(|| {
            let budget = self.store.get_budget(budget_id)?;
            let mut report = ImportReport::new(&budget.original_identifier, Upserted::Unchanged);
            self.import_rows(budget_id, rows, &mut report)?;
            Ok(report)
        })
    }

    fn in_transaction(
        &self,
        body: impl FnOnce() -> Result<ImportReport, ImportError>,
    ) -> Result<ImportReport, ImportError> {
        let tx = self.store.begin_transaction()?;
        match body() {
            Ok(report) => {
                self.store.commit_transaction(tx)?;
                tracing::info!(
                    batch_id = %report.batch_id,
                    budget = %report.budget_identifier,
                    created = report.created,
                    updated = report.updated,
                    skipped = report.skipped,
                    failed = report.failed,
                    "import batch committed"
                );
                Ok(report)
            }
            Err(e) => {
                if let Err(rollback_err) = self.store.rollback_transaction(tx) {
                    tracing::error!(error = %rollback_err, "rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Resolves document-level dimension definitions in declaration order.
    /// A definition that fails to resolve is recorded and skipped; rows that
    /// reference it later fail on their own.
    fn import_dimensions(
        &self,
        dimensions: &[DimensionSpec],
        report: &mut ImportReport,
    ) -> Result<(), ImportError> {
        let resolver = DimensionResolver::new(self.store);
        for spec in dimensions {
            match resolver.resolve(spec) {
                Ok(_) => {}
                Err(crate::resolver::ResolveError::Storage(e)) => return Err(e.into()),
                Err(e) => {
                    let identifier = format!("{}:{}", spec.kind, spec.identifier);
                    record_failure(report, &identifier, &e.to_string());
                }
            }
        }
        Ok(())
    }

    fn import_rows(
        &self,
        budget_id: BudgetId,
        rows: &[ExpenseRow],
        report: &mut ImportReport,
    ) -> Result<(), ImportError> {
        let resolver = DimensionResolver::new(self.store);

        for row in rows {
            if let Err(reason) = validate_row(row) {
                record_failure(report, &row.original_identifier, &reason);
                continue;
            }

            let mut dimension_ids = Vec::with_capacity(row.dimensions.len());
            let mut row_error = None;
            for spec in &row.dimensions {
                match resolver.resolve(spec) {
                    Ok((dim, _)) => dimension_ids.push(dim.id),
                    Err(crate::resolver::ResolveError::Storage(e)) => return Err(e.into()),
                    Err(e) => {
                        row_error = Some(e.to_string());
                        break;
                    }
                }
            }
            if let Some(reason) = row_error {
                record_failure(report, &row.original_identifier, &reason);
                continue;
            }

            let (expense_id, outcome) = self.store.upsert_expense(&ExpenseUpsert {
                budget_id,
                original_identifier: row.original_identifier.clone(),
                value: row.value,
            })?;
            self.store
                .set_expense_dimensions(expense_id, &dimension_ids)?;

            match outcome {
                Upserted::Created => report.created += 1,
                Upserted::Updated => report.updated += 1,
                Upserted::Unchanged => report.skipped += 1,
            }
        }
        Ok(())
    }
}

fn record_failure(report: &mut ImportReport, identifier: &str, reason: &str) {
    tracing::warn!(identifier, reason, "row skipped");
    report.failed += 1;
    report.failures.push(RowFailure {
        identifier: identifier.to_string(),
        reason: reason.to_string(),
    });
}

fn validate_row(row: &ExpenseRow) -> Result<(), String> {
    if row.original_identifier.is_empty() {
        return Err("missing row identifier".to_string());
    }
    if !row.value.is_finite() {
        return Err(format!("value is not a number: {}", row.value));
    }
    if row.value < 0.0 {
        return Err(format!("negative value: {}", row.value));
    }
    Ok(())
}

fn validate_budget(cmd: &BudgetUpsert) -> Result<(), ImportError> {
    let invalid = |reason: String| ImportError::InvalidBudget {
        identifier: cmd.original_identifier.clone(),
        reason,
    };
    if cmd.original_identifier.is_empty() {
        return Err(invalid("missing identifier".to_string()));
    }
    validate_period_date("published_at", cmd.published_at).map_err(&invalid)?;
    if let Some(planned_at) = cmd.planned_at {
        validate_period_date("planned_at", planned_at).map_err(&invalid)?;
    }
    Ok(())
}

/// Period dates are first-of-month markers and never in the future.
fn validate_period_date(field: &str, date: Date) -> Result<(), String> {
    if date.day() != 1 {
        return Err(format!("{field} must be the first day of a month, got {date}"));
    }
    if date > OffsetDateTime::now_utc().date() {
        return Err(format!("{field} must not be in the future, got {date}"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BudgetScope, BudgetType, DimensionKind};
    use crate::storage::InMemoryStorage;
    use time::macros::date;

    fn law_budget(identifier: &str) -> BudgetUpsert {
        BudgetUpsert {
            original_identifier: identifier.to_string(),
            name: "Federal Budget Law".to_string(),
            name_translated: None,
            description: None,
            description_translated: None,
            budget_type: BudgetType::Law,
            scope: BudgetScope::Quarterly,
            published_at: date!(2024 - 01 - 01),
            planned_at: None,
        }
    }

    fn tagged_row(identifier: &str, value: f64, ministry: &str, expense_type: &str) -> ExpenseRow {
        ExpenseRow {
            original_identifier: identifier.to_string(),
            value,
            dimensions: vec![
                DimensionSpec::new(DimensionKind::Ministry, ministry, format!("Ministry {ministry}")),
                DimensionSpec::new(
                    DimensionKind::ExpenseType,
                    expense_type,
                    format!("Expense type {expense_type}"),
                ),
            ],
        }
    }

    #[test]
    fn import_twice_is_idempotent() {
        let store = InMemoryStorage::new();
        let pipeline = ImportPipeline::new(&store);
        let doc = BudgetDocument {
            budget: law_budget("LAW-2024"),
            dimensions: vec![],
            rows: vec![
                tagged_row("row-1", 100.0, "001", "200"),
                tagged_row("row-2", 50.0, "001", "300"),
            ],
        };

        let first = pipeline.import_budget(&doc).unwrap();
        assert_eq!(first.created, 2);
        assert_eq!(first.failed, 0);

        let second = pipeline.import_budget(&doc).unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.updated, 0);
        assert_eq!(second.skipped, 2);
        assert_eq!(second.budget_outcome, "unchanged");

        let budget = store
            .find_budget("LAW-2024", BudgetType::Law, BudgetScope::Quarterly)
            .unwrap()
            .unwrap();
        assert_eq!(store.expenses_for_budget(budget.id).unwrap().len(), 2);
    }

    #[test]
    fn one_bad_row_does_not_abort_the_batch() {
        let store = InMemoryStorage::new();
        let pipeline = ImportPipeline::new(&store);

        let mut rows: Vec<ExpenseRow> = (0..10)
            .map(|i| tagged_row(&format!("row-{i}"), 10.0 * i as f64, "001", "200"))
            .collect();
        // Row 5 references a parent no row has defined.
        rows[5].dimensions = vec![DimensionSpec::new(
            DimensionKind::SubChapter,
            "01-1",
            "Orphan",
        )
        .with_parent(DimensionKind::Chapter, "99")];

        let report = pipeline
            .import_budget(&BudgetDocument {
                budget: law_budget("LAW-2024"),
                dimensions: vec![],
                rows,
            })
            .unwrap();

        assert_eq!(report.created, 9);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].identifier, "row-5");
        assert!(report.failures[0].reason.contains("CHAPTER:99"));

        let budget = store
            .find_budget("LAW-2024", BudgetType::Law, BudgetScope::Quarterly)
            .unwrap()
            .unwrap();
        assert_eq!(store.expenses_for_budget(budget.id).unwrap().len(), 9);
    }

    #[test]
    fn negative_and_nan_values_fail_the_row() {
        let store = InMemoryStorage::new();
        let pipeline = ImportPipeline::new(&store);
        let report = pipeline
            .import_budget(&BudgetDocument {
                budget: law_budget("LAW-2024"),
                dimensions: vec![],
                rows: vec![
                    tagged_row("row-1", -5.0, "001", "200"),
                    tagged_row("row-2", f64::NAN, "001", "200"),
                    tagged_row("row-3", 5.0, "001", "200"),
                ],
            })
            .unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.failed, 2);
    }

    #[test]
    fn reimport_replaces_dimension_links() {
        let store = InMemoryStorage::new();
        let pipeline = ImportPipeline::new(&store);

        let doc = BudgetDocument {
            budget: law_budget("LAW-2024"),
            dimensions: vec![],
            rows: vec![tagged_row("row-1", 100.0, "001", "200")],
        };
        pipeline.import_budget(&doc).unwrap();

        let retagged = BudgetDocument {
            budget: law_budget("LAW-2024"),
            dimensions: vec![],
            rows: vec![tagged_row("row-1", 100.0, "002", "300")],
        };
        pipeline.import_budget(&retagged).unwrap();

        let budget = store
            .find_budget("LAW-2024", BudgetType::Law, BudgetScope::Quarterly)
            .unwrap()
            .unwrap();
        let expenses = store.expenses_for_budget(budget.id).unwrap();
        assert_eq!(expenses.len(), 1);
        let dims = store.expense_dimensions(expenses[0].id).unwrap();
        assert_eq!(dims.len(), 2);
        for dim_id in dims {
            let dim = store.get_dimension(dim_id).unwrap();
            assert!(matches!(dim.original_identifier.as_str(), "002" | "300"));
        }
    }

    #[test]
    fn rows_can_reference_document_dimensions() {
        let store = InMemoryStorage::new();
        let pipeline = ImportPipeline::new(&store);

        let report = pipeline
            .import_budget(&BudgetDocument {
                budget: law_budget("LAW-2024"),
                dimensions: vec![
                    DimensionSpec::new(DimensionKind::Chapter, "02", "National Defense"),
                    DimensionSpec::new(DimensionKind::SubChapter, "0201", "Armed Forces")
                        .with_parent(DimensionKind::Chapter, "02"),
                ],
                rows: vec![ExpenseRow {
                    original_identifier: "row-1".to_string(),
                    value: 42.0,
                    dimensions: vec![
                        DimensionSpec::reference(DimensionKind::Chapter, "02"),
                        DimensionSpec::reference(DimensionKind::SubChapter, "0201"),
                    ],
                }],
            })
            .unwrap();

        assert_eq!(report.created, 1);
        assert_eq!(report.failed, 0);

        let sub = store
            .find_dimension(&DimensionKind::SubChapter, "0201")
            .unwrap()
            .unwrap();
        let chapter = store
            .find_dimension(&DimensionKind::Chapter, "02")
            .unwrap()
            .unwrap();
        assert_eq!(sub.parent_id, Some(chapter.id));
    }

    #[test]
    fn invalid_budget_dates_are_structural() {
        let store = InMemoryStorage::new();
        let pipeline = ImportPipeline::new(&store);

        let mut mid_month = law_budget("LAW-2024");
        mid_month.published_at = date!(2024 - 01 - 15);
        assert!(matches!(
            pipeline.import_budget(&BudgetDocument {
                budget: mid_month,
                dimensions: vec![],
                rows: vec![]
            }),
            Err(ImportError::InvalidBudget { .. })
        ));

        let mut future = law_budget("LAW-2091");
        future.published_at = date!(2091 - 01 - 01);
        assert!(matches!(
            pipeline.import_budget(&BudgetDocument {
                budget: future,
                dimensions: vec![],
                rows: vec![]
            }),
            Err(ImportError::InvalidBudget { .. })
        ));

        assert!(store.list_budgets(None).unwrap().is_empty());
    }

    #[test]
    fn import_expenses_into_missing_budget_aborts() {
        let store = InMemoryStorage::new();
        let pipeline = ImportPipeline::new(&store);
        assert!(matches!(
            pipeline.import_expenses(404, &[tagged_row("row-1", 1.0, "001", "200")]),
            Err(ImportError::Storage(StorageError::BudgetNotFound(404)))
        ));
    }
}
