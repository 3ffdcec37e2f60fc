use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, RwLock,
    },
};

use thiserror::Error;
use time::{Date, OffsetDateTime};

use crate::models::{
    write::{BudgetUpsert, DimensionUpsert, ExpenseUpsert, RateWindowUpsert},
    Budget, BudgetId, BudgetScope, BudgetType, Dimension, DimensionId, DimensionKind, Expense,
    ExpenseId, RateWindow,
};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{0}")]
    Other(String),
    #[error("budget not found: {0}")]
    BudgetNotFound(BudgetId),
    #[error("dimension not found: {0}")]
    DimensionNotFound(DimensionId),
    #[error("expense not found: {0}")]
    ExpenseNotFound(ExpenseId),
    #[error("no active transaction")]
    NoActiveTransaction,
    #[error("a transaction is already active")]
    TransactionAlreadyActive,
}

pub type TransactionId = u64;

/// Outcome of an insert-or-update operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upserted {
    Created,
    Updated,
    /// Row already existed with identical field values; `updated_at` was
    /// left untouched.
    Unchanged,
}

/// Transactional store for the budget graph.
///
/// All upserts are keyed on the entity's uniqueness constraint and handle
/// conflicts natively rather than check-then-insert, so re-running a batch
/// is safe and concurrent rows referencing the same new dimension cannot
/// race each other into duplicates.
pub trait StorageBackend: Send + Sync {
    // Budgets
    fn upsert_budget(&self, cmd: &BudgetUpsert) -> Result<(BudgetId, Upserted), StorageError>;
    fn find_budget(
        &self,
        original_identifier: &str,
        budget_type: BudgetType,
        scope: BudgetScope,
    ) -> Result<Option<Budget>, StorageError>;
    fn get_budget(&self, id: BudgetId) -> Result<Budget, StorageError>;
    fn list_budgets(&self, budget_type: Option<BudgetType>) -> Result<Vec<Budget>, StorageError>;
    /// Maintenance operation. Cascades to the budget's expenses and their
    /// dimension associations; dimensions themselves survive.
    fn delete_budget(&self, id: BudgetId) -> Result<(), StorageError>;

    // Dimensions
    fn upsert_dimension(
        &self,
        cmd: &DimensionUpsert,
    ) -> Result<(DimensionId, Upserted), StorageError>;
    fn find_dimension(
        &self,
        kind: &DimensionKind,
        original_identifier: &str,
    ) -> Result<Option<Dimension>, StorageError>;
    fn get_dimension(&self, id: DimensionId) -> Result<Dimension, StorageError>;
    fn untranslated_dimension_names(&self) -> Result<Vec<String>, StorageError>;
    /// Stamps `translated` onto every dimension named `name` whose current
    /// translation is missing or different. Returns the number of rows
    /// touched.
    fn set_dimension_translation(&self, name: &str, translated: &str)
        -> Result<usize, StorageError>;

    // Expenses
    fn upsert_expense(&self, cmd: &ExpenseUpsert) -> Result<(ExpenseId, Upserted), StorageError>;
    /// Replaces the expense's dimension association set. Set-replace, not
    /// append: stale links from a previous import must not survive.
    fn set_expense_dimensions(
        &self,
        expense_id: ExpenseId,
        dimension_ids: &[DimensionId],
    ) -> Result<(), StorageError>;
    fn expense_dimensions(&self, expense_id: ExpenseId) -> Result<Vec<DimensionId>, StorageError>;
    fn expenses_for_budget(&self, budget_id: BudgetId) -> Result<Vec<Expense>, StorageError>;

    // Conversion rates
    fn upsert_rate_window(&self, cmd: &RateWindowUpsert) -> Result<Upserted, StorageError>;
    /// All windows for `pair` whose `[started_at, ended_at)` range contains
    /// `on`. More than one result signals overlapping windows, which the
    /// rate resolver surfaces as a data-integrity failure.
    fn rate_windows_at(&self, pair: &str, on: Date) -> Result<Vec<RateWindow>, StorageError>;

    fn begin_transaction(&self) -> Result<TransactionId, StorageError>;
    fn commit_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError>;
    fn rollback_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError>;
}

#[derive(Clone, Default)]
struct Tables {
    budgets: BTreeMap<BudgetId, Budget>,
    dimensions: BTreeMap<DimensionId, Dimension>,
    expenses: BTreeMap<ExpenseId, Expense>,
    expense_dimensions: BTreeMap<ExpenseId, Vec<DimensionId>>,
    rates: Vec<RateWindow>,
    next_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Reference backend holding everything in process memory.
///
/// Rollback works by snapshotting the full table set at `begin_transaction`
/// and restoring it on rollback, mirroring the single-writer batch model:
/// only one transaction is active at a time.
pub struct InMemoryStorage {
    tables: RwLock<Tables>,
    tx_counter: AtomicU64,
    snapshot: Mutex<Option<(TransactionId, Tables)>>,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            tx_counter: AtomicU64::new(1),
            snapshot: Mutex::new(None),
        }
    }
}

fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

impl StorageBackend for InMemoryStorage {
    fn upsert_budget(&self, cmd: &BudgetUpsert) -> Result<(BudgetId, Upserted), StorageError> {
        let mut tables = self.tables.write().unwrap();
        let existing = tables.budgets.values().find(|b| {
            b.original_identifier == cmd.original_identifier
                && b.budget_type == cmd.budget_type
                && b.scope == cmd.scope
        });

        if let Some(existing) = existing {
            let id = existing.id;
            let unchanged = existing.name == cmd.name
                && existing.name_translated == cmd.name_translated
                && existing.description == cmd.description
                && existing.description_translated == cmd.description_translated
                && existing.published_at == cmd.published_at
                && existing.planned_at == cmd.planned_at;
            if unchanged {
                return Ok((id, Upserted::Unchanged));
            }
            let budget = tables.budgets.get_mut(&id).unwrap();
            budget.name = cmd.name.clone();
            budget.name_translated = cmd.name_translated.clone();
            budget.description = cmd.description.clone();
            budget.description_translated = cmd.description_translated.clone();
            budget.published_at = cmd.published_at;
            budget.planned_at = cmd.planned_at;
            budget.updated_at = Some(now());
            return Ok((id, Upserted::Updated));
        }

        let id = tables.next_id();
        tables.budgets.insert(
            id,
            Budget {
                id,
                original_identifier: cmd.original_identifier.clone(),
                name: cmd.name.clone(),
                name_translated: cmd.name_translated.clone(),
                description: cmd.description.clone(),
                description_translated: cmd.description_translated.clone(),
                budget_type: cmd.budget_type,
                scope: cmd.scope,
                published_at: cmd.published_at,
                planned_at: cmd.planned_at,
                created_at: now(),
                updated_at: None,
            },
        );
        Ok((id, Upserted::Created))
    }

    fn find_budget(
        &self,
        original_identifier: &str,
        budget_type: BudgetType,
        scope: BudgetScope,
    ) -> Result<Option<Budget>, StorageError> {
        let tables = self.tables.read().unwrap();
        Ok(tables
            .budgets
            .values()
            .find(|b| {
                b.original_identifier == original_identifier
                    && b.budget_type == budget_type
                    && b.scope == scope
            })
            .cloned())
    }

    fn get_budget(&self, id: BudgetId) -> Result<Budget, StorageError> {
        let tables = self.tables.read().unwrap();
        tables
            .budgets
            .get(&id)
            .cloned()
            .ok_or(StorageError::BudgetNotFound(id))
    }

    fn list_budgets(&self, budget_type: Option<BudgetType>) -> Result<Vec<Budget>, StorageError> {
        let tables = self.tables.read().unwrap();
        Ok(tables
            .budgets
            .values()
            .filter(|b| budget_type.map_or(true, |t| b.budget_type == t))
            .cloned()
            .collect())
    }

    fn delete_budget(&self, id: BudgetId) -> Result<(), StorageError> {
        let mut tables = self.tables.write().unwrap();
        if tables.budgets.remove(&id).is_none() {
            return Err(StorageError::BudgetNotFound(id));
        }
        let orphaned: Vec<ExpenseId> = tables
            .expenses
            .values()
            .filter(|e| e.budget_id == id)
            .map(|e| e.id)
            .collect();
        for expense_id in orphaned {
            tables.expenses.remove(&expense_id);
            tables.expense_dimensions.remove(&expense_id);
        }
        Ok(())
    }

    fn upsert_dimension(
        &self,
        cmd: &DimensionUpsert,
    ) -> Result<(DimensionId, Upserted), StorageError> {
        let mut tables = self.tables.write().unwrap();
        let existing = tables
            .dimensions
            .values()
            .find(|d| d.kind == cmd.kind && d.original_identifier == cmd.original_identifier);

        if let Some(existing) = existing {
            let id = existing.id;
            let translation_changes = cmd
                .name_translated
                .as_ref()
                .map_or(false, |t| existing.name_translated.as_deref() != Some(t));
            let unchanged = existing.name == cmd.name
                && existing.parent_id == cmd.parent_id
                && !translation_changes;
            if unchanged {
                return Ok((id, Upserted::Unchanged));
            }
            let dim = tables.dimensions.get_mut(&id).unwrap();
            dim.name = cmd.name.clone();
            dim.parent_id = cmd.parent_id;
            if let Some(translated) = &cmd.name_translated {
                dim.name_translated = Some(translated.clone());
            }
            dim.updated_at = Some(now());
            return Ok((id, Upserted::Updated));
        }

        let id = tables.next_id();
        tables.dimensions.insert(
            id,
            Dimension {
                id,
                parent_id: cmd.parent_id,
                original_identifier: cmd.original_identifier.clone(),
                kind: cmd.kind.clone(),
                name: cmd.name.clone(),
                name_translated: cmd.name_translated.clone(),
                created_at: now(),
                updated_at: None,
            },
        );
        Ok((id, Upserted::Created))
    }

    fn find_dimension(
        &self,
        kind: &DimensionKind,
        original_identifier: &str,
    ) -> Result<Option<Dimension>, StorageError> {
        let tables = self.tables.read().unwrap();
        Ok(tables
            .dimensions
            .values()
            .find(|d| &d.kind == kind && d.original_identifier == original_identifier)
            .cloned())
    }

    fn get_dimension(&self, id: DimensionId) -> Result<Dimension, StorageError> {
        let tables = self.tables.read().unwrap();
        tables
            .dimensions
            .get(&id)
            .cloned()
            .ok_or(StorageError::DimensionNotFound(id))
    }

    fn untranslated_dimension_names(&self) -> Result<Vec<String>, StorageError> {
        let tables = self.tables.read().unwrap();
        let mut names: Vec<String> = tables
            .dimensions
            .values()
            .filter(|d| d.name_translated.is_none())
            .map(|d| d.name.clone())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn set_dimension_translation(
        &self,
        name: &str,
        translated: &str,
    ) -> Result<usize, StorageError> {
        let mut tables = self.tables.write().unwrap();
        let mut touched = 0;
        for dim in tables.dimensions.values_mut() {
            if dim.name == name && dim.name_translated.as_deref() != Some(translated) {
                dim.name_translated = Some(translated.to_string());
                dim.updated_at = Some(now());
                touched += 1;
            }
        }
        Ok(touched)
    }

    fn upsert_expense(&self, cmd: &ExpenseUpsert) -> Result<(ExpenseId, Upserted), StorageError> {
        let mut tables = self.tables.write().unwrap();
        if !tables.budgets.contains_key(&cmd.budget_id) {
            return Err(StorageError::BudgetNotFound(cmd.budget_id));
        }
        let existing = tables.expenses.values().find(|e| {
            e.budget_id == cmd.budget_id && e.original_identifier == cmd.original_identifier
        });

        if let Some(existing) = existing {
            let id = existing.id;
            if existing.value == cmd.value {
                return Ok((id, Upserted::Unchanged));
            }
            let expense = tables.expenses.get_mut(&id).unwrap();
            expense.value = cmd.value;
            expense.updated_at = Some(now());
            return Ok((id, Upserted::Updated));
        }

        let id = tables.next_id();
        tables.expenses.insert(
            id,
            Expense {
                id,
                budget_id: cmd.budget_id,
                original_identifier: cmd.original_identifier.clone(),
                value: cmd.value,
                created_at: now(),
                updated_at: None,
            },
        );
        Ok((id, Upserted::Created))
    }

    fn set_expense_dimensions(
        &self,
        expense_id: ExpenseId,
        dimension_ids: &[DimensionId],
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.write().unwrap();
        if !tables.expenses.contains_key(&expense_id) {
            return Err(StorageError::ExpenseNotFound(expense_id));
        }
        for dim_id in dimension_ids {
            if !tables.dimensions.contains_key(dim_id) {
                return Err(StorageError::DimensionNotFound(*dim_id));
            }
        }
        let mut ids = dimension_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();
        tables.expense_dimensions.insert(expense_id, ids);
        Ok(())
    }

    fn expense_dimensions(&self, expense_id: ExpenseId) -> Result<Vec<DimensionId>, StorageError> {
        let tables = self.tables.read().unwrap();
        if !tables.expenses.contains_key(&expense_id) {
            return Err(StorageError::ExpenseNotFound(expense_id));
        }
        Ok(tables
            .expense_dimensions
            .get(&expense_id)
            .cloned()
            .unwrap_or_default())
    }

    fn expenses_for_budget(&self, budget_id: BudgetId) -> Result<Vec<Expense>, StorageError> {
        let tables = self.tables.read().unwrap();
        if !tables.budgets.contains_key(&budget_id) {
            return Err(StorageError::BudgetNotFound(budget_id));
        }
        Ok(tables
            .expenses
            .values()
            .filter(|e| e.budget_id == budget_id)
            .cloned()
            .collect())
    }

    fn upsert_rate_window(&self, cmd: &RateWindowUpsert) -> Result<Upserted, StorageError> {
        let mut tables = self.tables.write().unwrap();
        if let Some(existing) = tables
            .rates
            .iter_mut()
            .find(|w| w.pair == cmd.pair && w.started_at == cmd.started_at)
        {
            if existing.rate == cmd.rate && existing.ended_at == cmd.ended_at {
                return Ok(Upserted::Unchanged);
            }
            existing.rate = cmd.rate;
            existing.ended_at = cmd.ended_at;
            return Ok(Upserted::Updated);
        }
        tables.rates.push(RateWindow {
            pair: cmd.pair.clone(),
            rate: cmd.rate,
            started_at: cmd.started_at,
            ended_at: cmd.ended_at,
        });
        Ok(Upserted::Created)
    }

    fn rate_windows_at(&self, pair: &str, on: Date) -> Result<Vec<RateWindow>, StorageError> {
        let tables = self.tables.read().unwrap();
        Ok(tables
            .rates
            .iter()
            .filter(|w| w.pair == pair && w.contains(on))
            .cloned()
            .collect())
    }

    fn begin_transaction(&self) -> Result<TransactionId, StorageError> {
        let mut slot = self.snapshot.lock().unwrap();
        if slot.is_some() {
            return Err(StorageError::TransactionAlreadyActive);
        }
        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        *slot = Some((tx_id, self.tables.read().unwrap().clone()));
        tracing::debug!(tx_id, "transaction started");
        Ok(tx_id)
    }

    fn commit_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError> {
        let mut slot = self.snapshot.lock().unwrap();
        match slot.take() {
            Some((id, _)) if id == tx_id => {
                tracing::debug!(tx_id, "transaction committed");
                Ok(())
            }
            other => {
                *slot = other;
                Err(StorageError::NoActiveTransaction)
            }
        }
    }

    fn rollback_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError> {
        let mut slot = self.snapshot.lock().unwrap();
        match slot.take() {
            Some((id, snapshot)) if id == tx_id => {
                *self.tables.write().unwrap() = snapshot;
                tracing::debug!(tx_id, "transaction rolled back");
                Ok(())
            }
            other => {
                *slot = other;
                Err(StorageError::NoActiveTransaction)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    fn law_2024() -> BudgetUpsert {
        BudgetUpsert {
            original_identifier: "LAW-2024".to_string(),
            name: "Federal Budget Law".to_string(),
            name_translated: None,
            description: Some("Federal Budget Law 2024".to_string()),
            description_translated: None,
            budget_type: BudgetType::Law,
            scope: BudgetScope::Quarterly,
            published_at: date!(2024 - 01 - 01),
            planned_at: None,
        }
    }

    #[test]
    fn budget_upsert_is_keyed_on_identifier_type_scope() {
        let store = InMemoryStorage::new();
        let (id, outcome) = store.upsert_budget(&law_2024()).unwrap();
        assert_eq!(outcome, Upserted::Created);

        let (id2, outcome) = store.upsert_budget(&law_2024()).unwrap();
        assert_eq!(id, id2);
        assert_eq!(outcome, Upserted::Unchanged);

        // Same identifier under a different type is a distinct budget.
        let mut total = law_2024();
        total.budget_type = BudgetType::Total;
        let (id3, outcome) = store.upsert_budget(&total).unwrap();
        assert_ne!(id, id3);
        assert_eq!(outcome, Upserted::Created);
    }

    #[test]
    fn budget_update_touches_updated_at() {
        let store = InMemoryStorage::new();
        let (id, _) = store.upsert_budget(&law_2024()).unwrap();
        assert!(store.get_budget(id).unwrap().updated_at.is_none());

        let mut cmd = law_2024();
        cmd.name = "Amended Budget Law".to_string();
        let (_, outcome) = store.upsert_budget(&cmd).unwrap();
        assert_eq!(outcome, Upserted::Updated);
        let budget = store.get_budget(id).unwrap();
        assert_eq!(budget.name, "Amended Budget Law");
        assert!(budget.updated_at.is_some());
    }

    #[test]
    fn unchanged_upsert_leaves_updated_at_untouched() {
        let store = InMemoryStorage::new();
        let (budget_id, _) = store.upsert_budget(&law_2024()).unwrap();
        let dim_cmd = DimensionUpsert {
            kind: DimensionKind::Ministry,
            original_identifier: "001".to_string(),
            name: "Defense".to_string(),
            name_translated: None,
            parent_id: None,
        };
        let (dim_id, _) = store.upsert_dimension(&dim_cmd).unwrap();
        let expense_cmd = ExpenseUpsert {
            budget_id,
            original_identifier: "row-1".to_string(),
            value: 100.0,
        };
        let (expense_id, _) = store.upsert_expense(&expense_cmd).unwrap();

        let (_, outcome) = store.upsert_budget(&law_2024()).unwrap();
        assert_eq!(outcome, Upserted::Unchanged);
        assert!(store.get_budget(budget_id).unwrap().updated_at.is_none());

        let (_, outcome) = store.upsert_dimension(&dim_cmd).unwrap();
        assert_eq!(outcome, Upserted::Unchanged);
        assert!(store.get_dimension(dim_id).unwrap().updated_at.is_none());

        let (_, outcome) = store.upsert_expense(&expense_cmd).unwrap();
        assert_eq!(outcome, Upserted::Unchanged);
        let expense = store
            .expenses_for_budget(budget_id)
            .unwrap()
            .into_iter()
            .find(|e| e.id == expense_id)
            .unwrap();
        assert!(expense.updated_at.is_none());
    }

    #[test]
    fn second_transaction_is_refused_while_one_is_active() {
        let store = InMemoryStorage::new();
        let tx = store.begin_transaction().unwrap();
        assert!(matches!(
            store.begin_transaction(),
            Err(StorageError::TransactionAlreadyActive)
        ));
        store.commit_transaction(tx).unwrap();

        // Committing frees the slot for the next batch.
        let tx = store.begin_transaction().unwrap();
        store.rollback_transaction(tx).unwrap();
    }

    #[test]
    fn delete_budget_cascades_to_expenses() {
        let store = InMemoryStorage::new();
        let (budget_id, _) = store.upsert_budget(&law_2024()).unwrap();
        let (dim_id, _) = store
            .upsert_dimension(&DimensionUpsert {
                kind: DimensionKind::Ministry,
                original_identifier: "001".to_string(),
                name: "Defense".to_string(),
                name_translated: None,
                parent_id: None,
            })
            .unwrap();
        let (expense_id, _) = store
            .upsert_expense(&ExpenseUpsert {
                budget_id,
                original_identifier: "row-1".to_string(),
                value: 100.0,
            })
            .unwrap();
        store.set_expense_dimensions(expense_id, &[dim_id]).unwrap();

        store.delete_budget(budget_id).unwrap();
        assert!(matches!(
            store.expense_dimensions(expense_id),
            Err(StorageError::ExpenseNotFound(_))
        ));
        // The dimension survives the cascade.
        assert!(store
            .find_dimension(&DimensionKind::Ministry, "001")
            .unwrap()
            .is_some());
    }

    #[test]
    fn expense_dimension_set_is_replaced_not_appended() {
        let store = InMemoryStorage::new();
        let (budget_id, _) = store.upsert_budget(&law_2024()).unwrap();
        let mut dims = Vec::new();
        for code in ["001", "002", "003"] {
            let (id, _) = store
                .upsert_dimension(&DimensionUpsert {
                    kind: DimensionKind::Ministry,
                    original_identifier: code.to_string(),
                    name: format!("Ministry {code}"),
                    name_translated: None,
                    parent_id: None,
                })
                .unwrap();
            dims.push(id);
        }
        let (expense_id, _) = store
            .upsert_expense(&ExpenseUpsert {
                budget_id,
                original_identifier: "row-1".to_string(),
                value: 10.0,
            })
            .unwrap();

        store
            .set_expense_dimensions(expense_id, &[dims[0], dims[1]])
            .unwrap();
        store
            .set_expense_dimensions(expense_id, &[dims[2]])
            .unwrap();
        assert_eq!(store.expense_dimensions(expense_id).unwrap(), vec![dims[2]]);
    }

    #[test]
    fn rollback_restores_pre_transaction_state() {
        let store = InMemoryStorage::new();
        let (kept_id, _) = store.upsert_budget(&law_2024()).unwrap();

        let tx = store.begin_transaction().unwrap();
        let mut draft = law_2024();
        draft.budget_type = BudgetType::Draft;
        store.upsert_budget(&draft).unwrap();
        store.rollback_transaction(tx).unwrap();

        assert_eq!(store.list_budgets(None).unwrap().len(), 1);
        assert!(store.get_budget(kept_id).is_ok());
    }

    #[test]
    fn commit_without_begin_fails() {
        let store = InMemoryStorage::new();
        assert!(matches!(
            store.commit_transaction(42),
            Err(StorageError::NoActiveTransaction)
        ));
    }

    #[test]
    fn rate_windows_keyed_on_pair_and_start() {
        let store = InMemoryStorage::new();
        let cmd = RateWindowUpsert {
            pair: "RUB_USD".to_string(),
            rate: 90.0,
            started_at: Some(date!(2024 - 01 - 01)),
            ended_at: Some(date!(2024 - 03 - 01)),
        };
        assert_eq!(store.upsert_rate_window(&cmd).unwrap(), Upserted::Created);
        assert_eq!(store.upsert_rate_window(&cmd).unwrap(), Upserted::Unchanged);

        let revised = RateWindowUpsert { rate: 91.0, ..cmd };
        assert_eq!(
            store.upsert_rate_window(&revised).unwrap(),
            Upserted::Updated
        );
        let windows = store
            .rate_windows_at("RUB_USD", date!(2024 - 02 - 01))
            .unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].rate, 91.0);
    }
}
