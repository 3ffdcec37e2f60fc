use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};

use rusqlite::{params, Connection, OptionalExtension, Row};
use time::{format_description::well_known::Rfc3339, Date, Month, OffsetDateTime};

use crate::models::{
    write::{BudgetUpsert, DimensionUpsert, ExpenseUpsert, RateWindowUpsert},
    Budget, BudgetId, BudgetScope, BudgetType, Dimension, DimensionId, DimensionKind, Expense,
    ExpenseId, RateWindow,
};
use crate::storage::{StorageBackend, StorageError, TransactionId, Upserted};

/// Durable backend over SQLite.
///
/// One connection guarded by a mutex: the import pipeline is a single-writer
/// batch process, and readers go through the same handle. Conflict-handling
/// upserts ride on the UNIQUE constraints declared in the schema.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    tx_counter: AtomicU64,
    active_tx: Mutex<Option<TransactionId>>,
}

impl SqliteStorage {
    pub fn new(path: &str) -> Result<Self, StorageError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(other)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(other)?;

        let storage = Self {
            conn: Mutex::new(conn),
            tx_counter: AtomicU64::new(1),
            active_tx: Mutex::new(None),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS budgets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                original_identifier TEXT NOT NULL,
                name TEXT NOT NULL,
                name_translated TEXT,
                description TEXT,
                description_translated TEXT,
                budget_type TEXT NOT NULL,
                scope TEXT NOT NULL,
                published_at TEXT NOT NULL,
                planned_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT,
                UNIQUE (original_identifier, budget_type, scope)
            );

            CREATE TABLE IF NOT EXISTS dimensions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                parent_id INTEGER REFERENCES dimensions(id) ON DELETE SET NULL,
                original_identifier TEXT NOT NULL,
                kind TEXT NOT NULL,
                name TEXT NOT NULL,
                name_translated TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT,
                UNIQUE (kind, original_identifier)
            );

            CREATE TABLE IF NOT EXISTS expenses (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                budget_id INTEGER NOT NULL REFERENCES budgets(id) ON DELETE CASCADE,
                original_identifier TEXT NOT NULL,
                value REAL NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT,
                UNIQUE (budget_id, original_identifier)
            );

            CREATE TABLE IF NOT EXISTS expense_dimensions (
                expense_id INTEGER NOT NULL REFERENCES expenses(id) ON DELETE CASCADE,
                dimension_id INTEGER NOT NULL REFERENCES dimensions(id) ON DELETE CASCADE,
                PRIMARY KEY (expense_id, dimension_id)
            );

            CREATE TABLE IF NOT EXISTS conversion_rates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pair TEXT NOT NULL,
                rate REAL NOT NULL,
                started_at TEXT,
                ended_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT,
                UNIQUE (pair, started_at)
            );

            CREATE INDEX IF NOT EXISTS idx_budgets_identifier
                ON budgets(original_identifier);

            CREATE INDEX IF NOT EXISTS idx_dimensions_lookup
                ON dimensions(kind, original_identifier);

            CREATE INDEX IF NOT EXISTS idx_expenses_budget
                ON expenses(budget_id);

            CREATE INDEX IF NOT EXISTS idx_rates_pair
                ON conversion_rates(pair, started_at);
            ",
        )
        .map_err(other)?;
        Ok(())
    }
}

fn other(e: impl ToString) -> StorageError {
    StorageError::Other(e.to_string())
}

fn date_to_str(d: Date) -> String {
    format!("{:04}-{:02}-{:02}", d.year(), d.month() as u8, d.day())
}

fn str_to_date(s: &str) -> Result<Date, StorageError> {
    let mut parts = s.splitn(3, '-');
    let year = parts
        .next()
        .and_then(|p| p.parse::<i32>().ok())
        .ok_or_else(|| other(format!("bad date: {s}")))?;
    let month = parts
        .next()
        .and_then(|p| p.parse::<u8>().ok())
        .and_then(|m| Month::try_from(m).ok())
        .ok_or_else(|| other(format!("bad date: {s}")))?;
    let day = parts
        .next()
        .and_then(|p| p.parse::<u8>().ok())
        .ok_or_else(|| other(format!("bad date: {s}")))?;
    Date::from_calendar_date(year, month, day).map_err(other)
}

fn now_str() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| String::new())
}

fn parse_timestamp(s: &str) -> Result<OffsetDateTime, StorageError> {
    OffsetDateTime::parse(s, &Rfc3339).map_err(other)
}

fn budget_from_row(row: &Row<'_>) -> Result<Budget, rusqlite::Error> {
    Ok(Budget {
        id: row.get(0)?,
        original_identifier: row.get(1)?,
        name: row.get(2)?,
        name_translated: row.get(3)?,
        description: row.get(4)?,
        description_translated: row.get(5)?,
        budget_type: row
            .get::<_, String>(6)?
            .parse()
            .map_err(|_| rusqlite::Error::InvalidQuery)?,
        scope: row
            .get::<_, String>(7)?
            .parse()
            .map_err(|_| rusqlite::Error::InvalidQuery)?,
        published_at: str_to_date(&row.get::<_, String>(8)?)
            .map_err(|_| rusqlite::Error::InvalidQuery)?,
        planned_at: row
            .get::<_, Option<String>>(9)?
            .map(|s| str_to_date(&s))
            .transpose()
            .map_err(|_| rusqlite::Error::InvalidQuery)?,
        created_at: parse_timestamp(&row.get::<_, String>(10)?)
            .map_err(|_| rusqlite::Error::InvalidQuery)?,
        updated_at: row
            .get::<_, Option<String>>(11)?
            .map(|s| parse_timestamp(&s))
            .transpose()
            .map_err(|_| rusqlite::Error::InvalidQuery)?,
    })
}

fn dimension_from_row(row: &Row<'_>) -> Result<Dimension, rusqlite::Error> {
    Ok(Dimension {
        id: row.get(0)?,
        parent_id: row.get(1)?,
        original_identifier: row.get(2)?,
        kind: row
            .get::<_, String>(3)?
            .parse()
            .map_err(|_| rusqlite::Error::InvalidQuery)?,
        name: row.get(4)?,
        name_translated: row.get(5)?,
        created_at: parse_timestamp(&row.get::<_, String>(6)?)
            .map_err(|_| rusqlite::Error::InvalidQuery)?,
        updated_at: row
            .get::<_, Option<String>>(7)?
            .map(|s| parse_timestamp(&s))
            .transpose()
            .map_err(|_| rusqlite::Error::InvalidQuery)?,
    })
}

fn expense_from_row(row: &Row<'_>) -> Result<Expense, rusqlite::Error> {
    Ok(Expense {
        id: row.get(0)?,
        budget_id: row.get(1)?,
        original_identifier: row.get(2)?,
        value: row.get(3)?,
        created_at: parse_timestamp(&row.get::<_, String>(4)?)
            .map_err(|_| rusqlite::Error::InvalidQuery)?,
        updated_at: row
            .get::<_, Option<String>>(5)?
            .map(|s| parse_timestamp(&s))
            .transpose()
            .map_err(|_| rusqlite::Error::InvalidQuery)?,
    })
}

const BUDGET_COLS: &str = "id, original_identifier, name, name_translated, description, \
     description_translated, budget_type, scope, published_at, planned_at, created_at, updated_at";

const DIMENSION_COLS: &str =
    "id, parent_id, original_identifier, kind, name, name_translated, created_at, updated_at";

const EXPENSE_COLS: &str = "id, budget_id, original_identifier, value, created_at, updated_at";

impl StorageBackend for SqliteStorage {
    fn upsert_budget(&self, cmd: &BudgetUpsert) -> Result<(BudgetId, Upserted), StorageError> {
        let conn = self.conn.lock().unwrap();
        let existing: Option<Budget> = conn
            .query_row(
                &format!(
                    "SELECT {BUDGET_COLS} FROM budgets
                     WHERE original_identifier = ?1 AND budget_type = ?2 AND scope = ?3"
                ),
                params![
                    cmd.original_identifier,
                    cmd.budget_type.as_str(),
                    cmd.scope.as_str()
                ],
                budget_from_row,
            )
            .optional()
            .map_err(other)?;

        if let Some(existing) = &existing {
            let unchanged = existing.name == cmd.name
                && existing.name_translated == cmd.name_translated
                && existing.description == cmd.description
                && existing.description_translated == cmd.description_translated
                && existing.published_at == cmd.published_at
                && existing.planned_at == cmd.planned_at;
            if unchanged {
                return Ok((existing.id, Upserted::Unchanged));
            }
        }

        conn.execute(
            "INSERT INTO budgets (
                original_identifier, name, name_translated, description,
                description_translated, budget_type, scope, published_at, planned_at, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT (original_identifier, budget_type, scope) DO UPDATE SET
                name = excluded.name,
                name_translated = excluded.name_translated,
                description = excluded.description,
                description_translated = excluded.description_translated,
                published_at = excluded.published_at,
                planned_at = excluded.planned_at,
                updated_at = excluded.created_at",
            params![
                cmd.original_identifier,
                cmd.name,
                cmd.name_translated,
                cmd.description,
                cmd.description_translated,
                cmd.budget_type.as_str(),
                cmd.scope.as_str(),
                date_to_str(cmd.published_at),
                cmd.planned_at.map(date_to_str),
                now_str(),
            ],
        )
        .map_err(other)?;

        match existing {
            Some(b) => Ok((b.id, Upserted::Updated)),
            None => Ok((conn.last_insert_rowid(), Upserted::Created)),
        }
    }

    fn find_budget(
        &self,
        original_identifier: &str,
        budget_type: BudgetType,
        scope: BudgetScope,
    ) -> Result<Option<Budget>, StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!(
                "SELECT {BUDGET_COLS} FROM budgets
                 WHERE original_identifier = ?1 AND budget_type = ?2 AND scope = ?3"
            ),
            params![original_identifier, budget_type.as_str(), scope.as_str()],
            budget_from_row,
        )
        .optional()
        .map_err(other)
    }

    fn get_budget(&self, id: BudgetId) -> Result<Budget, StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {BUDGET_COLS} FROM budgets WHERE id = ?1"),
            params![id],
            budget_from_row,
        )
        .optional()
        .map_err(other)?
        .ok_or(StorageError::BudgetNotFound(id))
    }

    fn list_budgets(&self, budget_type: Option<BudgetType>) -> Result<Vec<Budget>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {BUDGET_COLS} FROM budgets
                 WHERE (?1 IS NULL OR budget_type = ?1)
                 ORDER BY published_at, id"
            ))
            .map_err(other)?;
        let budgets = stmt
            .query_map(params![budget_type.map(|t| t.as_str())], budget_from_row)
            .map_err(other)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(other)?;
        Ok(budgets)
    }

    fn delete_budget(&self, id: BudgetId) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn
            .execute("DELETE FROM budgets WHERE id = ?1", params![id])
            .map_err(other)?;
        if deleted == 0 {
            return Err(StorageError::BudgetNotFound(id));
        }
        Ok(())
    }

    fn upsert_dimension(
        &self,
        cmd: &DimensionUpsert,
    ) -> Result<(DimensionId, Upserted), StorageError> {
        let conn = self.conn.lock().unwrap();
        let existing: Option<Dimension> = conn
            .query_row(
                &format!(
                    "SELECT {DIMENSION_COLS} FROM dimensions
                     WHERE kind = ?1 AND original_identifier = ?2"
                ),
                params![cmd.kind.as_str(), cmd.original_identifier],
                dimension_from_row,
            )
            .optional()
            .map_err(other)?;

        if let Some(existing) = &existing {
            let translation_changes = cmd
                .name_translated
                .as_ref()
                .map_or(false, |t| existing.name_translated.as_deref() != Some(t));
            if existing.name == cmd.name
                && existing.parent_id == cmd.parent_id
                && !translation_changes
            {
                return Ok((existing.id, Upserted::Unchanged));
            }
        }

        conn.execute(
            "INSERT INTO dimensions (
                parent_id, original_identifier, kind, name, name_translated, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (kind, original_identifier) DO UPDATE SET
                parent_id = excluded.parent_id,
                name = excluded.name,
                name_translated = COALESCE(excluded.name_translated, dimensions.name_translated),
                updated_at = excluded.created_at",
            params![
                cmd.parent_id,
                cmd.original_identifier,
                cmd.kind.as_str(),
                cmd.name,
                cmd.name_translated,
                now_str(),
            ],
        )
        .map_err(other)?;

        match existing {
            Some(d) => Ok((d.id, Upserted::Updated)),
            None => Ok((conn.last_insert_rowid(), Upserted::Created)),
        }
    }

    fn find_dimension(
        &self,
        kind: &DimensionKind,
        original_identifier: &str,
    ) -> Result<Option<Dimension>, StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!(
                "SELECT {DIMENSION_COLS} FROM dimensions
                 WHERE kind = ?1 AND original_identifier = ?2"
            ),
            params![kind.as_str(), original_identifier],
            dimension_from_row,
        )
        .optional()
        .map_err(other)
    }

    fn get_dimension(&self, id: DimensionId) -> Result<Dimension, StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {DIMENSION_COLS} FROM dimensions WHERE id = ?1"),
            params![id],
            dimension_from_row,
        )
        .optional()
        .map_err(other)?
        .ok_or(StorageError::DimensionNotFound(id))
    }

    fn untranslated_dimension_names(&self) -> Result<Vec<String>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT name FROM dimensions
                 WHERE name_translated IS NULL
                 ORDER BY name",
            )
            .map_err(other)?;
        let names = stmt
            .query_map([], |row| row.get(0))
            .map_err(other)?
            .collect::<Result<Vec<String>, _>>()
            .map_err(other)?;
        Ok(names)
    }

    fn set_dimension_translation(
        &self,
        name: &str,
        translated: &str,
    ) -> Result<usize, StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE dimensions
             SET name_translated = ?2, updated_at = ?3
             WHERE name = ?1
               AND (name_translated IS NULL OR name_translated != ?2)",
            params![name, translated, now_str()],
        )
        .map_err(other)
    }

    fn upsert_expense(&self, cmd: &ExpenseUpsert) -> Result<(ExpenseId, Upserted), StorageError> {
        let conn = self.conn.lock().unwrap();
        let budget_exists: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM budgets WHERE id = ?1",
                params![cmd.budget_id],
                |row| row.get(0),
            )
            .map_err(other)?;
        if !budget_exists {
            return Err(StorageError::BudgetNotFound(cmd.budget_id));
        }

        let existing: Option<Expense> = conn
            .query_row(
                &format!(
                    "SELECT {EXPENSE_COLS} FROM expenses
                     WHERE budget_id = ?1 AND original_identifier = ?2"
                ),
                params![cmd.budget_id, cmd.original_identifier],
                expense_from_row,
            )
            .optional()
            .map_err(other)?;

        if let Some(existing) = &existing {
            if existing.value == cmd.value {
                return Ok((existing.id, Upserted::Unchanged));
            }
        }

        conn.execute(
            "INSERT INTO expenses (budget_id, original_identifier, value, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (budget_id, original_identifier) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.created_at",
            params![
                cmd.budget_id,
                cmd.original_identifier,
                cmd.value,
                now_str()
            ],
        )
        .map_err(other)?;

        match existing {
            Some(e) => Ok((e.id, Upserted::Updated)),
            None => Ok((conn.last_insert_rowid(), Upserted::Created)),
        }
    }

    fn set_expense_dimensions(
        &self,
        expense_id: ExpenseId,
        dimension_ids: &[DimensionId],
    ) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        let expense_exists: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM expenses WHERE id = ?1",
                params![expense_id],
                |row| row.get(0),
            )
            .map_err(other)?;
        if !expense_exists {
            return Err(StorageError::ExpenseNotFound(expense_id));
        }

        conn.execute(
            "DELETE FROM expense_dimensions WHERE expense_id = ?1",
            params![expense_id],
        )
        .map_err(other)?;
        for dim_id in dimension_ids {
            conn.execute(
                "INSERT OR IGNORE INTO expense_dimensions (expense_id, dimension_id)
                 VALUES (?1, ?2)",
                params![expense_id, dim_id],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    StorageError::DimensionNotFound(*dim_id)
                }
                e => other(e),
            })?;
        }
        Ok(())
    }

    fn expense_dimensions(&self, expense_id: ExpenseId) -> Result<Vec<DimensionId>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let expense_exists: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM expenses WHERE id = ?1",
                params![expense_id],
                |row| row.get(0),
            )
            .map_err(other)?;
        if !expense_exists {
            return Err(StorageError::ExpenseNotFound(expense_id));
        }
        let mut stmt = conn
            .prepare(
                "SELECT dimension_id FROM expense_dimensions
                 WHERE expense_id = ?1 ORDER BY dimension_id",
            )
            .map_err(other)?;
        let ids = stmt
            .query_map(params![expense_id], |row| row.get(0))
            .map_err(other)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(other)?;
        Ok(ids)
    }

    fn expenses_for_budget(&self, budget_id: BudgetId) -> Result<Vec<Expense>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let budget_exists: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM budgets WHERE id = ?1",
                params![budget_id],
                |row| row.get(0),
            )
            .map_err(other)?;
        if !budget_exists {
            return Err(StorageError::BudgetNotFound(budget_id));
        }
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {EXPENSE_COLS} FROM expenses WHERE budget_id = ?1 ORDER BY id"
            ))
            .map_err(other)?;
        let expenses = stmt
            .query_map(params![budget_id], expense_from_row)
            .map_err(other)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(other)?;
        Ok(expenses)
    }

    fn upsert_rate_window(&self, cmd: &RateWindowUpsert) -> Result<Upserted, StorageError> {
        let conn = self.conn.lock().unwrap();
        let existing: Option<(f64, Option<String>)> = conn
            .query_row(
                "SELECT rate, ended_at FROM conversion_rates
                 WHERE pair = ?1 AND started_at IS ?2",
                params![cmd.pair, cmd.started_at.map(date_to_str)],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(other)?;

        if let Some((rate, ended_at)) = &existing {
            let ended_matches = ended_at.as_deref() == cmd.ended_at.map(date_to_str).as_deref();
            if *rate == cmd.rate && ended_matches {
                return Ok(Upserted::Unchanged);
            }
        }

        // UNIQUE(pair, started_at) treats NULLs as distinct in SQLite, so
        // open-start windows go through an explicit update path.
        if existing.is_some() {
            conn.execute(
                "UPDATE conversion_rates
                 SET rate = ?3, ended_at = ?4, updated_at = ?5
                 WHERE pair = ?1 AND started_at IS ?2",
                params![
                    cmd.pair,
                    cmd.started_at.map(date_to_str),
                    cmd.rate,
                    cmd.ended_at.map(date_to_str),
                    now_str(),
                ],
            )
            .map_err(other)?;
            return Ok(Upserted::Updated);
        }

        conn.execute(
            "INSERT INTO conversion_rates (pair, rate, started_at, ended_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (pair, started_at) DO UPDATE SET
                rate = excluded.rate,
                ended_at = excluded.ended_at,
                updated_at = excluded.created_at",
            params![
                cmd.pair,
                cmd.rate,
                cmd.started_at.map(date_to_str),
                cmd.ended_at.map(date_to_str),
                now_str(),
            ],
        )
        .map_err(other)?;
        Ok(Upserted::Created)
    }

    fn rate_windows_at(&self, pair: &str, on: Date) -> Result<Vec<RateWindow>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT pair, rate, started_at, ended_at FROM conversion_rates
                 WHERE pair = ?1
                   AND (started_at IS NULL OR started_at <= ?2)
                   AND (ended_at IS NULL OR ended_at > ?2)
                 ORDER BY started_at",
            )
            .map_err(other)?;
        let windows = stmt
            .query_map(params![pair, date_to_str(on)], |row| {
                let started_at: Option<String> = row.get(2)?;
                let ended_at: Option<String> = row.get(3)?;
                Ok(RateWindow {
                    pair: row.get(0)?,
                    rate: row.get(1)?,
                    started_at: started_at
                        .map(|s| str_to_date(&s))
                        .transpose()
                        .map_err(|_| rusqlite::Error::InvalidQuery)?,
                    ended_at: ended_at
                        .map(|s| str_to_date(&s))
                        .transpose()
                        .map_err(|_| rusqlite::Error::InvalidQuery)?,
                })
            })
            .map_err(other)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(other)?;
        Ok(windows)
    }

    fn begin_transaction(&self) -> Result<TransactionId, StorageError> {
        let mut active = self.active_tx.lock().unwrap();
        if active.is_some() {
            return Err(StorageError::TransactionAlreadyActive);
        }
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("BEGIN IMMEDIATE;").map_err(other)?;
        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        *active = Some(tx_id);
        tracing::debug!(tx_id, "transaction started");
        Ok(tx_id)
    }

    fn commit_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError> {
        let mut active = self.active_tx.lock().unwrap();
        if *active != Some(tx_id) {
            return Err(StorageError::NoActiveTransaction);
        }
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("COMMIT;").map_err(other)?;
        *active = None;
        tracing::debug!(tx_id, "transaction committed");
        Ok(())
    }

    fn rollback_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError> {
        let mut active = self.active_tx.lock().unwrap();
        if *active != Some(tx_id) {
            return Err(StorageError::NoActiveTransaction);
        }
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("ROLLBACK;").map_err(other)?;
        *active = None;
        tracing::debug!(tx_id, "transaction rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::write::{BudgetUpsert, DimensionUpsert, ExpenseUpsert};
    use time::macros::date;

    fn store() -> SqliteStorage {
        SqliteStorage::new(":memory:").unwrap()
    }

    fn law_2024() -> BudgetUpsert {
        BudgetUpsert {
            original_identifier: "LAW-2024".to_string(),
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

    #[test]
    fn budget_upsert_round_trips() {
        let store = store();
        let (id, outcome) = store.upsert_budget(&law_2024()).unwrap();
        assert_eq!(outcome, Upserted::Created);

        let loaded = store.get_budget(id).unwrap();
        assert_eq!(loaded.original_identifier, "LAW-2024");
        assert_eq!(loaded.budget_type, BudgetType::Law);
        assert_eq!(loaded.published_at, date!(2024 - 01 - 01));
        assert!(loaded.updated_at.is_none());

        let (id2, outcome) = store.upsert_budget(&law_2024()).unwrap();
        assert_eq!(id, id2);
        assert_eq!(outcome, Upserted::Unchanged);
    }

    #[test]
    fn unchanged_upsert_leaves_updated_at_untouched() {
        let store = store();
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
    fn dimension_unique_within_kind() {
        let store = store();
        let cmd = DimensionUpsert {
            kind: DimensionKind::Ministry,
            original_identifier: "001".to_string(),
            name: "Defense".to_string(),
            name_translated: None,
            parent_id: None,
        };
        let (id, _) = store.upsert_dimension(&cmd).unwrap();
        let (id2, outcome) = store.upsert_dimension(&cmd).unwrap();
        assert_eq!(id, id2);
        assert_eq!(outcome, Upserted::Unchanged);

        // Same identifier under a different kind is a distinct dimension.
        let chapter = DimensionUpsert {
            kind: DimensionKind::Chapter,
            ..cmd
        };
        let (id3, outcome) = store.upsert_dimension(&chapter).unwrap();
        assert_ne!(id, id3);
        assert_eq!(outcome, Upserted::Created);
    }

    #[test]
    fn dimension_update_keeps_existing_translation() {
        let store = store();
        let mut cmd = DimensionUpsert {
            kind: DimensionKind::Ministry,
            original_identifier: "001".to_string(),
            name: "Defense".to_string(),
            name_translated: Some("Defense (en)".to_string()),
            parent_id: None,
        };
        let (id, _) = store.upsert_dimension(&cmd).unwrap();

        cmd.name = "Ministry of Defense".to_string();
        cmd.name_translated = None;
        let (_, outcome) = store.upsert_dimension(&cmd).unwrap();
        assert_eq!(outcome, Upserted::Updated);

        let dim = store.get_dimension(id).unwrap();
        assert_eq!(dim.name, "Ministry of Defense");
        assert_eq!(dim.name_translated.as_deref(), Some("Defense (en)"));
    }

    #[test]
    fn cascade_delete_removes_expenses_and_links() {
        let store = store();
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
            store.expenses_for_budget(budget_id),
            Err(StorageError::BudgetNotFound(_))
        ));
        assert!(store.get_dimension(dim_id).is_ok());
    }

    #[test]
    fn rollback_discards_batch() {
        let store = store();
        let tx = store.begin_transaction().unwrap();
        store.upsert_budget(&law_2024()).unwrap();
        store.rollback_transaction(tx).unwrap();
        assert!(store
            .find_budget("LAW-2024", BudgetType::Law, BudgetScope::Quarterly)
            .unwrap()
            .is_none());
    }

    #[test]
    fn only_one_transaction_at_a_time() {
        let store = store();
        let tx = store.begin_transaction().unwrap();
        assert!(matches!(
            store.begin_transaction(),
            Err(StorageError::TransactionAlreadyActive)
        ));
        store.commit_transaction(tx).unwrap();
    }

    #[test]
    fn rate_window_lookup_matches_half_open_range() {
        let store = store();
        store
            .upsert_rate_window(&RateWindowUpsert {
                pair: "RUB_USD".to_string(),
                rate: 90.0,
                started_at: Some(date!(2024 - 01 - 01)),
                ended_at: Some(date!(2024 - 03 - 01)),
            })
            .unwrap();

        let hit = store
            .rate_windows_at("RUB_USD", date!(2024 - 02 - 15))
            .unwrap();
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0].rate, 90.0);

        let boundary = store
            .rate_windows_at("RUB_USD", date!(2024 - 03 - 01))
            .unwrap();
        assert!(boundary.is_empty());
    }
}
