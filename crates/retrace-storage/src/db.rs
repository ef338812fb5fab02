use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
use rusqlite::types::Value;
use rusqlite::{params, Connection, ToSql, TransactionBehavior};

use retrace_core::error::RetraceError;

use crate::config::StorageConfig;

const BUSY_TIMEOUT_MS: u64 = 5_000;
const WRITE_RETRY_ATTEMPTS: u64 = 3;
const WRITE_RETRY_BACKOFF_MS: u64 = 50;

/// A result row as a column-name to value mapping. Queries that match
/// nothing return an empty `Vec`, never an error.
pub type Row = HashMap<String, Value>;

/// The tables this adapter owns. Statement builders accept only this
/// enum, never a free-form table name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    DataSources,
    ChatHistory,
}

impl Table {
    pub fn name(self) -> &'static str {
        match self {
            Table::DataSources => "data_sources",
            Table::ChatHistory => "chat_history",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InteractionSummary {
    pub interactions: i64,
    pub unique_sessions: i64,
    pub rating_count: i64,
    pub average_rating: Option<f64>,
}

pub struct Database {
    conn: Mutex<Connection>,
}

pub async fn call_blocking<T, F>(db: Arc<Database>, f: F) -> Result<T, RetraceError>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> Result<T, RetraceError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(db.as_ref()))
        .await
        .map_err(|e| RetraceError::TaskJoin(e.to_string()))?
}

impl Database {
    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Opens the database addressed by `RETRACE_INSTANCE_ID` and
    /// `RETRACE_DATABASE_ID`. Missing identifiers fail with a config error.
    pub fn from_env() -> Result<Self, RetraceError> {
        Self::open(&StorageConfig::from_env()?)
    }

    pub fn open(config: &StorageConfig) -> Result<Self, RetraceError> {
        let db_path = config.database_path();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;

        let db = Database {
            conn: Mutex::new(conn),
        };
        db.create_schema()?;
        Ok(db)
    }

    /// Safe to call repeatedly; every statement is IF NOT EXISTS.
    pub fn create_schema(&self) -> Result<(), RetraceError> {
        let conn = self.lock_conn();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS data_sources (
                id TEXT PRIMARY KEY,
                app_id TEXT NOT NULL,
                hash TEXT NOT NULL,
                kind TEXT NOT NULL,
                value TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                is_uploaded INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_data_sources_app_id
                ON data_sources(app_id);
            CREATE INDEX IF NOT EXISTS idx_data_sources_hash
                ON data_sources(hash);
            CREATE INDEX IF NOT EXISTS idx_data_sources_kind
                ON data_sources(kind);

            CREATE TABLE IF NOT EXISTS chat_history (
                app_id TEXT NOT NULL,
                id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                question TEXT NOT NULL,
                answer TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                was_helpful INTEGER,
                rating INTEGER,
                feedback TEXT,
                PRIMARY KEY (app_id, id, session_id)
            );

            CREATE INDEX IF NOT EXISTS idx_chat_history_session_id
                ON chat_history(session_id);
            CREATE INDEX IF NOT EXISTS idx_chat_history_created_at
                ON chat_history(created_at);",
        )?;
        Ok(())
    }

    /// Runs a read-only statement inside a deferred read transaction, so the
    /// whole result set comes from one consistent snapshot even with
    /// concurrent writers.
    pub fn query_rows(&self, sql: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>, RetraceError> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let rows = {
            let mut stmt = tx.prepare(sql)?;
            let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
            let mut out = Vec::new();
            let mut raw = stmt.query(params)?;
            while let Some(row) = raw.next()? {
                let mut mapped = Row::with_capacity(columns.len());
                for (idx, column) in columns.iter().enumerate() {
                    mapped.insert(column.clone(), row.get::<_, Value>(idx)?);
                }
                out.push(mapped);
            }
            out
        };
        tx.commit()?;
        Ok(rows)
    }

    /// Executes one write statement in its own implicit transaction,
    /// retrying a bounded number of times on transient lock contention.
    pub fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> Result<usize, RetraceError> {
        let conn = self.lock_conn();
        let mut attempt = 0;
        loop {
            match conn.execute(sql, params) {
                Ok(rows) => return Ok(rows),
                Err(e) if is_transient(&e) && attempt < WRITE_RETRY_ATTEMPTS => {
                    attempt += 1;
                    std::thread::sleep(Duration::from_millis(WRITE_RETRY_BACKOFF_MS * attempt));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn execute_insert(
        &self,
        table: Table,
        record: &[(&str, Value)],
    ) -> Result<usize, RetraceError> {
        if record.is_empty() {
            return Err(RetraceError::Config(format!(
                "insert into {} with no columns",
                table.name()
            )));
        }
        let mut columns = Vec::with_capacity(record.len());
        let mut placeholders = Vec::with_capacity(record.len());
        for (idx, (column, _)) in record.iter().enumerate() {
            validate_identifier(column)?;
            columns.push(*column);
            placeholders.push(format!("?{}", idx + 1));
        }
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table.name(),
            columns.join(", "),
            placeholders.join(", ")
        );
        let values: Vec<&dyn ToSql> = record.iter().map(|(_, v)| v as &dyn ToSql).collect();
        self.execute(&sql, &values)
    }

    pub fn execute_update(
        &self,
        table: Table,
        record: &[(&str, Value)],
        predicate: &[(&str, Value)],
    ) -> Result<usize, RetraceError> {
        if record.is_empty() {
            return Err(RetraceError::Config(format!(
                "update of {} with no assignments",
                table.name()
            )));
        }
        if predicate.is_empty() {
            return Err(RetraceError::Config(format!(
                "update of {} with no predicate",
                table.name()
            )));
        }
        let mut idx = 0;
        let mut assignments = Vec::with_capacity(record.len());
        for (column, _) in record {
            validate_identifier(column)?;
            idx += 1;
            assignments.push(format!("{column} = ?{idx}"));
        }
        let mut conditions = Vec::with_capacity(predicate.len());
        for (column, _) in predicate {
            validate_identifier(column)?;
            idx += 1;
            conditions.push(format!("{column} = ?{idx}"));
        }
        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            table.name(),
            assignments.join(", "),
            conditions.join(" AND ")
        );
        let values: Vec<&dyn ToSql> = record
            .iter()
            .chain(predicate.iter())
            .map(|(_, v)| v as &dyn ToSql)
            .collect();
        self.execute(&sql, &values)
    }

    /// Interaction analytics for one calendar month. Month must be in
    /// 1..=12 and year non-zero; both are validated before touching the
    /// database.
    pub fn aggregate_interactions(
        &self,
        month: u32,
        year: i32,
    ) -> Result<InteractionSummary, RetraceError> {
        if !(1..=12).contains(&month) {
            return Err(RetraceError::Config(format!(
                "month must be between 1 and 12, got {month}"
            )));
        }
        if year == 0 {
            return Err(RetraceError::Config("year must be set".to_string()));
        }
        let start = month_start(year, month)?;
        let end = if month == 12 {
            month_start(year + 1, 1)?
        } else {
            month_start(year, month + 1)?
        };

        let conn = self.lock_conn();
        let (interactions, unique_sessions, rating_count, average_rating) = conn.query_row(
            "SELECT
                COUNT(*),
                COUNT(DISTINCT session_id),
                COUNT(rating),
                AVG(rating)
             FROM chat_history
             WHERE created_at >= ?1 AND created_at < ?2",
            params![start, end],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                ))
            },
        )?;

        Ok(InteractionSummary {
            interactions,
            unique_sessions,
            rating_count,
            average_rating,
        })
    }
}

fn month_start(year: i32, month: u32) -> Result<String, RetraceError> {
    let date = NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| RetraceError::Config(format!("invalid month/year: {month}/{year}")))?;
    Ok(Utc
        .from_utc_datetime(&date.and_time(NaiveTime::MIN))
        .to_rfc3339())
}

fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
    )
}

fn validate_identifier(name: &str) -> Result<(), RetraceError> {
    let starts_ok = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if starts_ok
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        Ok(())
    } else {
        Err(RetraceError::InvalidIdentifier(name.to_string()))
    }
}

pub fn text_column(row: &Row, name: &str) -> Result<String, RetraceError> {
    match row.get(name) {
        Some(Value::Text(s)) => Ok(s.clone()),
        other => Err(RetraceError::RowDecode(format!(
            "column {name}: expected text, got {other:?}"
        ))),
    }
}

pub fn opt_text_column(row: &Row, name: &str) -> Result<Option<String>, RetraceError> {
    match row.get(name) {
        Some(Value::Text(s)) => Ok(Some(s.clone())),
        Some(Value::Null) => Ok(None),
        other => Err(RetraceError::RowDecode(format!(
            "column {name}: expected text or null, got {other:?}"
        ))),
    }
}

pub fn integer_column(row: &Row, name: &str) -> Result<i64, RetraceError> {
    match row.get(name) {
        Some(Value::Integer(n)) => Ok(*n),
        other => Err(RetraceError::RowDecode(format!(
            "column {name}: expected integer, got {other:?}"
        ))),
    }
}

pub fn opt_integer_column(row: &Row, name: &str) -> Result<Option<i64>, RetraceError> {
    match row.get(name) {
        Some(Value::Integer(n)) => Ok(Some(*n)),
        Some(Value::Null) => Ok(None),
        other => Err(RetraceError::RowDecode(format!(
            "column {name}: expected integer or null, got {other:?}"
        ))),
    }
}

pub fn opt_bool_column(row: &Row, name: &str) -> Result<Option<bool>, RetraceError> {
    Ok(opt_integer_column(row, name)?.map(|n| n != 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (Database, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("retrace_db_test_{}", uuid::Uuid::new_v4()));
        let config = StorageConfig::new("test-instance", "retrace", dir.to_str().unwrap());
        let db = Database::open(&config).unwrap();
        (db, dir)
    }

    fn cleanup(dir: &std::path::Path) {
        let _ = std::fs::remove_dir_all(dir);
    }

    fn turn_record(
        app_id: &str,
        id: &str,
        session_id: &str,
        created_at: &str,
        rating: Option<i64>,
    ) -> Vec<(&'static str, Value)> {
        vec![
            ("app_id", Value::Text(app_id.to_string())),
            ("id", Value::Text(id.to_string())),
            ("session_id", Value::Text(session_id.to_string())),
            ("question", Value::Text("q".to_string())),
            ("answer", Value::Text("a".to_string())),
            ("metadata", Value::Text("{}".to_string())),
            ("created_at", Value::Text(created_at.to_string())),
            (
                "rating",
                rating.map(Value::Integer).unwrap_or(Value::Null),
            ),
        ]
    }

    #[test]
    fn test_open_creates_tables() {
        let (db, dir) = test_db();
        let rows = db
            .query_rows("SELECT id FROM data_sources", params![])
            .unwrap();
        assert!(rows.is_empty());
        let rows = db
            .query_rows("SELECT id FROM chat_history", params![])
            .unwrap();
        assert!(rows.is_empty());
        cleanup(&dir);
    }

    #[test]
    fn test_create_schema_is_idempotent() {
        let (db, dir) = test_db();
        db.create_schema().unwrap();
        db.create_schema().unwrap();
        let indexes: Vec<Row> = db
            .query_rows(
                "SELECT name FROM sqlite_master WHERE type = 'index' AND name LIKE 'idx_%'",
                params![],
            )
            .unwrap();
        assert_eq!(indexes.len(), 5);
        cleanup(&dir);
    }

    #[test]
    fn test_insert_and_query_roundtrip() {
        let (db, dir) = test_db();
        let inserted = db
            .execute_insert(
                Table::ChatHistory,
                &turn_record("app", "t1", "s1", "2024-03-05T10:00:00+00:00", None),
            )
            .unwrap();
        assert_eq!(inserted, 1);

        let rows = db
            .query_rows(
                "SELECT id, session_id, rating FROM chat_history WHERE app_id = ?1",
                params!["app"],
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(text_column(&rows[0], "id").unwrap(), "t1");
        assert_eq!(text_column(&rows[0], "session_id").unwrap(), "s1");
        assert_eq!(opt_integer_column(&rows[0], "rating").unwrap(), None);
        cleanup(&dir);
    }

    #[test]
    fn test_execute_update_reports_matched_rows() {
        let (db, dir) = test_db();
        db.execute_insert(
            Table::ChatHistory,
            &turn_record("app", "t1", "s1", "2024-03-05T10:00:00+00:00", None),
        )
        .unwrap();

        let changed = db
            .execute_update(
                Table::ChatHistory,
                &[("rating", Value::Integer(4))],
                &[("id", Value::Text("t1".to_string()))],
            )
            .unwrap();
        assert_eq!(changed, 1);

        let changed = db
            .execute_update(
                Table::ChatHistory,
                &[("rating", Value::Integer(4))],
                &[("id", Value::Text("missing".to_string()))],
            )
            .unwrap();
        assert_eq!(changed, 0);
        cleanup(&dir);
    }

    #[test]
    fn test_execute_update_requires_predicate() {
        let (db, dir) = test_db();
        let err = db
            .execute_update(Table::ChatHistory, &[("rating", Value::Integer(1))], &[])
            .unwrap_err();
        assert!(err.to_string().contains("no predicate"));
        cleanup(&dir);
    }

    #[test]
    fn test_bad_column_name_is_rejected() {
        let (db, dir) = test_db();
        let err = db
            .execute_insert(
                Table::ChatHistory,
                &[("id; DROP TABLE chat_history", Value::Integer(1))],
            )
            .unwrap_err();
        assert!(matches!(err, RetraceError::InvalidIdentifier(_)));

        let err = db
            .execute_insert(Table::ChatHistory, &[("1id", Value::Integer(1))])
            .unwrap_err();
        assert!(matches!(err, RetraceError::InvalidIdentifier(_)));
        cleanup(&dir);
    }

    #[test]
    fn test_aggregate_rejects_month_zero() {
        let (db, dir) = test_db();
        let err = db.aggregate_interactions(0, 2024).unwrap_err();
        assert!(matches!(err, RetraceError::Config(_)));
        let err = db.aggregate_interactions(13, 2024).unwrap_err();
        assert!(matches!(err, RetraceError::Config(_)));
        let err = db.aggregate_interactions(3, 0).unwrap_err();
        assert!(matches!(err, RetraceError::Config(_)));
        cleanup(&dir);
    }

    #[test]
    fn test_aggregate_interactions_for_month() {
        let (db, dir) = test_db();
        db.execute_insert(
            Table::ChatHistory,
            &turn_record("app", "t1", "s1", "2024-03-05T10:00:00+00:00", Some(4)),
        )
        .unwrap();
        db.execute_insert(
            Table::ChatHistory,
            &turn_record("app", "t2", "s1", "2024-03-06T10:00:00+00:00", None),
        )
        .unwrap();
        db.execute_insert(
            Table::ChatHistory,
            &turn_record("app", "t3", "s2", "2024-03-31T23:59:00+00:00", Some(2)),
        )
        .unwrap();
        // Outside the month window
        db.execute_insert(
            Table::ChatHistory,
            &turn_record("app", "t4", "s3", "2024-04-01T00:00:00+00:00", Some(5)),
        )
        .unwrap();

        let summary = db.aggregate_interactions(3, 2024).unwrap();
        assert_eq!(summary.interactions, 3);
        assert_eq!(summary.unique_sessions, 2);
        assert_eq!(summary.rating_count, 2);
        assert_eq!(summary.average_rating, Some(3.0));
        cleanup(&dir);
    }

    #[test]
    fn test_aggregate_empty_month() {
        let (db, dir) = test_db();
        let summary = db.aggregate_interactions(12, 2024).unwrap();
        assert_eq!(summary.interactions, 0);
        assert_eq!(summary.unique_sessions, 0);
        assert_eq!(summary.rating_count, 0);
        assert_eq!(summary.average_rating, None);
        cleanup(&dir);
    }

    #[test]
    fn test_december_window_spans_year_boundary() {
        let (db, dir) = test_db();
        db.execute_insert(
            Table::ChatHistory,
            &turn_record("app", "t1", "s1", "2024-12-31T23:00:00+00:00", None),
        )
        .unwrap();
        db.execute_insert(
            Table::ChatHistory,
            &turn_record("app", "t2", "s1", "2025-01-01T00:30:00+00:00", None),
        )
        .unwrap();

        let summary = db.aggregate_interactions(12, 2024).unwrap();
        assert_eq!(summary.interactions, 1);
        cleanup(&dir);
    }

    #[tokio::test]
    async fn test_call_blocking_runs_query() {
        let (db, dir) = test_db();
        let db = Arc::new(db);
        let rows = call_blocking(db.clone(), |d| {
            d.query_rows("SELECT id FROM chat_history", params![])
        })
        .await
        .unwrap();
        assert!(rows.is_empty());
        cleanup(&dir);
    }
}
