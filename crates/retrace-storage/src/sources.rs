use std::sync::Arc;

use rusqlite::params;
use rusqlite::types::Value;
use tracing::debug;
use uuid::Uuid;

use retrace_core::error::RetraceError;

use crate::db::{integer_column, text_column, Database, Row, Table};
use crate::history::{parse_metadata, serialize_metadata, Metadata};

/// One unit of ingested content, tracked by hash/kind/value for
/// deduplication and retrieval.
#[derive(Debug, Clone)]
pub struct DataSource {
    pub id: String,
    pub app_id: String,
    pub hash: String,
    pub kind: String,
    pub value: String,
    pub metadata: Metadata,
    pub is_uploaded: bool,
}

#[derive(Clone)]
pub struct DataSources {
    db: Arc<Database>,
}

impl DataSources {
    pub fn new(db: Arc<Database>) -> Self {
        DataSources { db }
    }

    pub fn add_source(
        &self,
        app_id: &str,
        hash: &str,
        kind: &str,
        value: &str,
        metadata: Option<Metadata>,
    ) -> Result<String, RetraceError> {
        let source_id = Uuid::new_v4().to_string();
        let metadata_json = serialize_metadata(metadata)?;
        let record = [
            ("id", Value::Text(source_id.clone())),
            ("app_id", Value::Text(app_id.to_string())),
            ("hash", Value::Text(hash.to_string())),
            ("kind", Value::Text(kind.to_string())),
            ("value", Value::Text(value.to_string())),
            ("metadata", Value::Text(metadata_json)),
            ("is_uploaded", Value::Integer(0)),
        ];
        self.db.execute_insert(Table::DataSources, &record)?;
        debug!("tracked data source {source_id} ({kind}) for app {app_id}");
        Ok(source_id)
    }

    /// Dedup probe by content hash.
    pub fn exists(&self, app_id: &str, hash: &str) -> Result<bool, RetraceError> {
        let rows = self.db.query_rows(
            "SELECT id FROM data_sources WHERE app_id = ?1 AND hash = ?2 LIMIT 1",
            params![app_id, hash],
        )?;
        Ok(!rows.is_empty())
    }

    pub fn get_by_hash(
        &self,
        app_id: &str,
        hash: &str,
    ) -> Result<Option<DataSource>, RetraceError> {
        let rows = self.db.query_rows(
            "SELECT id, app_id, hash, kind, value, metadata, is_uploaded
             FROM data_sources
             WHERE app_id = ?1 AND hash = ?2
             LIMIT 1",
            params![app_id, hash],
        )?;
        rows.first().map(source_from_row).transpose()
    }

    pub fn list_sources(&self, app_id: &str) -> Result<Vec<DataSource>, RetraceError> {
        let rows = self.db.query_rows(
            "SELECT id, app_id, hash, kind, value, metadata, is_uploaded
             FROM data_sources
             WHERE app_id = ?1
             ORDER BY id ASC",
            params![app_id],
        )?;
        rows.iter().map(source_from_row).collect()
    }

    /// Flips the upload flag; a no-op for unknown ids.
    pub fn mark_uploaded(&self, source_id: &str) -> Result<bool, RetraceError> {
        let changed = self.db.execute_update(
            Table::DataSources,
            &[("is_uploaded", Value::Integer(1))],
            &[("id", Value::Text(source_id.to_string()))],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_sources(
        &self,
        app_id: &str,
        hash: Option<&str>,
    ) -> Result<usize, RetraceError> {
        let removed = match hash {
            Some(hash) => self.db.execute(
                "DELETE FROM data_sources WHERE app_id = ?1 AND hash = ?2",
                params![app_id, hash],
            )?,
            None => self.db.execute(
                "DELETE FROM data_sources WHERE app_id = ?1",
                params![app_id],
            )?,
        };
        debug!("removed {removed} data sources for app {app_id}");
        Ok(removed)
    }
}

fn source_from_row(row: &Row) -> Result<DataSource, RetraceError> {
    let metadata = parse_metadata(&text_column(row, "metadata")?)?;
    Ok(DataSource {
        id: text_column(row, "id")?,
        app_id: text_column(row, "app_id")?,
        hash: text_column(row, "hash")?,
        kind: text_column(row, "kind")?,
        value: text_column(row, "value")?,
        metadata,
        is_uploaded: integer_column(row, "is_uploaded")? != 0,
    })
}
