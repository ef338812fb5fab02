use std::path::PathBuf;

use retrace_core::error::RetraceError;

pub const ENV_INSTANCE_ID: &str = "RETRACE_INSTANCE_ID";
pub const ENV_DATABASE_ID: &str = "RETRACE_DATABASE_ID";
pub const ENV_DATA_DIR: &str = "RETRACE_DATA_DIR";

const DEFAULT_DATA_DIR: &str = "./retrace.data";

/// Storage location, resolved once at startup and injected into [`crate::db::Database`].
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub instance_id: String,
    pub database_id: String,
    pub data_dir: String,
}

impl StorageConfig {
    pub fn new(instance_id: &str, database_id: &str, data_dir: &str) -> Self {
        StorageConfig {
            instance_id: instance_id.to_string(),
            database_id: database_id.to_string(),
            data_dir: data_dir.to_string(),
        }
    }

    /// Reads the instance and database identifiers from the environment.
    /// Missing either identifier is a fatal configuration error.
    pub fn from_env() -> Result<Self, RetraceError> {
        let instance_id = required_env(ENV_INSTANCE_ID)?;
        let database_id = required_env(ENV_DATABASE_ID)?;
        let data_dir = std::env::var(ENV_DATA_DIR)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DATA_DIR.to_string());
        Ok(StorageConfig {
            instance_id,
            database_id,
            data_dir,
        })
    }

    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
            .join(&self.instance_id)
            .join(format!("{}.db", self.database_id))
    }
}

fn required_env(key: &str) -> Result<String, RetraceError> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| RetraceError::Config(format!("{key} must be set")))
}
