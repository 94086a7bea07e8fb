// core.rs
//
// Core types for the datasource registry.
// Contains the storage trait, row types, error types, and IDs shared by all backends.
//
// Structure:
// 1. Datasource rows + IDs
// 2. Table data rows
// 3. Registry trait

use std::fmt::{Display, Formatter};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ============================================================================
// PART 1: Datasource rows
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct DatasourceId(pub String);

impl DatasourceId {
    /// Generate a fresh random (v4) UUID string id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl From<String> for DatasourceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for DatasourceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl Display for DatasourceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persisted datasource row.
///
/// `config` is the serialized JSON text of the option mapping; decoding is
/// the caller's concern (see [`crate::parse_config_text`]).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasourceRow {
    pub id: DatasourceId,
    pub name: String,
    pub driver: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
}

// ============================================================================
// PART 2: Table data
// ============================================================================

/// Last snapshot a datasource published for one of its tables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableDataRow {
    pub ds_id: DatasourceId,
    pub table_name: String,
    /// Serialized JSON rows
    pub data: String,
}

// ============================================================================
// PART 3: Registry trait
// ============================================================================

/// Result alias for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Error type for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Uniqueness constraint on `name` rejected the insert.
    #[error("Duplicate name: {0}")]
    DuplicateName(String),

    /// A row with this id already exists.
    #[error("Duplicate id: {0}")]
    DuplicateId(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// CRUD interface of the durable, cluster-shared datasource registry.
///
/// Backends must make `add_datasource` atomic with respect to the name
/// uniqueness check: two concurrent inserts of the same name from different
/// nodes must leave exactly one row behind.
#[async_trait]
pub trait DatasourceRegistry: Send + Sync + 'static {
    async fn add_datasource(&self, row: DatasourceRow) -> RegistryResult<DatasourceRow>;

    async fn get_datasource(&self, id: &DatasourceId) -> RegistryResult<Option<DatasourceRow>>;

    async fn get_datasource_by_name(&self, name: &str) -> RegistryResult<Option<DatasourceRow>>;

    async fn get_datasources(&self) -> RegistryResult<Vec<DatasourceRow>>;

    /// Delete only the datasource row. Returns `false` when it did not exist.
    async fn delete_datasource(&self, id: &DatasourceId) -> RegistryResult<bool>;

    /// Delete the datasource row together with every table snapshot it owns.
    async fn delete_datasource_with_data(&self, id: &DatasourceId) -> RegistryResult<bool>;

    async fn replace_table_data(&self, row: TableDataRow) -> RegistryResult<()>;

    async fn get_table_data(
        &self,
        id: &DatasourceId,
        table_name: &str,
    ) -> RegistryResult<Option<TableDataRow>>;
}
