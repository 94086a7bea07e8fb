//! In-memory registry implementation
//!
//! Used for single-process clusters and tests. All nodes sharing one
//! `Arc<MemoryDatasourceRegistry>` see the same rows.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::core::*;

#[derive(Default)]
struct Inner {
    rows: BTreeMap<DatasourceId, DatasourceRow>,
    // name -> id; enforces the uniqueness constraint
    names: HashMap<String, DatasourceId>,
    // (ds_id, table_name) -> snapshot
    tables: BTreeMap<(DatasourceId, String), TableDataRow>,
}

#[derive(Default)]
pub struct MemoryDatasourceRegistry {
    inner: RwLock<Inner>,
}

impl MemoryDatasourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted datasource rows.
    pub fn len(&self) -> usize {
        self.inner.read().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_row(inner: &mut Inner, id: &DatasourceId) -> bool {
        match inner.rows.remove(id) {
            Some(row) => {
                inner.names.remove(&row.name);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl DatasourceRegistry for MemoryDatasourceRegistry {
    async fn add_datasource(&self, row: DatasourceRow) -> RegistryResult<DatasourceRow> {
        let mut inner = self.inner.write();
        if inner.names.contains_key(&row.name) {
            return Err(RegistryError::DuplicateName(row.name));
        }
        if inner.rows.contains_key(&row.id) {
            return Err(RegistryError::DuplicateId(row.id.0));
        }
        inner.names.insert(row.name.clone(), row.id.clone());
        inner.rows.insert(row.id.clone(), row.clone());
        Ok(row)
    }

    async fn get_datasource(&self, id: &DatasourceId) -> RegistryResult<Option<DatasourceRow>> {
        Ok(self.inner.read().rows.get(id).cloned())
    }

    async fn get_datasource_by_name(&self, name: &str) -> RegistryResult<Option<DatasourceRow>> {
        let inner = self.inner.read();
        Ok(inner
            .names
            .get(name)
            .and_then(|id| inner.rows.get(id))
            .cloned())
    }

    async fn get_datasources(&self) -> RegistryResult<Vec<DatasourceRow>> {
        Ok(self.inner.read().rows.values().cloned().collect())
    }

    async fn delete_datasource(&self, id: &DatasourceId) -> RegistryResult<bool> {
        Ok(Self::remove_row(&mut self.inner.write(), id))
    }

    async fn delete_datasource_with_data(&self, id: &DatasourceId) -> RegistryResult<bool> {
        let mut inner = self.inner.write();
        if !Self::remove_row(&mut inner, id) {
            return Ok(false);
        }
        inner.tables.retain(|(ds_id, _), _| ds_id != id);
        Ok(true)
    }

    async fn replace_table_data(&self, row: TableDataRow) -> RegistryResult<()> {
        let mut inner = self.inner.write();
        if !inner.rows.contains_key(&row.ds_id) {
            return Err(RegistryError::StorageError(format!(
                "datasource {} does not exist",
                row.ds_id
            )));
        }
        inner
            .tables
            .insert((row.ds_id.clone(), row.table_name.clone()), row);
        Ok(())
    }

    async fn get_table_data(
        &self,
        id: &DatasourceId,
        table_name: &str,
    ) -> RegistryResult<Option<TableDataRow>> {
        Ok(self
            .inner
            .read()
            .tables
            .get(&(id.clone(), table_name.to_string()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn row(name: &str) -> DatasourceRow {
        DatasourceRow {
            id: DatasourceId::generate(),
            name: name.to_string(),
            driver: "fake_datasource".to_string(),
            description: Some("test".to_string()),
            enabled: true,
            config: Some(r#"{"a":"1"}"#.to_string()),
        }
    }

    #[tokio::test]
    async fn add_and_get() {
        let registry = MemoryDatasourceRegistry::new();
        let stored = registry.add_datasource(row("nova")).await.unwrap();

        let fetched = registry.get_datasource(&stored.id).await.unwrap().unwrap();
        assert_eq!(fetched, stored);

        let by_name = registry.get_datasource_by_name("nova").await.unwrap();
        assert_eq!(by_name, Some(stored));
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let registry = MemoryDatasourceRegistry::new();
        registry.add_datasource(row("nova")).await.unwrap();

        let err = registry.add_datasource(row("nova")).await.unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateName(name) if name == "nova"));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn reused_id_is_rejected_under_a_new_name() {
        let registry = MemoryDatasourceRegistry::new();
        let stored = registry.add_datasource(row("nova")).await.unwrap();

        let mut clash = row("glance");
        clash.id = stored.id.clone();
        let err = registry.add_datasource(clash).await.unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateId(ref id) if *id == stored.id.0));
        assert_eq!(registry.get_datasource(&stored.id).await.unwrap(), Some(stored));
        assert!(registry.get_datasource_by_name("glance").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_inserts_of_one_name_leave_one_row() {
        let registry = Arc::new(MemoryDatasourceRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.add_datasource(row("contended")).await.is_ok()
            }));
        }

        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn delete_frees_the_name() {
        let registry = MemoryDatasourceRegistry::new();
        let stored = registry.add_datasource(row("nova")).await.unwrap();

        assert!(registry.delete_datasource(&stored.id).await.unwrap());
        assert!(!registry.delete_datasource(&stored.id).await.unwrap());
        assert!(registry.add_datasource(row("nova")).await.is_ok());
    }

    #[tokio::test]
    async fn delete_with_data_cascades_to_tables() {
        let registry = MemoryDatasourceRegistry::new();
        let keep = registry.add_datasource(row("keep")).await.unwrap();
        let drop = registry.add_datasource(row("drop")).await.unwrap();

        for ds in [&keep, &drop] {
            registry
                .replace_table_data(TableDataRow {
                    ds_id: ds.id.clone(),
                    table_name: "servers".to_string(),
                    data: "[]".to_string(),
                })
                .await
                .unwrap();
        }

        assert!(registry.delete_datasource_with_data(&drop.id).await.unwrap());
        assert!(registry
            .get_table_data(&drop.id, "servers")
            .await
            .unwrap()
            .is_none());
        assert!(registry
            .get_table_data(&keep.id, "servers")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn table_data_requires_existing_datasource() {
        let registry = MemoryDatasourceRegistry::new();
        let err = registry
            .replace_table_data(TableDataRow {
                ds_id: "missing".into(),
                table_name: "t".to_string(),
                data: "[]".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::StorageError(_)));
    }
}
