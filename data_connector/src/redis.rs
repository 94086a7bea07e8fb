//! Redis registry implementation
//!
//! Key layout (all keys carry the configured prefix):
//! - `<p>:datasource:<id>`                 hash with the row fields
//! - `<p>:datasource_names`                hash name -> id, the uniqueness constraint
//! - `<p>:datasource_ids`                  set of all ids
//! - `<p>:datasource_tables:<id>`          set of table names owned by a datasource
//! - `<p>:datasource_table:<id>:<table>`   serialized rows of one table

use std::collections::HashMap;

use async_trait::async_trait;
use deadpool_redis::{Config, Connection, Pool, Runtime};
use redis::AsyncCommands;
use tracing::warn;

use crate::{config::RedisConfig, core::*};

pub(crate) struct RedisStore {
    pool: Pool,
    prefix: String,
}

impl RedisStore {
    pub fn new(config: RedisConfig) -> Result<Self, String> {
        let mut cfg = Config::from_url(config.url);
        cfg.pool = Some(deadpool_redis::PoolConfig::new(config.pool_max));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| e.to_string())?;
        Ok(Self {
            pool,
            prefix: config.key_prefix,
        })
    }
}

impl Clone for RedisStore {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            prefix: self.prefix.clone(),
        }
    }
}

pub(super) struct RedisDatasourceRegistry {
    store: RedisStore,
}

fn storage_err(e: impl std::fmt::Display) -> RegistryError {
    RegistryError::StorageError(e.to_string())
}

impl RedisDatasourceRegistry {
    pub fn new(store: RedisStore) -> Self {
        Self { store }
    }

    fn row_key(&self, id: &str) -> String {
        format!("{}:datasource:{id}", self.store.prefix)
    }

    fn names_key(&self) -> String {
        format!("{}:datasource_names", self.store.prefix)
    }

    fn ids_key(&self) -> String {
        format!("{}:datasource_ids", self.store.prefix)
    }

    fn tables_key(&self, id: &str) -> String {
        format!("{}:datasource_tables:{id}", self.store.prefix)
    }

    fn table_key(&self, id: &str, table: &str) -> String {
        format!("{}:datasource_table:{id}:{table}", self.store.prefix)
    }

    async fn conn(&self) -> RegistryResult<Connection> {
        self.store.pool.get().await.map_err(storage_err)
    }

    fn row_from_hash(mut fields: HashMap<String, String>) -> RegistryResult<DatasourceRow> {
        let mut take = |field: &str| {
            fields
                .remove(field)
                .ok_or_else(|| storage_err(format!("datasource hash is missing field '{field}'")))
        };
        let id = take("id")?;
        let name = take("name")?;
        let driver = take("driver")?;
        let enabled = take("enabled")? == "true";
        Ok(DatasourceRow {
            id: DatasourceId(id),
            name,
            driver,
            enabled,
            description: fields.remove("description"),
            config: fields.remove("config"),
        })
    }

    async fn load_row(
        &self,
        conn: &mut Connection,
        id: &str,
    ) -> RegistryResult<Option<DatasourceRow>> {
        let fields: HashMap<String, String> =
            conn.hgetall(self.row_key(id)).await.map_err(storage_err)?;
        if fields.is_empty() {
            return Ok(None);
        }
        Self::row_from_hash(fields).map(Some)
    }

    /// Undo the name claim and, when `id_claimed`, the id claim of a failed
    /// insert.
    async fn release_claims(&self, conn: &mut Connection, row: &DatasourceRow, id_claimed: bool) {
        let mut pipe = redis::pipe();
        pipe.hdel(self.names_key(), &row.name);
        if id_claimed {
            pipe.srem(self.ids_key(), &row.id.0);
        }
        if let Err(e) = pipe.query_async::<()>(conn).await {
            warn!(
                "Failed to release claims of datasource '{}' after insert failure: {}",
                row.name, e
            );
        }
    }

    async fn remove(&self, id: &DatasourceId, with_data: bool) -> RegistryResult<bool> {
        let mut conn = self.conn().await?;
        let Some(row) = self.load_row(&mut conn, &id.0).await? else {
            return Ok(false);
        };

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(self.row_key(&id.0));
        pipe.hdel(self.names_key(), &row.name);
        pipe.srem(self.ids_key(), &id.0);

        if with_data {
            let tables: Vec<String> = conn
                .smembers(self.tables_key(&id.0))
                .await
                .map_err(storage_err)?;
            for table in &tables {
                pipe.del(self.table_key(&id.0, table));
            }
            pipe.del(self.tables_key(&id.0));
        }

        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(storage_err)?;
        Ok(true)
    }
}

#[async_trait]
impl DatasourceRegistry for RedisDatasourceRegistry {
    async fn add_datasource(&self, row: DatasourceRow) -> RegistryResult<DatasourceRow> {
        let mut conn = self.conn().await?;

        // HSETNX is the uniqueness constraint: only one writer can claim a name.
        let claimed: bool = conn
            .hset_nx(self.names_key(), &row.name, &row.id.0)
            .await
            .map_err(storage_err)?;
        if !claimed {
            return Err(RegistryError::DuplicateName(row.name));
        }

        // SADD claims the id the same way; an id already in the set belongs
        // to another row whose hash must not be overwritten.
        let fresh_id = match conn.sadd::<_, _, i64>(self.ids_key(), &row.id.0).await {
            Ok(added) => added == 1,
            Err(e) => {
                self.release_claims(&mut conn, &row, false).await;
                return Err(storage_err(e));
            }
        };
        if !fresh_id {
            self.release_claims(&mut conn, &row, false).await;
            return Err(RegistryError::DuplicateId(row.id.0));
        }

        let mut fields: Vec<(&str, String)> = vec![
            ("id", row.id.0.clone()),
            ("name", row.name.clone()),
            ("driver", row.driver.clone()),
            ("enabled", row.enabled.to_string()),
        ];
        if let Some(description) = &row.description {
            fields.push(("description", description.clone()));
        }
        if let Some(config) = &row.config {
            fields.push(("config", config.clone()));
        }

        if let Err(e) = conn
            .hset_multiple::<_, _, _, ()>(self.row_key(&row.id.0), &fields[..])
            .await
        {
            // Release both claims so a retry is not blocked by a phantom row.
            self.release_claims(&mut conn, &row, true).await;
            return Err(storage_err(e));
        }

        Ok(row)
    }

    async fn get_datasource(&self, id: &DatasourceId) -> RegistryResult<Option<DatasourceRow>> {
        let mut conn = self.conn().await?;
        self.load_row(&mut conn, &id.0).await
    }

    async fn get_datasource_by_name(&self, name: &str) -> RegistryResult<Option<DatasourceRow>> {
        let mut conn = self.conn().await?;
        let id: Option<String> = conn
            .hget(self.names_key(), name)
            .await
            .map_err(storage_err)?;
        match id {
            Some(id) => self.load_row(&mut conn, &id).await,
            None => Ok(None),
        }
    }

    async fn get_datasources(&self) -> RegistryResult<Vec<DatasourceRow>> {
        let mut conn = self.conn().await?;
        let mut ids: Vec<String> = conn.smembers(self.ids_key()).await.map_err(storage_err)?;
        ids.sort();

        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            // A row deleted between SMEMBERS and HGETALL simply disappears.
            if let Some(row) = self.load_row(&mut conn, &id).await? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    async fn delete_datasource(&self, id: &DatasourceId) -> RegistryResult<bool> {
        self.remove(id, false).await
    }

    async fn delete_datasource_with_data(&self, id: &DatasourceId) -> RegistryResult<bool> {
        self.remove(id, true).await
    }

    async fn replace_table_data(&self, row: TableDataRow) -> RegistryResult<()> {
        let mut conn = self.conn().await?;
        let exists: bool = conn
            .exists(self.row_key(&row.ds_id.0))
            .await
            .map_err(storage_err)?;
        if !exists {
            return Err(storage_err(format!(
                "datasource {} does not exist",
                row.ds_id
            )));
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.set(self.table_key(&row.ds_id.0, &row.table_name), &row.data);
        pipe.sadd(self.tables_key(&row.ds_id.0), &row.table_name);
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(storage_err)
    }

    async fn get_table_data(
        &self,
        id: &DatasourceId,
        table_name: &str,
    ) -> RegistryResult<Option<TableDataRow>> {
        let mut conn = self.conn().await?;
        let data: Option<String> = conn
            .get(self.table_key(&id.0, table_name))
            .await
            .map_err(storage_err)?;
        Ok(data.map(|data| TableDataRow {
            ds_id: id.clone(),
            table_name: table_name.to_string(),
            data,
        }))
    }
}
