//! Catalog and schema statements.
//!
//! The catalog owns the tables of one data directory. Tables are created and dropped
//! with [`SchemaStatement`]s, which are re-enterable: running the same statement set
//! twice leaves the catalog in the same state as running it once.
//!
//! ```text
//! <data_dir>/
//!   transactions/
//!     schema.json      table definition, written on create
//!     p201901/ ...     partitions (see PartitionedStore)
//! ```
//!
//! A table directory without `schema.json` is not a table and is ignored on open.

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::partition::write_atomic;
use crate::store::PartitionedStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use txhouse_core::{TableSchema, TRANSACTIONS_TABLE};

pub const SCHEMA_FILE: &str = "schema.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "statement", rename_all = "snake_case")]
pub enum SchemaStatement {
    CreateTable {
        schema: TableSchema,
        #[serde(default)]
        if_not_exists: bool,
    },
    DropTable {
        name: String,
        #[serde(default)]
        if_exists: bool,
    },
}

impl SchemaStatement {
    /// Drop and recreate the transactions table. Safe to run any number of times.
    pub fn transactions_ddl() -> Vec<SchemaStatement> {
        vec![
            SchemaStatement::DropTable {
                name: TRANSACTIONS_TABLE.to_string(),
                if_exists: true,
            },
            SchemaStatement::CreateTable {
                schema: TableSchema::transactions(),
                if_not_exists: true,
            },
        ]
    }
}

/// What a statement did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementOutcome {
    Created,
    Dropped,
    /// `IF NOT EXISTS` / `IF EXISTS` made the statement a no-op
    Unchanged,
}

pub struct Catalog {
    config: StoreConfig,
    tables: RwLock<BTreeMap<String, Arc<PartitionedStore>>>,
}

impl Catalog {
    /// Open every table found under `config.data_dir`.
    pub async fn open(config: StoreConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let mut tables = BTreeMap::new();
        let mut entries = tokio::fs::read_dir(&config.data_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let schema_path = entry.path().join(SCHEMA_FILE);
            let bytes = match tokio::fs::read(&schema_path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let schema: TableSchema = serde_json::from_slice(&bytes)?;
            let name = schema.name.clone();
            let store = PartitionedStore::open(schema, config.clone()).await?;
            tables.insert(name, Arc::new(store));
        }

        tracing::info!(
            data_dir = %config.data_dir.display(),
            tables = tables.len(),
            "catalog opened"
        );
        Ok(Self {
            config,
            tables: RwLock::new(tables),
        })
    }

    pub async fn table(&self, name: &str) -> Result<Arc<PartitionedStore>> {
        self.tables
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    pub async fn table_names(&self) -> Vec<String> {
        self.tables.read().await.keys().cloned().collect()
    }

    pub async fn execute(&self, statement: SchemaStatement) -> Result<StatementOutcome> {
        match statement {
            SchemaStatement::CreateTable {
                schema,
                if_not_exists,
            } => self.create_table(schema, if_not_exists).await,
            SchemaStatement::DropTable { name, if_exists } => {
                self.drop_table(&name, if_exists).await
            }
        }
    }

    pub async fn execute_all(&self, statements: Vec<SchemaStatement>) -> Result<Vec<StatementOutcome>> {
        let mut outcomes = Vec::with_capacity(statements.len());
        for statement in statements {
            outcomes.push(self.execute(statement).await?);
        }
        Ok(outcomes)
    }

    async fn create_table(&self, schema: TableSchema, if_not_exists: bool) -> Result<StatementOutcome> {
        schema.validate()?;
        let mut tables = self.tables.write().await;
        if tables.contains_key(&schema.name) {
            if if_not_exists {
                return Ok(StatementOutcome::Unchanged);
            }
            return Err(Error::TableExists(schema.name));
        }

        let dir = self.table_dir(&schema.name);
        tokio::fs::create_dir_all(&dir).await?;
        let bytes = serde_json::to_vec_pretty(&schema)?;
        write_atomic(&dir.join(SCHEMA_FILE), &bytes, self.config.fsync).await?;

        let name = schema.name.clone();
        let store = PartitionedStore::open(schema, self.config.clone()).await?;
        tables.insert(name.clone(), Arc::new(store));
        tracing::info!(table = %name, "table created");
        Ok(StatementOutcome::Created)
    }

    async fn drop_table(&self, name: &str, if_exists: bool) -> Result<StatementOutcome> {
        let mut tables = self.tables.write().await;
        let Some(store) = tables.remove(name) else {
            if if_exists {
                return Ok(StatementOutcome::Unchanged);
            }
            return Err(Error::TableNotFound(name.to_string()));
        };

        // Schema first: once it is gone the directory is no longer a table on reopen.
        tokio::fs::remove_file(self.table_dir(name).join(SCHEMA_FILE)).await?;
        let partitions = store.drop_all().await?;
        let _ = tokio::fs::remove_dir(self.table_dir(name)).await;
        tracing::info!(table = %name, partitions, "table dropped");
        Ok(StatementOutcome::Dropped)
    }

    fn table_dir(&self, name: &str) -> PathBuf {
        self.config.data_dir.join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> StoreConfig {
        StoreConfig::with_data_dir(dir.path())
    }

    #[tokio::test]
    async fn test_ddl_is_reenterable() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open(config(&dir)).await.unwrap();

        let first = catalog
            .execute_all(SchemaStatement::transactions_ddl())
            .await
            .unwrap();
        assert_eq!(first, vec![StatementOutcome::Unchanged, StatementOutcome::Created]);

        let second = catalog
            .execute_all(SchemaStatement::transactions_ddl())
            .await
            .unwrap();
        assert_eq!(second, vec![StatementOutcome::Dropped, StatementOutcome::Created]);

        assert_eq!(catalog.table_names().await, vec![TRANSACTIONS_TABLE.to_string()]);
    }

    #[tokio::test]
    async fn test_create_and_drop_without_guards() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open(config(&dir)).await.unwrap();
        let create = SchemaStatement::CreateTable {
            schema: TableSchema::transactions(),
            if_not_exists: false,
        };

        catalog.execute(create.clone()).await.unwrap();
        assert!(matches!(catalog.execute(create).await, Err(Error::TableExists(_))));

        let drop = SchemaStatement::DropTable {
            name: TRANSACTIONS_TABLE.to_string(),
            if_exists: false,
        };
        assert_eq!(catalog.execute(drop.clone()).await.unwrap(), StatementOutcome::Dropped);
        assert!(matches!(catalog.execute(drop).await, Err(Error::TableNotFound(_))));
        assert!(catalog.table(TRANSACTIONS_TABLE).await.is_err());
    }

    #[tokio::test]
    async fn test_tables_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let catalog = Catalog::open(config(&dir)).await.unwrap();
            catalog
                .execute_all(SchemaStatement::transactions_ddl())
                .await
                .unwrap();
        }
        let catalog = Catalog::open(config(&dir)).await.unwrap();
        let table = catalog.table(TRANSACTIONS_TABLE).await.unwrap();
        assert_eq!(table.schema(), &TableSchema::transactions());
    }

    #[test]
    fn test_statement_json() {
        let json = r#"{"statement":"drop_table","name":"transactions"}"#;
        let statement: SchemaStatement = serde_json::from_str(json).unwrap();
        assert_eq!(
            statement,
            SchemaStatement::DropTable {
                name: "transactions".to_string(),
                if_exists: false
            }
        );
    }
}
