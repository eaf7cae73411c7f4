pub mod admin;
pub mod load;
pub mod query;
pub mod schema;

use crate::config::Config;
use crate::OutputFormat;
use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use txhouse_core::{TableSchema, TRANSACTIONS_TABLE};
use txhouse_storage::{Catalog, PartitionedStore, SchemaStatement};

/// Open the catalog and return the transactions table, creating it if missing.
pub async fn open_table(config: &Config) -> Result<(Catalog, Arc<PartitionedStore>)> {
    let catalog = Catalog::open(config.store.clone())
        .await
        .with_context(|| format!("Failed to open data dir {}", config.store.data_dir.display()))?;
    catalog
        .execute(SchemaStatement::CreateTable {
            schema: TableSchema::transactions(),
            if_not_exists: true,
        })
        .await?;
    let table = catalog.table(TRANSACTIONS_TABLE).await?;
    Ok((catalog, table))
}

/// Print `value` as pretty JSON, or run `text` for human output.
pub fn emit<T: Serialize>(format: OutputFormat, value: &T, text: impl FnOnce(&T)) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Text => text(value),
    }
    Ok(())
}
