//! Database initialization, block upserts and gap tracking writes

use clickhouse::Client;
use derive_more::Debug;
use eyre::{Context, Result};
use tracing::{debug, info};
use url::Url;

use crate::{
    models::{BlockRow, GapRow},
    schema::{BLOCKS_TABLE, GAP_TRACKING_TABLE, TABLE_SCHEMAS, TABLES, TableSchema},
};

/// `ClickHouse` writer client (inserts and migrations)
#[derive(Clone, Debug)]
pub struct ClickhouseWriter {
    /// Base client
    #[debug(skip)]
    base: Client,
    /// Database name
    db_name: String,
}

impl ClickhouseWriter {
    /// Create a new `ClickHouse` writer client
    pub fn new(url: Url, db_name: String, username: String, password: String) -> Result<Self> {
        let client = Client::default()
            .with_url(url)
            .with_database(db_name.clone())
            .with_user(username)
            .with_password(password);

        Ok(Self { base: client, db_name })
    }

    /// Create a table with the given schema
    async fn create_table(&self, schema: &TableSchema) -> Result<()> {
        let partition = schema
            .partition_by
            .map(|expr| format!("PARTITION BY {expr}\n            "))
            .unwrap_or_default();
        let query = format!(
            "CREATE TABLE IF NOT EXISTS {}.{} (
                {}
            ) ENGINE = {}
            {}ORDER BY ({})",
            self.db_name, schema.name, schema.columns, schema.engine, partition, schema.order_by
        );

        self.base
            .query(&query)
            .execute()
            .await
            .wrap_err_with(|| format!("Failed to create {} table", schema.name))
    }

    /// Drop a table if it exists
    async fn drop_table(&self, table_name: &str) -> Result<()> {
        self.base
            .query(&format!("DROP TABLE IF EXISTS {}.{}", self.db_name, table_name))
            .execute()
            .await
            .wrap_err_with(|| format!("Failed to drop {} table", table_name))
    }

    /// Create the database and tables, optionally dropping existing tables first
    pub async fn init_db(&self, reset: bool) -> Result<()> {
        self.base
            .query(&format!("CREATE DATABASE IF NOT EXISTS {}", self.db_name))
            .execute()
            .await?;

        if reset {
            for table in TABLES {
                self.drop_table(table).await?;
            }
            info!(db_name = %self.db_name, "Database reset complete");
        }

        for schema in TABLE_SCHEMAS {
            self.create_table(schema).await?;
        }
        Ok(())
    }

    /// Insert blocks in a single batch. Rows sharing a number replace each other on merge.
    pub async fn upsert_blocks(&self, rows: &[BlockRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let client = self.base.clone().with_database(&self.db_name);
        let mut insert = client.insert(BLOCKS_TABLE)?;
        for row in rows {
            insert.write(row).await?;
        }
        insert.end().await.wrap_err("Failed to insert blocks")?;

        debug!(count = rows.len(), first = rows[0].number, "Inserted blocks");
        Ok(())
    }

    /// Insert or refresh a tracked gap
    pub async fn upsert_gap(&self, row: &GapRow) -> Result<()> {
        let client = self.base.clone().with_database(&self.db_name);
        let mut insert = client.insert(GAP_TRACKING_TABLE)?;
        insert.write(row).await?;
        insert.end().await.wrap_err("Failed to upsert gap")?;
        Ok(())
    }

    /// Remove a tracked gap. Waits for the mutation to finish.
    pub async fn delete_gap(&self, gap_start: u64, gap_end: u64) -> Result<()> {
        let query = format!(
            "ALTER TABLE {}.{} DELETE WHERE gap_start = ? AND gap_end = ?",
            self.db_name, GAP_TRACKING_TABLE
        );
        self.base
            .clone()
            .with_option("mutations_sync", "1")
            .query(&query)
            .bind(gap_start)
            .bind(gap_end)
            .execute()
            .await
            .wrap_err_with(|| format!("Failed to delete gap {gap_start}..={gap_end}"))
    }
}
