// ABOUTME: PostgreSQL JSONB emitter: one monday_<object> table per object, upserted in batches
// ABOUTME: Handles TLS connection, table creation and parameterized multi-row upserts

use std::collections::{HashMap, HashSet};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;

use super::Emitter;
use crate::source::{ObjectType, Record};

const SOURCE_TYPE: &str = "monday";
/// Rows per INSERT statement (4 parameters each)
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Connect to PostgreSQL, negotiating TLS when the server offers it.
pub async fn connect(url: &str) -> Result<Client> {
    let connector = native_tls::TlsConnector::builder()
        .build()
        .context("Failed to build TLS connector")?;
    let connector = postgres_native_tls::MakeTlsConnector::new(connector);

    let (client, connection) = tokio_postgres::connect(url, connector)
        .await
        .with_context(|| format!("Failed to connect to {}", sanitize_url(url)))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("PostgreSQL connection error: {}", e);
        }
    });

    tracing::info!("Connected to target {}", sanitize_url(url));
    Ok(client)
}

/// Mask the password of a connection URL for logging.
pub fn sanitize_url(url: &str) -> String {
    if let Ok(mut parsed) = url::Url::parse(url) {
        if parsed.password().is_some() {
            let _ = parsed.set_password(Some("***"));
        }
        parsed.to_string()
    } else {
        url.to_string()
    }
}

pub fn table_name(object: ObjectType) -> String {
    format!("monday_{}", object.as_str())
}

/// Table names are interpolated into SQL, so only `[a-z0-9_]` is accepted.
pub fn validate_table_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 63 {
        bail!("Invalid table name '{}': must be 1-63 characters", name);
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        bail!(
            "Invalid table name '{}': only lowercase letters, digits and underscores are allowed",
            name
        );
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
struct PendingRow {
    key: String,
    parent_id: Option<String>,
    data: serde_json::Value,
}

/// Keep the last row per key; one statement cannot upsert the same key twice.
fn dedupe_last(rows: Vec<PendingRow>) -> Vec<PendingRow> {
    let mut seen = HashSet::new();
    let mut out: Vec<PendingRow> = rows
        .into_iter()
        .rev()
        .filter(|r| seen.insert(r.key.clone()))
        .collect();
    out.reverse();
    out
}

pub struct PostgresSink {
    client: Client,
    batch_size: usize,
    pending: Mutex<HashMap<ObjectType, Vec<PendingRow>>>,
    ensured: Mutex<HashSet<ObjectType>>,
}

impl PostgresSink {
    pub async fn connect(url: &str, batch_size: usize) -> Result<Self> {
        let client = connect(url).await?;
        Ok(Self::new(client, batch_size))
    }

    pub fn new(client: Client, batch_size: usize) -> Self {
        Self {
            client,
            batch_size: batch_size.max(1),
            pending: Mutex::new(HashMap::new()),
            ensured: Mutex::new(HashSet::new()),
        }
    }

    async fn ensure_table(&self, object: ObjectType) -> Result<()> {
        let mut ensured = self.ensured.lock().await;
        if ensured.contains(&object) {
            return Ok(());
        }

        let table = table_name(object);
        validate_table_name(&table).context("Invalid table name for JSONB table creation")?;

        tracing::info!("Ensuring JSONB table '{}'", table);
        let create_table_sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{}" (
                id TEXT PRIMARY KEY,
                parent_id TEXT,
                data JSONB NOT NULL,
                _source_type TEXT NOT NULL,
                _synced_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            table
        );
        self.client
            .execute(&create_table_sql, &[])
            .await
            .with_context(|| format!("Failed to create JSONB table '{}'", table))?;

        let create_gin_index_sql = format!(
            r#"CREATE INDEX IF NOT EXISTS "idx_{}_data" ON "{}" USING GIN (data)"#,
            table, table
        );
        self.client
            .execute(&create_gin_index_sql, &[])
            .await
            .with_context(|| format!("Failed to create GIN index on table '{}'", table))?;

        ensured.insert(object);
        Ok(())
    }

    async fn write_batch(&self, object: ObjectType, rows: Vec<PendingRow>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        self.ensure_table(object).await?;

        let table = table_name(object);
        let rows = dedupe_last(rows);

        let mut value_placeholders = Vec::with_capacity(rows.len());
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(rows.len() * 4);
        for (idx, row) in rows.iter().enumerate() {
            let base = idx * 4 + 1;
            value_placeholders.push(format!(
                "(${}, ${}, ${}, ${}, NOW())",
                base,
                base + 1,
                base + 2,
                base + 3
            ));
            params.push(&row.key);
            params.push(&row.parent_id);
            params.push(&row.data);
            params.push(&SOURCE_TYPE);
        }

        let upsert_sql = format!(
            r#"INSERT INTO "{}" (id, parent_id, data, _source_type, _synced_at) VALUES {}
               ON CONFLICT (id) DO UPDATE SET
                 parent_id = EXCLUDED.parent_id,
                 data = EXCLUDED.data,
                 _synced_at = EXCLUDED._synced_at"#,
            table,
            value_placeholders.join(", ")
        );

        self.client
            .execute(&upsert_sql, &params)
            .await
            .with_context(|| format!("Failed to upsert {} rows into '{}'", rows.len(), table))?;

        tracing::debug!("Upserted {} rows into '{}'", rows.len(), table);
        Ok(())
    }
}

#[async_trait]
impl Emitter for PostgresSink {
    async fn emit(&self, object: ObjectType, record: &Record) -> Result<()> {
        let ready = {
            let mut pending = self.pending.lock().await;
            let rows = pending.entry(object).or_default();
            rows.push(PendingRow {
                key: record.key(),
                parent_id: record.parent_id.clone(),
                data: record.row.clone(),
            });
            if rows.len() >= self.batch_size {
                std::mem::take(rows)
            } else {
                Vec::new()
            }
        };
        self.write_batch(object, ready).await
    }

    async fn flush(&self, object: ObjectType) -> Result<()> {
        let rows = {
            let mut pending = self.pending.lock().await;
            pending.remove(&object).unwrap_or_default()
        };
        self.write_batch(object, rows).await
    }
}
