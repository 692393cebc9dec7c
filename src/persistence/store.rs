//! Per-tenant relational store (§4.5, §6): one pool per tenant schema,
//! cached for reuse, with endpoint-metadata dedupe inside a flush batch.

use std::collections::HashMap;

use log::debug;
use sqlx::Row;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::ProxyError;

use super::WriteRecord;

pub struct TenantStore {
    database_url: String,
    pools: Mutex<HashMap<Uuid, PgPool>>,
}

impl TenantStore {
    pub fn new(database_url: String) -> Self {
        Self {
            database_url,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// `tenant_<uuid-simple>`, e.g. `tenant_b5e8...`. Built only from a
    /// UUID's hex digits, so it is always a valid unquoted identifier —
    /// no tenant-supplied text ever reaches the schema name.
    fn schema_name(tenant_id: Uuid) -> String {
        format!("tenant_{}", tenant_id.simple())
    }

    /// Returns a pool scoped to `tenant_id`'s schema via `search_path`,
    /// creating and caching it on first use.
    pub async fn connect(&self, tenant_id: Uuid) -> Result<PgPool, ProxyError> {
        {
            let pools = self.pools.lock().await;
            if let Some(pool) = pools.get(&tenant_id) {
                return Ok(pool.clone());
            }
        }

        let schema = Self::schema_name(tenant_id);
        let options: PgConnectOptions = self
            .database_url
            .parse()
            .map_err(|_| ProxyError::InvalidSchema { tenant_id })?
            .options([("search_path", schema.as_str())]);

        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|_| ProxyError::InvalidSchema { tenant_id })?;

        self.pools.lock().await.insert(tenant_id, pool.clone());
        Ok(pool)
    }

    /// Flushes one tenant's batch. `fuzzer_mode` drops the batch entirely
    /// without touching endpoint metadata (§4.5 "fuzzer mode").
    pub async fn flush_batch(
        &self,
        tenant_id: Uuid,
        records: Vec<WriteRecord>,
        fuzzer_mode: bool,
    ) -> anyhow::Result<()> {
        if fuzzer_mode {
            debug!("fuzzer mode: dropping batch of {} for tenant {tenant_id}", records.len());
            return Ok(());
        }

        let pool = self.connect(tenant_id).await?;
        let mut tx = pool.begin().await?;
        let mut metadata_cache: HashMap<(String, String), i64> = HashMap::new();

        for record in records {
            let normalized_url = normalize_url(&record.request);
            let method = record.request.method.to_string_lossy();
            let endpoint_id =
                resolve_endpoint_id(&mut tx, &mut metadata_cache, &normalized_url, &method)
                    .await?;
            insert_write_record(&mut tx, tenant_id, endpoint_id, &record).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

fn normalize_url(request: &crate::envelope::RequestEnvelope) -> String {
    let scheme = match request.scheme {
        crate::envelope::Scheme::Http => "http",
        crate::envelope::Scheme::Https => "https",
    };
    format!(
        "{scheme}://{}:{}{}",
        request.host,
        request.port,
        request.path.to_string_lossy(),
    )
}

async fn resolve_endpoint_id(
    tx: &mut Transaction<'_, Postgres>,
    cache: &mut HashMap<(String, String), i64>,
    normalized_url: &str,
    method: &str,
) -> anyhow::Result<i64> {
    let key = (normalized_url.to_string(), method.to_string());
    if let Some(id) = cache.get(&key) {
        return Ok(*id);
    }

    let existing = sqlx::query("SELECT id FROM endpoint_metadata WHERE url = $1 AND method = $2")
        .bind(normalized_url)
        .bind(method)
        .fetch_optional(&mut **tx)
        .await?;

    let id = if let Some(row) = existing {
        row.try_get::<i64, _>("id")?
    } else {
        let row = sqlx::query(
            "INSERT INTO endpoint_metadata (url, method) VALUES ($1, $2) RETURNING id",
        )
        .bind(normalized_url)
        .bind(method)
        .fetch_one(&mut **tx)
        .await?;
        row.try_get::<i64, _>("id")?
    };

    cache.insert(key, id);
    Ok(id)
}

async fn insert_write_record(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: Uuid,
    endpoint_id: i64,
    record: &WriteRecord,
) -> anyhow::Result<()> {
    let request_json = serde_json::to_value(&record.request)?;
    let response_json = record
        .response
        .as_ref()
        .map(serde_json::to_value)
        .transpose()?;
    let error_json = record
        .error
        .as_ref()
        .map(serde_json::to_value)
        .transpose()?;

    sqlx::query(
        "INSERT INTO requests \
         (tenant_id, endpoint_metadata_id, request, response, error) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(tenant_id)
    .bind(endpoint_id)
    .bind(request_json)
    .bind(response_json)
    .bind(error_json)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ByteString;
    use crate::envelope::{RequestEnvelope, Scheme};

    fn sample_request() -> RequestEnvelope {
        RequestEnvelope {
            http_version: "HTTP/1.1".into(),
            host: "example.com".into(),
            port: 443,
            scheme: Scheme::Https,
            method: ByteString::from_static("GET"),
            path: ByteString::from_static("/widgets?id=1"),
            authority: ByteString::from_static("example.com:443"),
            headers: vec![],
            content: ByteString(vec![]),
            timestamp_start: 0.0,
            timestamp_end: 0.0,
        }
    }

    #[test]
    fn schema_name_is_hex_only() {
        let id = Uuid::new_v4();
        let name = TenantStore::schema_name(id);
        assert!(name.starts_with("tenant_"));
        assert!(name["tenant_".len()..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn normalize_url_includes_scheme_host_port_path() {
        let url = normalize_url(&sample_request());
        assert_eq!(url, "https://example.com:443/widgets?id=1");
    }
}
