//! Tabular manifest store (PostgreSQL / MySQL).
//!
//! One implementation over sqlx's `Any` driver; the engines differ only in
//! placeholder syntax. At startup the table schema is introspected once to
//! learn which optional columns exist, so deployments keep their existing
//! tables without migrations. The request-time SELECT enumerates only the
//! columns that are present; NULLs in optional columns map to absence.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row as _};

use super::{Engine, ManifestStore, StoreConfig};
use crate::error::{Error, Result};
use crate::manifest::DownloadManifest;
use crate::metrics::DATABASE_QUERY_DURATION;

#[derive(Debug, Default, Clone, Copy)]
struct OptionalColumns {
    name: bool,
    callback: bool,
    password: bool,
    custom_headers: bool,
}

/// Manifest store backed by a relational table.
#[derive(Debug)]
pub struct TabularStore {
    pool: AnyPool,
    engine: Engine,
    table: String,
    id_field: String,
    query_timeout: Duration,
    optional: OptionalColumns,
    select_sql: String,
}

impl TabularStore {
    /// Connects, sizes the pool, and introspects the table schema.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Backend`] when the database is unreachable and
    /// [`Error::InvalidInput`] when a required column is missing.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        sqlx::any::install_default_drivers();

        let pool = AnyPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.max_connections.min(2))
            .max_lifetime(Duration::from_secs(3600))
            .idle_timeout(Duration::from_secs(1800))
            .connect(&config.url)
            .await
            .map_err(|e| Error::backend_with_source("database connect failed", e))?;

        let mut store = Self {
            pool,
            engine: config.engine,
            table: config.table.clone(),
            id_field: config.id_field.clone(),
            query_timeout: config.query_timeout,
            optional: OptionalColumns::default(),
            select_sql: String::new(),
        };
        store.detect_columns().await?;
        store.select_sql = store.build_select();
        Ok(store)
    }

    fn placeholder(&self) -> &'static str {
        match self.engine {
            Engine::Postgres => "$1",
            // Redis never reaches the tabular store.
            Engine::Mysql | Engine::Redis => "?",
        }
    }

    /// One-time schema introspection; never runs per request.
    async fn detect_columns(&mut self) -> Result<()> {
        let sql = format!(
            "SELECT column_name FROM information_schema.columns WHERE table_name = {}",
            self.placeholder()
        );
        let rows = sqlx::query(&sql)
            .bind(self.table.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::backend_with_source("failed to query table schema", e))?;

        let columns: Vec<String> = rows
            .iter()
            .map(|row| {
                row.try_get::<String, _>(0)
                    .map_err(|e| Error::backend_with_source("failed to read column name", e))
            })
            .collect::<Result<_>>()?;
        let has = |name: &str| columns.iter().any(|c| c == name);

        for required in [self.id_field.as_str(), "bucket", "objects"] {
            if !has(required) {
                return Err(Error::InvalidInput(format!(
                    "required column {required:?} not found in table {:?}",
                    self.table
                )));
            }
        }

        self.optional = OptionalColumns {
            name: has("name"),
            callback: has("callback"),
            password: has("password"),
            custom_headers: has("custom_headers"),
        };
        Ok(())
    }

    fn build_select(&self) -> String {
        let mut columns = vec!["bucket", "objects"];
        let optional = [
            (self.optional.name, "name"),
            (self.optional.callback, "callback"),
            (self.optional.password, "password"),
            (self.optional.custom_headers, "custom_headers"),
        ];
        for (present, column) in optional {
            if present {
                columns.push(column);
            }
        }
        format!(
            "SELECT {} FROM {} WHERE {} = {}",
            columns.join(", "),
            self.table,
            self.id_field,
            self.placeholder()
        )
    }

    fn decode_row(&self, id: &str, row: &AnyRow) -> Result<DownloadManifest> {
        let bucket: String = row
            .try_get(0)
            .map_err(|e| Error::backend_with_source("failed to read bucket column", e))?;
        let objects_json: String = row
            .try_get(1)
            .map_err(|e| Error::backend_with_source("failed to read objects column", e))?;
        let objects: Option<Vec<String>> = serde_json::from_str(&objects_json)
            .map_err(|e| Error::backend_with_source(format!("malformed objects for {id}"), e))?;

        let mut manifest = DownloadManifest {
            id: id.to_string(),
            bucket,
            objects: objects.unwrap_or_default(),
            ..DownloadManifest::default()
        };

        let mut index = 2;
        let mut next_optional = |present: bool| -> Result<Option<String>> {
            if !present {
                return Ok(None);
            }
            let value: Option<String> = row.try_get(index).map_err(|e| {
                Error::backend_with_source("failed to read optional column", e)
            })?;
            index += 1;
            Ok(value.filter(|v| !v.is_empty()))
        };

        manifest.name = next_optional(self.optional.name)?;
        manifest.callback = next_optional(self.optional.callback)?;
        manifest.password = next_optional(self.optional.password)?;
        if let Some(headers_json) = next_optional(self.optional.custom_headers)? {
            manifest.custom_headers = Some(serde_json::from_str(&headers_json).map_err(|e| {
                Error::backend_with_source(format!("malformed custom_headers for {id}"), e)
            })?);
        }

        Ok(manifest)
    }
}

#[async_trait]
impl ManifestStore for TabularStore {
    async fn lookup(&self, id: &str) -> Result<DownloadManifest> {
        let start = Instant::now();
        let result = tokio::time::timeout(
            self.query_timeout,
            sqlx::query(&self.select_sql).bind(id).fetch_optional(&self.pool),
        )
        .await;
        metrics::histogram!(DATABASE_QUERY_DURATION, "backend" => self.kind())
            .record(start.elapsed().as_secs_f64());

        let row = match result {
            Ok(Ok(row)) => row,
            Ok(Err(e)) => return Err(Error::backend_with_source("manifest query failed", e)),
            Err(_) => {
                return Err(Error::backend(format!(
                    "manifest query timed out after {:?}",
                    self.query_timeout
                )))
            }
        };

        let Some(row) = row else {
            return Err(Error::not_found(format!("manifest {id}")));
        };
        self.decode_row(id, &row)
    }

    async fn health(&self) -> Result<()> {
        tokio::time::timeout(self.query_timeout, sqlx::query("SELECT 1").fetch_one(&self.pool))
            .await
            .map_err(|_| Error::backend("database health probe timed out"))?
            .map_err(|e| Error::backend_with_source("database health probe failed", e))?;
        Ok(())
    }

    fn kind(&self) -> &'static str {
        self.engine.as_str()
    }
}
