use async_trait::async_trait;
use futures::TryStreamExt;
use postgres_native_tls::MakeTlsConnector;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls};

use super::query::{pg_row_values, ColumnInfo, PreviewBuilder};
use super::{Dialect, DriverError, EngineKind, EngineSession, PostgresDialect, ResultPreview};
use crate::config::{EngineConfig, SslMode};
use crate::error::HarnessError;

/// Time allowed for the background connection task to wind down on close.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// libpq key/value connection string for `config`.
pub fn pg_connection_string(config: &EngineConfig) -> String {
    format!(
        "host={} port={} dbname={} user={} password={} sslmode={} connect_timeout={} application_name={}",
        quote_conn_value(&config.host),
        config.port,
        quote_conn_value(&config.database),
        quote_conn_value(&config.username),
        quote_conn_value(&config.password),
        config.ssl_mode.as_str(),
        config.connect_timeout.as_secs().max(1),
        quote_conn_value(&config.application_name)
    )
}

/// An open PostgreSQL session.
pub struct PgSession {
    client: Client,
    connection: JoinHandle<()>,
}

impl PgSession {
    pub async fn connect(config: &EngineConfig) -> Result<Self, HarnessError> {
        let (client, connection) = create_client(config).await?;
        let session = PgSession { client, connection };

        if let Some(schema) = &config.schema {
            let sql = PostgresDialect.set_default_schema(schema);
            if let Err(e) = session.client.batch_execute(&sql).await {
                let message = DriverError::from_pg_error(&e, &sql).to_string();
                Box::new(session).close().await;
                return Err(connection_error(config, message));
            }
        }

        tracing::info!(engine = "postgres", target = %config.display_string(), "connected");
        Ok(session)
    }

    async fn batch(&self, sql: &str) -> Result<(), DriverError> {
        tracing::debug!(engine = "postgres", sql, "batch");
        self.client
            .batch_execute(sql)
            .await
            .map_err(|e| DriverError::from_pg_error(&e, sql))
    }
}

#[async_trait]
impl EngineSession for PgSession {
    fn kind(&self) -> EngineKind {
        EngineKind::Postgres
    }

    async fn execute(&mut self, sql: &str) -> Result<u64, DriverError> {
        tracing::debug!(engine = "postgres", sql, "execute");
        self.client
            .execute(sql, &[])
            .await
            .map_err(|e| DriverError::from_pg_error(&e, sql))
    }

    async fn query_preview(
        &mut self,
        sql: &str,
        limit: usize,
    ) -> Result<ResultPreview, DriverError> {
        tracing::debug!(engine = "postgres", sql, limit, "query");
        let start = Instant::now();

        // Preparing first gives us the columns even when no row comes back.
        let statement = self
            .client
            .prepare(sql)
            .await
            .map_err(|e| DriverError::from_pg_error(&e, sql))?;
        let columns: Vec<ColumnInfo> = statement
            .columns()
            .iter()
            .map(|c| ColumnInfo {
                name: c.name().to_string(),
                type_name: c.type_().name().to_string(),
            })
            .collect();

        let stream = self
            .client
            .query_raw(&statement, Vec::<String>::new())
            .await
            .map_err(|e| DriverError::from_pg_error(&e, sql))?;
        futures::pin_mut!(stream);

        let mut builder = PreviewBuilder::new(limit);
        while let Some(row) = stream
            .try_next()
            .await
            .map_err(|e| DriverError::from_pg_error(&e, sql))?
        {
            if builder.wants_row() {
                builder.push(pg_row_values(&row));
            } else {
                builder.skip();
            }
        }

        let affected = if columns.is_empty() {
            Some(stream.rows_affected().unwrap_or(0))
        } else {
            None
        };
        Ok(builder.finish(columns, start.elapsed(), affected))
    }

    async fn explain(&mut self, sql: &str, read_only: bool) -> Result<String, DriverError> {
        let explain_sql = if read_only {
            format!("EXPLAIN (ANALYZE, BUFFERS, FORMAT TEXT) {}", sql)
        } else {
            format!("EXPLAIN (FORMAT TEXT) {}", sql)
        };
        tracing::debug!(engine = "postgres", sql = %explain_sql, "explain");

        let rows = self
            .client
            .query(&explain_sql, &[])
            .await
            .map_err(|e| DriverError::from_pg_error(&e, &explain_sql))?;

        let mut lines = Vec::with_capacity(rows.len());
        for row in &rows {
            let line: String = row
                .try_get(0)
                .map_err(|e| DriverError::from_pg_error(&e, &explain_sql))?;
            lines.push(line);
        }
        Ok(lines.join("\n"))
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool, DriverError> {
        const SQL: &str = "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
                           WHERE table_schema = current_schema() AND table_name = $1)";
        let name = self.dialect().fold_identifier(table);
        let row = self
            .client
            .query_one(SQL, &[&name])
            .await
            .map_err(|e| DriverError::from_pg_error(&e, SQL))?;
        row.try_get(0).map_err(|e| DriverError::from_pg_error(&e, SQL))
    }

    async fn begin(&mut self) -> Result<(), DriverError> {
        self.batch("BEGIN").await
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        self.batch("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        self.batch("ROLLBACK").await
    }

    async fn close(self: Box<Self>) {
        let PgSession { client, connection } = *self;
        // Dropping the client ends the connection task.
        drop(client);
        match tokio::time::timeout(CLOSE_GRACE, connection).await {
            Ok(Ok(())) => tracing::debug!(engine = "postgres", "connection closed"),
            Ok(Err(e)) => tracing::warn!(engine = "postgres", error = %e, "connection task failed"),
            Err(_) => tracing::warn!(engine = "postgres", "connection did not close in time"),
        }
    }
}

/// Connect and spawn the connection task. Bounded by the configured timeout
/// on top of libpq's own `connect_timeout`.
async fn create_client(config: &EngineConfig) -> Result<(Client, JoinHandle<()>), HarnessError> {
    let conn_string = pg_connection_string(config);
    let timeout = config.connect_timeout;

    let timed_out = || {
        connection_error(
            config,
            format!("connection timed out after {}s", timeout.as_secs()),
        )
    };

    let (client, handle) = match config.ssl_mode {
        SslMode::Disable => {
            let (client, connection) =
                tokio::time::timeout(timeout, tokio_postgres::connect(&conn_string, NoTls))
                    .await
                    .map_err(|_| timed_out())?
                    .map_err(|e| connection_error(config, pg_connect_message(&e)))?;
            let handle = tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::warn!(engine = "postgres", error = %e, "connection error");
                }
            });
            (client, handle)
        }
        SslMode::Prefer | SslMode::Require => {
            let tls = build_tls_connector().map_err(|e| connection_error(config, e))?;
            let (client, connection) =
                tokio::time::timeout(timeout, tokio_postgres::connect(&conn_string, tls))
                    .await
                    .map_err(|_| timed_out())?
                    .map_err(|e| connection_error(config, pg_connect_message(&e)))?;
            let handle = tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::warn!(engine = "postgres", error = %e, "connection error");
                }
            });
            (client, handle)
        }
    };

    Ok((client, handle))
}

/// `prefer` and `require` encrypt without verifying the server certificate,
/// as libpq does for those modes.
fn build_tls_connector() -> Result<MakeTlsConnector, String> {
    let mut builder = native_tls::TlsConnector::builder();
    builder.danger_accept_invalid_certs(true);
    builder.danger_accept_invalid_hostnames(true);
    let connector = builder
        .build()
        .map_err(|e| format!("failed to build TLS connector: {}", e))?;
    Ok(MakeTlsConnector::new(connector))
}

fn pg_connect_message(err: &tokio_postgres::Error) -> String {
    DriverError::from_pg_error(err, "").display_full()
}

fn connection_error(config: &EngineConfig, message: String) -> HarnessError {
    HarnessError::Connection {
        engine: EngineKind::Postgres,
        target: config.display_string(),
        message,
    }
}

/// Quote a value for a libpq key/value connection string.
fn quote_conn_value(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}
