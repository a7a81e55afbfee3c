mod connection;
mod dialect;
mod ora;
mod query;
mod schema;

#[cfg(test)]
pub(crate) mod fake;

pub use connection::*;
pub use dialect::*;
pub use ora::*;
pub use query::*;
pub use schema::*;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::EngineConfig;
use crate::error::HarnessError;

/// The two supported backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Postgres,
    Oracle,
}

impl EngineKind {
    /// Dispatch order used everywhere output has to be comparable.
    pub const ALL: [EngineKind; 2] = [EngineKind::Postgres, EngineKind::Oracle];

    pub fn label(self) -> &'static str {
        match self {
            EngineKind::Postgres => "postgres",
            EngineKind::Oracle => "oracle",
        }
    }

    pub fn dialect(self) -> &'static dyn Dialect {
        match self {
            EngineKind::Postgres => &PostgresDialect,
            EngineKind::Oracle => &OracleDialect,
        }
    }

    /// Parse the engine suffix used by per-engine request files.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Some(EngineKind::Postgres),
            "oracle" | "ora" => Some(EngineKind::Oracle),
            _ => None,
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One open connection to one engine.
///
/// Every method maps driver failures to [`DriverError`] so callers never see
/// driver-specific error types. Statement text is passed through untouched.
#[async_trait]
pub trait EngineSession: Send {
    fn kind(&self) -> EngineKind;

    fn dialect(&self) -> &'static dyn Dialect {
        self.kind().dialect()
    }

    /// Run a statement that returns no rows; yields the affected row count.
    async fn execute(&mut self, sql: &str) -> Result<u64, DriverError>;

    /// Run a statement, keeping at most `limit` rows and counting the rest.
    async fn query_preview(&mut self, sql: &str, limit: usize)
        -> Result<ResultPreview, DriverError>;

    /// Ask the engine for its plan of `sql`. `read_only` allows plan
    /// flavours that execute the statement again.
    async fn explain(&mut self, sql: &str, read_only: bool) -> Result<String, DriverError>;

    /// Existence check for a canonical (lowercase) table name.
    async fn table_exists(&mut self, table: &str) -> Result<bool, DriverError>;

    async fn begin(&mut self) -> Result<(), DriverError>;

    async fn commit(&mut self) -> Result<(), DriverError>;

    async fn rollback(&mut self) -> Result<(), DriverError>;

    /// Release the connection. Errors are logged, never returned.
    async fn close(self: Box<Self>);
}

/// Opens sessions. The orchestrator only talks to this trait so it can be
/// driven by fakes in tests.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        kind: EngineKind,
        config: &EngineConfig,
    ) -> Result<Box<dyn EngineSession>, HarnessError>;
}

/// Connector backed by the real drivers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeConnector;

#[async_trait]
impl Connector for NativeConnector {
    async fn connect(
        &self,
        kind: EngineKind,
        config: &EngineConfig,
    ) -> Result<Box<dyn EngineSession>, HarnessError> {
        tracing::info!(engine = %kind, target = %config.display_string(), "connecting");
        let session: Box<dyn EngineSession> = match kind {
            EngineKind::Postgres => Box::new(PgSession::connect(config).await?),
            EngineKind::Oracle => Box::new(OracleSession::connect(config).await?),
        };
        Ok(session)
    }
}
