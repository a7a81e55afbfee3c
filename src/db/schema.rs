use crate::config::EngineConfig;
use crate::error::HarnessError;
use crate::model::Model;

use super::{Dialect, DriverError, EngineKind, EngineSession};

/// Outcome of a verify-or-create pass on one engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaReport {
    pub created: Vec<String>,
    pub existing: Vec<String>,
}

impl SchemaReport {
    pub fn is_fresh(&self) -> bool {
        self.existing.is_empty()
    }
}

/// Create every missing table of `model`, parents first.
///
/// Safe to call repeatedly: existing tables are left untouched, and a CREATE
/// that loses a race with another creator counts as existing.
pub async fn ensure_schema(
    session: &mut dyn EngineSession,
    model: &Model,
    config: &EngineConfig,
) -> Result<SchemaReport, HarnessError> {
    let dialect = session.dialect();
    let engine = session.kind();
    let order = model.creation_order().map_err(HarnessError::Model)?;
    let mut report = SchemaReport::default();

    for entity in order {
        let exists = session
            .table_exists(entity.name)
            .await
            .map_err(|e| schema_failure(dialect, config, entity.name, e))?;
        if exists {
            tracing::debug!(engine = %engine, table = entity.name, "table exists");
            report.existing.push(entity.name.to_string());
            continue;
        }

        let ddl = dialect.create_table(entity);
        match session.execute(&ddl).await {
            Ok(_) => {
                tracing::info!(engine = %engine, table = entity.name, "created table");
                report.created.push(entity.name.to_string());
            }
            Err(e) if dialect.is_already_exists(&e) => {
                tracing::debug!(engine = %engine, table = entity.name, "table appeared concurrently");
                report.existing.push(entity.name.to_string());
            }
            Err(e) => return Err(schema_failure(dialect, config, entity.name, e)),
        }
    }

    Ok(report)
}

/// Drop every table of `model`, dependents first. Absent tables are skipped.
/// Returns the tables that were dropped.
pub async fn reset_schema(
    session: &mut dyn EngineSession,
    model: &Model,
    config: &EngineConfig,
) -> Result<Vec<String>, HarnessError> {
    let dialect = session.dialect();
    let engine = session.kind();
    let order = model.creation_order().map_err(HarnessError::Model)?;
    let mut dropped = Vec::new();

    for entity in order.into_iter().rev() {
        match session.execute(&dialect.drop_table(entity.name)).await {
            Ok(_) => {
                tracing::info!(engine = %engine, table = entity.name, "dropped table");
                dropped.push(entity.name.to_string());
            }
            Err(e) if dialect.is_missing_table(&e) => {
                tracing::debug!(engine = %engine, table = entity.name, "table already absent");
            }
            Err(e) => return Err(schema_failure(dialect, config, entity.name, e)),
        }
    }

    Ok(dropped)
}

fn schema_failure(
    dialect: &dyn Dialect,
    config: &EngineConfig,
    table: &str,
    source: DriverError,
) -> HarnessError {
    let engine: EngineKind = dialect.kind();
    if dialect.is_privilege_error(&source) || source.is_privilege() {
        HarnessError::Privilege {
            engine,
            table: table.to_string(),
            hint: dialect.grant_hint(&config.username, config.schema.as_deref()),
            source,
        }
    } else {
        HarnessError::Schema {
            engine,
            table: table.to_string(),
            source,
        }
    }
}
