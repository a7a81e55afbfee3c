use std::path::PathBuf;

use thiserror::Error;

use crate::db::{DriverError, EngineKind};

/// Errors that stop a run. Anything raised here ends in the `Failed` state
/// (or a non-zero exit before the run even starts, for configuration).
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("missing required environment variable {name}")]
    MissingVariable { name: &'static str },

    #[error("invalid value for {name}: {message}")]
    InvalidVariable { name: &'static str, message: String },

    #[error("failed to read config file {}: {message}", path.display())]
    ConfigFile { path: PathBuf, message: String },

    #[error("[{engine}] connection to {target} failed: {message}")]
    Connection {
        engine: EngineKind,
        target: String,
        message: String,
    },

    #[error("[{engine}] schema error on table {table}: {source}")]
    Schema {
        engine: EngineKind,
        table: String,
        #[source]
        source: DriverError,
    },

    #[error("[{engine}] insufficient privilege on table {table}: {source}\n  hint: {hint}")]
    Privilege {
        engine: EngineKind,
        table: String,
        hint: String,
        #[source]
        source: DriverError,
    },

    #[error("schema model is invalid: {0}")]
    Model(String),

    #[error("[{engine}] seeding table {table} failed: {source}")]
    Seed {
        engine: EngineKind,
        table: String,
        #[source]
        source: DriverError,
    },

    #[error("cannot read requests directory {}: {source}", path.display())]
    RequestDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl HarnessError {
    /// The engine the failure is attributed to, if any.
    pub fn engine(&self) -> Option<EngineKind> {
        match self {
            HarnessError::Connection { engine, .. }
            | HarnessError::Schema { engine, .. }
            | HarnessError::Privilege { engine, .. }
            | HarnessError::Seed { engine, .. } => Some(*engine),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_variable_names_the_variable() {
        let err = HarnessError::MissingVariable {
            name: "ORACLE_PASSWORD",
        };
        assert_eq!(
            err.to_string(),
            "missing required environment variable ORACLE_PASSWORD"
        );
        assert!(err.engine().is_none());
    }

    #[test]
    fn test_privilege_error_carries_hint() {
        let err = HarnessError::Privilege {
            engine: EngineKind::Oracle,
            table: "groupe".to_string(),
            hint: "GRANT CREATE TABLE TO festival;".to_string(),
            source: DriverError::from_string(
                EngineKind::Oracle,
                "ORA-01031: insufficient privileges".to_string(),
            ),
        };
        let text = err.to_string();
        assert!(text.starts_with("[oracle] insufficient privilege on table groupe"));
        assert!(text.contains("hint: GRANT CREATE TABLE TO festival;"));
        assert_eq!(err.engine(), Some(EngineKind::Oracle));
    }
}
