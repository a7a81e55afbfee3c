use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::db::EngineKind;
use crate::error::HarnessError;

pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_APPLICATION_NAME: &str = "sqlduet";

const CONNECT_TIMEOUT_VAR: &str = "SQLDUET_CONNECT_TIMEOUT";
const APPLICATION_NAME_VAR: &str = "SQLDUET_APPLICATION_NAME";

/// SSL/TLS modes for the PostgreSQL side, matching libpq's `sslmode` values
/// that the driver understands. Oracle ignores this setting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
}

impl SslMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SslMode::Disable => "disable",
            SslMode::Prefer => "prefer",
            SslMode::Require => "require",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "disable" => Some(SslMode::Disable),
            "prefer" => Some(SslMode::Prefer),
            "require" => Some(SslMode::Require),
            _ => None,
        }
    }
}

/// Connection settings for one engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Database name (PostgreSQL) or service name (Oracle).
    pub database: String,
    /// Default schema / search path applied right after connecting.
    pub schema: Option<String>,
    pub ssl_mode: SslMode,
    pub connect_timeout: Duration,
    pub application_name: String,
}

impl EngineConfig {
    pub fn display_string(&self) -> String {
        format!(
            "{}@{}:{}/{}",
            self.username, self.host, self.port, self.database
        )
    }
}

/// Both engines' settings. Built once and passed by reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    pub postgres: EngineConfig,
    pub oracle: EngineConfig,
}

impl HarnessConfig {
    pub fn engine(&self, kind: EngineKind) -> &EngineConfig {
        match kind {
            EngineKind::Postgres => &self.postgres,
            EngineKind::Oracle => &self.oracle,
        }
    }

    /// Build the configuration from the process environment on top of `file`.
    pub fn from_env(file: &FileConfig) -> Result<Self, HarnessError> {
        Self::load(file, |name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn load<F>(file: &FileConfig, lookup: F) -> Result<Self, HarnessError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let connect_timeout = match lookup(CONNECT_TIMEOUT_VAR) {
            Some(raw) => parse_number::<u64>(CONNECT_TIMEOUT_VAR, &raw)?,
            None => file.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
        };
        if connect_timeout == 0 {
            return Err(HarnessError::InvalidVariable {
                name: CONNECT_TIMEOUT_VAR,
                message: "timeout must be at least one second".to_string(),
            });
        }
        let application_name = lookup(APPLICATION_NAME_VAR)
            .or_else(|| file.application_name.clone())
            .unwrap_or_else(|| DEFAULT_APPLICATION_NAME.to_string());

        let shared = Shared {
            connect_timeout: Duration::from_secs(connect_timeout),
            application_name,
        };

        Ok(Self {
            postgres: engine_from(EngineKind::Postgres, &file.postgres, &shared, &lookup)?,
            oracle: engine_from(EngineKind::Oracle, &file.oracle, &shared, &lookup)?,
        })
    }
}

struct Shared {
    connect_timeout: Duration,
    application_name: String,
}

/// Environment variable names for one engine.
#[derive(Debug, Clone, Copy)]
pub struct EnvNames {
    pub host: &'static str,
    pub port: &'static str,
    pub username: &'static str,
    pub password: &'static str,
    pub database: &'static str,
    pub schema: &'static str,
    pub ssl_mode: Option<&'static str>,
}

impl EngineKind {
    pub fn env_names(self) -> EnvNames {
        match self {
            EngineKind::Postgres => EnvNames {
                host: "POSTGRES_HOST",
                port: "POSTGRES_PORT",
                username: "POSTGRES_USER",
                password: "POSTGRES_PASSWORD",
                database: "POSTGRES_DB",
                schema: "POSTGRES_SCHEMA",
                ssl_mode: Some("POSTGRES_SSLMODE"),
            },
            EngineKind::Oracle => EnvNames {
                host: "ORACLE_HOST",
                port: "ORACLE_PORT",
                username: "ORACLE_USERNAME",
                password: "ORACLE_PASSWORD",
                database: "ORACLE_PDB",
                schema: "ORACLE_SCHEMA",
                ssl_mode: None,
            },
        }
    }

    fn default_port(self) -> u16 {
        match self {
            EngineKind::Postgres => 5432,
            EngineKind::Oracle => 1521,
        }
    }

    fn default_username(self) -> &'static str {
        match self {
            EngineKind::Postgres => "postgres",
            EngineKind::Oracle => "PDBADMIN",
        }
    }

    fn default_database(self) -> &'static str {
        match self {
            EngineKind::Postgres => "postgres_db",
            EngineKind::Oracle => "FREEPDB1",
        }
    }
}

fn engine_from<F>(
    kind: EngineKind,
    file: &EngineFileConfig,
    shared: &Shared,
    lookup: &F,
) -> Result<EngineConfig, HarnessError>
where
    F: Fn(&str) -> Option<String>,
{
    let names = kind.env_names();

    let port = match lookup(names.port) {
        Some(raw) => parse_number::<u16>(names.port, &raw)?,
        None => file.port.unwrap_or_else(|| kind.default_port()),
    };

    let password = lookup(names.password)
        .or_else(|| file.password.clone())
        .ok_or(HarnessError::MissingVariable {
            name: names.password,
        })?;

    let ssl_mode = match names.ssl_mode.and_then(|name| lookup(name).map(|v| (name, v))) {
        Some((name, raw)) => SslMode::parse(&raw).ok_or_else(|| HarnessError::InvalidVariable {
            name,
            message: format!("unknown sslmode {raw:?} (expected disable, prefer or require)"),
        })?,
        None => file.ssl_mode.unwrap_or_default(),
    };

    Ok(EngineConfig {
        host: lookup(names.host)
            .or_else(|| file.host.clone())
            .unwrap_or_else(|| "localhost".to_string()),
        port,
        username: lookup(names.username)
            .or_else(|| file.username.clone())
            .unwrap_or_else(|| kind.default_username().to_string()),
        password,
        database: lookup(names.database)
            .or_else(|| file.database.clone())
            .unwrap_or_else(|| kind.default_database().to_string()),
        schema: lookup(names.schema).or_else(|| file.schema.clone()),
        ssl_mode,
        connect_timeout: shared.connect_timeout,
        application_name: shared.application_name.clone(),
    })
}

fn parse_number<T>(name: &'static str, raw: &str) -> Result<T, HarnessError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| HarnessError::InvalidVariable {
            name,
            message: format!("{raw:?}: {e}"),
        })
}

/// Optional on-disk defaults, one table per engine.
///
/// ```toml
/// connect_timeout = 5
///
/// [postgres]
/// host = "db.local"
///
/// [oracle]
/// database = "FREEPDB1"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub connect_timeout: Option<u64>,
    pub application_name: Option<String>,
    pub postgres: EngineFileConfig,
    pub oracle: EngineFileConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineFileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub database: Option<String>,
    pub schema: Option<String>,
    pub ssl_mode: Option<SslMode>,
}

impl FileConfig {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sqlduet")
            .join("config.toml")
    }

    /// Read `path`; a missing file is only an error when it was asked for
    /// explicitly.
    pub fn read(path: &Path, required: bool) -> Result<Self, HarnessError> {
        if !path.exists() {
            if required {
                return Err(HarnessError::ConfigFile {
                    path: path.to_path_buf(),
                    message: "file does not exist".to_string(),
                });
            }
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| HarnessError::ConfigFile {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::parse(&content).map_err(|message| HarnessError::ConfigFile {
            path: path.to_path_buf(),
            message,
        })
    }

    pub fn parse(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    const PASSWORDS: [(&str, &str); 2] = [
        ("POSTGRES_PASSWORD", "pg-secret"),
        ("ORACLE_PASSWORD", "ora-secret"),
    ];

    #[test]
    fn test_defaults() {
        let config = HarnessConfig::load(&FileConfig::default(), lookup(&PASSWORDS)).unwrap();

        assert_eq!(config.postgres.host, "localhost");
        assert_eq!(config.postgres.port, 5432);
        assert_eq!(config.postgres.username, "postgres");
        assert_eq!(config.postgres.database, "postgres_db");
        assert_eq!(config.postgres.ssl_mode, SslMode::Prefer);
        assert_eq!(config.oracle.port, 1521);
        assert_eq!(config.oracle.username, "PDBADMIN");
        assert_eq!(config.oracle.database, "FREEPDB1");
        assert_eq!(config.oracle.schema, None);
        assert_eq!(config.oracle.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.oracle.application_name, "sqlduet");
    }

    #[test]
    fn test_missing_password_names_variable() {
        let err = HarnessConfig::load(
            &FileConfig::default(),
            lookup(&[("POSTGRES_PASSWORD", "pg-secret")]),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            HarnessError::MissingVariable {
                name: "ORACLE_PASSWORD"
            }
        ));
    }

    #[test]
    fn test_blank_password_counts_as_missing() {
        let err = HarnessConfig::load(
            &FileConfig::default(),
            lookup(&[("POSTGRES_PASSWORD", "  "), ("ORACLE_PASSWORD", "x")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("POSTGRES_PASSWORD"));
    }

    #[test]
    fn test_invalid_port() {
        let mut vars = PASSWORDS.to_vec();
        vars.push(("ORACLE_PORT", "15x21"));
        let err = HarnessConfig::load(&FileConfig::default(), lookup(&vars)).unwrap_err();
        assert!(matches!(
            err,
            HarnessError::InvalidVariable {
                name: "ORACLE_PORT",
                ..
            }
        ));
    }

    #[test]
    fn test_invalid_sslmode() {
        let mut vars = PASSWORDS.to_vec();
        vars.push(("POSTGRES_SSLMODE", "verify-full"));
        let err = HarnessConfig::load(&FileConfig::default(), lookup(&vars)).unwrap_err();
        assert!(err.to_string().contains("POSTGRES_SSLMODE"));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut vars = PASSWORDS.to_vec();
        vars.push(("SQLDUET_CONNECT_TIMEOUT", "0"));
        assert!(HarnessConfig::load(&FileConfig::default(), lookup(&vars)).is_err());
    }

    #[test]
    fn test_environment_overrides_file() {
        let file = FileConfig::parse(
            r#"
connect_timeout = 3

[postgres]
host = "pg.internal"
port = 6543
schema = "festival"

[oracle]
host = "ora.internal"
password = "from-file"
"#,
        )
        .unwrap();
        let config = HarnessConfig::load(
            &file,
            lookup(&[
                ("POSTGRES_PASSWORD", "pg-secret"),
                ("POSTGRES_PORT", "5433"),
                ("SQLDUET_APPLICATION_NAME", "nightly"),
            ]),
        )
        .unwrap();

        assert_eq!(config.postgres.host, "pg.internal");
        assert_eq!(config.postgres.port, 5433);
        assert_eq!(config.postgres.schema.as_deref(), Some("festival"));
        assert_eq!(config.oracle.host, "ora.internal");
        assert_eq!(config.oracle.password, "from-file");
        assert_eq!(config.oracle.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.postgres.application_name, "nightly");
    }

    #[test]
    fn test_file_rejects_unknown_keys() {
        assert!(FileConfig::parse("[postgres]\nhots = \"typo\"\n").is_err());
    }

    #[test]
    fn test_missing_optional_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert_eq!(FileConfig::read(&path, false).unwrap(), FileConfig::default());
        assert!(FileConfig::read(&path, true).is_err());
    }

    #[test]
    fn test_engine_selects_side() {
        let config = HarnessConfig::load(&FileConfig::default(), lookup(&PASSWORDS)).unwrap();
        assert_eq!(config.engine(EngineKind::Oracle).password, "ora-secret");
        assert_eq!(
            config.engine(EngineKind::Postgres).display_string(),
            "postgres@localhost:5432/postgres_db"
        );
    }
}
