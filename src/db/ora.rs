use async_trait::async_trait;
use oracle::sql_type::OracleType;
use oracle::{Connection, Connector};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use super::query::{ColumnInfo, PreviewBuilder};
use super::{CellValue, Dialect, DriverError, EngineKind, EngineSession, OracleDialect, ResultPreview};
use crate::config::EngineConfig;
use crate::error::HarnessError;

const DISPLAY_CURSOR: &str =
    "SELECT plan_table_output FROM TABLE(DBMS_XPLAN.DISPLAY_CURSOR(NULL, NULL, 'ALLSTATS LAST'))";
const DISPLAY_EXPLAINED: &str = "SELECT plan_table_output FROM TABLE(DBMS_XPLAN.DISPLAY())";
const TABLE_EXISTS: &str = "SELECT COUNT(*) FROM all_tables \
     WHERE owner = SYS_CONTEXT('USERENV', 'CURRENT_SCHEMA') AND table_name = :1";
const FETCH_ARRAY_SIZE: u32 = 500;

/// Easy Connect string for `config`.
pub fn easy_connect_string(config: &EngineConfig) -> String {
    format!(
        "//{}:{}/{}?connect_timeout={}",
        config.host,
        config.port,
        config.database,
        config.connect_timeout.as_secs().max(1)
    )
}

/// An open Oracle session.
///
/// The driver is blocking, so every call is moved onto tokio's blocking pool.
/// Outside an explicit transaction each statement is committed on success.
pub struct OracleSession {
    conn: Arc<Mutex<Connection>>,
}

impl OracleSession {
    pub async fn connect(config: &EngineConfig) -> Result<Self, HarnessError> {
        let connect_string = easy_connect_string(config);
        let owned = config.clone();
        let task = tokio::task::spawn_blocking(move || open_connection(&owned, &connect_string));

        let conn = match tokio::time::timeout(config.connect_timeout, task).await {
            Err(_) => {
                return Err(connection_error(
                    config,
                    format!(
                        "connection timed out after {}s",
                        config.connect_timeout.as_secs()
                    ),
                ))
            }
            Ok(Err(e)) => return Err(connection_error(config, format!("connect task failed: {}", e))),
            Ok(Ok(result)) => result?,
        };

        tracing::info!(engine = "oracle", target = %config.display_string(), "connected");
        Ok(OracleSession {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn run<T, F>(&self, f: F) -> Result<T, DriverError>
    where
        F: FnOnce(&mut Connection) -> Result<T, DriverError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| {
                DriverError::from_string(EngineKind::Oracle, "connection lock poisoned".to_string())
            })?;
            f(&mut guard)
        })
        .await
        .map_err(|e| DriverError::from_string(EngineKind::Oracle, format!("blocking task failed: {}", e)))?
    }
}

fn open_connection(config: &EngineConfig, connect_string: &str) -> Result<Connection, HarnessError> {
    let fail = |e: oracle::Error| connection_error(config, DriverError::from_oracle_error(&e).to_string());

    let mut conn = Connector::new(
        config.username.as_str(),
        config.password.as_str(),
        connect_string,
    )
    .connect()
    .map_err(fail)?;

    conn.set_module(&config.application_name).map_err(fail)?;

    if let Some(schema) = &config.schema {
        conn.execute(&OracleDialect.set_default_schema(schema), &[])
            .map_err(fail)?;
    }

    // Needed for actual row counts in ALLSTATS plans; not every account may
    // change it, and plans still work without it.
    if let Err(e) = conn.execute("ALTER SESSION SET statistics_level = ALL", &[]) {
        tracing::debug!(engine = "oracle", error = %e, "statistics_level not changed");
    }

    conn.set_autocommit(true);
    Ok(conn)
}

fn connection_error(config: &EngineConfig, message: String) -> HarnessError {
    HarnessError::Connection {
        engine: EngineKind::Oracle,
        target: config.display_string(),
        message,
    }
}

fn ora_err(e: oracle::Error) -> DriverError {
    DriverError::from_oracle_error(&e)
}

fn fetch_lines(conn: &Connection, sql: &str) -> Result<Vec<String>, DriverError> {
    let rows = conn.query(sql, &[]).map_err(ora_err)?;
    let mut lines = Vec::new();
    for row in rows {
        let row = row.map_err(ora_err)?;
        let line: Option<String> = row.get(0).map_err(ora_err)?;
        lines.push(line.unwrap_or_default());
    }
    Ok(lines)
}

/// Whether DISPLAY_CURSOR could not see the cursor cache, in which case the
/// plan is taken from EXPLAIN PLAN instead.
fn needs_explain_fallback(result: &Result<Vec<String>, DriverError>) -> bool {
    match result {
        Err(e) => matches!(e.code.as_str(), "ORA-01031" | "ORA-00942"),
        Ok(lines) => lines.iter().any(|line| {
            let lower = line.to_lowercase();
            lower.contains("cannot fetch plan") || lower.contains("select privilege on v$")
        }),
    }
}

fn plan_for(conn: &Connection, sql: &str) -> Result<String, DriverError> {
    let cursor = fetch_lines(conn, DISPLAY_CURSOR);
    if !needs_explain_fallback(&cursor) {
        return cursor.map(|lines| lines.join("\n"));
    }
    tracing::debug!(engine = "oracle", "cursor cache not readable, falling back to EXPLAIN PLAN");
    conn.execute(&format!("EXPLAIN PLAN FOR {}", sql), &[])
        .map_err(ora_err)?;
    fetch_lines(conn, DISPLAY_EXPLAINED).map(|lines| lines.join("\n"))
}

fn oracle_cell(ty: &OracleType, raw: Option<String>) -> CellValue {
    let text = match raw {
        None => return CellValue::Null,
        Some(text) => text,
    };
    match ty {
        OracleType::Number(_, _) | OracleType::Int64 | OracleType::UInt64 => parse_number(text),
        OracleType::BinaryDouble | OracleType::BinaryFloat | OracleType::Float(_) => {
            match text.parse::<f64>() {
                Ok(f) => CellValue::Float64(f),
                Err(_) => CellValue::Text(text),
            }
        }
        OracleType::IntervalDS(_, _) | OracleType::IntervalYM(_) => CellValue::Interval(text),
        _ => CellValue::Text(text),
    }
}

fn parse_number(text: String) -> CellValue {
    if let Ok(i) = text.parse::<i64>() {
        return CellValue::Int64(i);
    }
    match Decimal::from_str(&text) {
        Ok(d) => CellValue::Decimal(d),
        Err(_) => CellValue::Text(text),
    }
}

fn preview(conn: &mut Connection, sql: &str, limit: usize) -> Result<ResultPreview, DriverError> {
    let start = Instant::now();
    let mut stmt = conn
        .statement(sql)
        .fetch_array_size(FETCH_ARRAY_SIZE)
        .build()
        .map_err(ora_err)?;

    if !stmt.is_query() {
        stmt.execute(&[]).map_err(ora_err)?;
        let affected = stmt.row_count().map_err(ora_err)?;
        return Ok(PreviewBuilder::new(0).finish(vec![], start.elapsed(), Some(affected)));
    }

    let rows = stmt.query(&[]).map_err(ora_err)?;
    let types: Vec<OracleType> = rows
        .column_info()
        .iter()
        .map(|c| c.oracle_type().clone())
        .collect();
    let columns: Vec<ColumnInfo> = rows
        .column_info()
        .iter()
        .map(|c| ColumnInfo {
            name: OracleDialect.canonical_label(c.name()),
            type_name: c.oracle_type().to_string(),
        })
        .collect();

    let mut builder = PreviewBuilder::new(limit);
    for row in rows {
        let row = row.map_err(ora_err)?;
        if !builder.wants_row() {
            builder.skip();
            continue;
        }
        let values = types
            .iter()
            .enumerate()
            .map(|(i, ty)| match row.get::<usize, Option<String>>(i) {
                Ok(raw) => oracle_cell(ty, raw),
                Err(_) => CellValue::Unknown(format!("<{}>", ty)),
            })
            .collect();
        builder.push(values);
    }
    Ok(builder.finish(columns, start.elapsed(), None))
}

#[async_trait]
impl EngineSession for OracleSession {
    fn kind(&self) -> EngineKind {
        EngineKind::Oracle
    }

    async fn execute(&mut self, sql: &str) -> Result<u64, DriverError> {
        tracing::debug!(engine = "oracle", sql, "execute");
        let sql = sql.to_string();
        self.run(move |conn| {
            let stmt = conn.execute(&sql, &[]).map_err(ora_err)?;
            stmt.row_count().map_err(ora_err)
        })
        .await
    }

    async fn query_preview(
        &mut self,
        sql: &str,
        limit: usize,
    ) -> Result<ResultPreview, DriverError> {
        tracing::debug!(engine = "oracle", sql, limit, "query");
        let sql = sql.to_string();
        self.run(move |conn| preview(conn, &sql, limit)).await
    }

    /// DISPLAY_CURSOR never re-executes the statement, so `read_only`
    /// makes no difference here.
    async fn explain(&mut self, sql: &str, _read_only: bool) -> Result<String, DriverError> {
        tracing::debug!(engine = "oracle", sql, "explain");
        let sql = sql.to_string();
        self.run(move |conn| plan_for(conn, &sql)).await
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool, DriverError> {
        let name = self.dialect().fold_identifier(table);
        self.run(move |conn| {
            let count = conn
                .query_row_as::<i64>(TABLE_EXISTS, &[&name])
                .map_err(ora_err)?;
            Ok(count > 0)
        })
        .await
    }

    async fn begin(&mut self) -> Result<(), DriverError> {
        tracing::debug!(engine = "oracle", "begin");
        self.run(|conn| {
            conn.set_autocommit(false);
            Ok(())
        })
        .await
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        tracing::debug!(engine = "oracle", "commit");
        self.run(|conn| {
            let result = conn.commit().map_err(ora_err);
            conn.set_autocommit(true);
            result
        })
        .await
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        tracing::debug!(engine = "oracle", "rollback");
        self.run(|conn| {
            let result = conn.rollback().map_err(ora_err);
            conn.set_autocommit(true);
            result
        })
        .await
    }

    async fn close(self: Box<Self>) {
        let result = self
            .run(|conn| conn.close().map_err(ora_err))
            .await;
        match result {
            Ok(()) => tracing::debug!(engine = "oracle", "connection closed"),
            Err(e) => tracing::warn!(engine = "oracle", error = %e, "close failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SslMode;
    use std::time::Duration;

    #[test]
    fn test_easy_connect_string() {
        let config = EngineConfig {
            host: "oracle.local".to_string(),
            port: 1521,
            username: "PDBADMIN".to_string(),
            password: "pw".to_string(),
            database: "FREEPDB1".to_string(),
            schema: None,
            ssl_mode: SslMode::Prefer,
            connect_timeout: Duration::from_secs(10),
            application_name: "sqlduet".to_string(),
        };
        assert_eq!(
            easy_connect_string(&config),
            "//oracle.local:1521/FREEPDB1?connect_timeout=10"
        );
    }

    #[test]
    fn test_number_cells() {
        assert_eq!(
            oracle_cell(&OracleType::Number(10, 0), Some("500".into())),
            CellValue::Int64(500)
        );
        assert_eq!(
            oracle_cell(&OracleType::Number(12, 2), Some("1000.5".into())),
            CellValue::Decimal(Decimal::new(10005, 1))
        );
        assert_eq!(oracle_cell(&OracleType::Number(0, -127), None), CellValue::Null);
        assert_eq!(
            oracle_cell(&OracleType::Varchar2(100), Some("Rock".into())),
            CellValue::Text("Rock".into())
        );
        assert_eq!(
            oracle_cell(&OracleType::BinaryDouble, Some("2.5".into())),
            CellValue::Float64(2.5)
        );
    }

    #[test]
    fn test_fallback_detection() {
        let privilege = DriverError::from_oracle_message(
            "ORA-01031: insufficient privileges".to_string(),
        );
        assert!(needs_explain_fallback(&Err(privilege)));

        let missing_view = DriverError::from_oracle_message(
            "ORA-00942: table or view does not exist".to_string(),
        );
        assert!(needs_explain_fallback(&Err(missing_view)));

        let syntax = DriverError::from_oracle_message(
            "ORA-00933: SQL command not properly ended".to_string(),
        );
        assert!(!needs_explain_fallback(&Err(syntax)));

        let no_cursor = Ok(vec![
            "SQL_ID  9babjv8yq8ru3, child number 0".to_string(),
            "NOTE: cannot fetch plan for SQL_ID: 9babjv8yq8ru3".to_string(),
        ]);
        assert!(needs_explain_fallback(&no_cursor));

        let no_grant = Ok(vec![
            "User has no SELECT privilege on V$SQL_PLAN".to_string(),
        ]);
        assert!(needs_explain_fallback(&no_grant));

        let plan = Ok(vec!["| Id  | Operation         | Name   |".to_string()]);
        assert!(!needs_explain_fallback(&plan));
    }
}
