//! Scripted sessions for tests that must not need a live database.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{
    CellValue, ColumnInfo, Connector, DriverError, EngineKind, EngineSession, ErrorCategory,
    ResultPreview,
};
use crate::config::EngineConfig;
use crate::error::HarnessError;

#[derive(Debug, Default)]
pub(crate) struct FakeState {
    /// Every statement received, in order.
    pub log: Vec<String>,
    pub closed: bool,
    pub tables: BTreeSet<String>,
    pub row_counts: BTreeMap<String, u64>,
    /// Canned results, matched by substring of the statement.
    pub previews: Vec<(String, ResultPreview)>,
    /// Canned failures, matched by substring of the statement.
    pub errors: Vec<(String, DriverError)>,
    pub plan: String,
    pub explain_error: Option<DriverError>,
    pub in_transaction: bool,
    pub commits: u32,
    pub rollbacks: u32,
}

/// Handle shared between a test and the session it hands out.
#[derive(Debug, Clone)]
pub(crate) struct FakeEngine {
    kind: EngineKind,
    state: Arc<Mutex<FakeState>>,
}

impl FakeEngine {
    pub(crate) fn new(kind: EngineKind) -> Self {
        let state = FakeState {
            plan: match kind {
                EngineKind::Postgres => {
                    "Seq Scan on groupe  (cost=0.00..10.00 rows=500 width=4)".to_string()
                }
                EngineKind::Oracle => [
                    "| Id  | Operation          | Name   | Rows  | Cost (%CPU)|",
                    "|   0 | SELECT STATEMENT   |        |   500 |     3   (0)|",
                    "|   1 |  TABLE ACCESS FULL | GROUPE |   500 |     3   (0)|",
                ]
                .join("\n"),
            },
            ..FakeState::default()
        };
        Self {
            kind,
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn session(&self) -> FakeSession {
        FakeSession {
            kind: self.kind,
            state: Arc::clone(&self.state),
        }
    }

    pub(crate) fn with_table(self, table: &str) -> Self {
        self.state().tables.insert(table.to_string());
        self
    }

    pub(crate) fn preview_for(self, pattern: &str, preview: ResultPreview) -> Self {
        self.state().previews.push((pattern.to_string(), preview));
        self
    }

    pub(crate) fn fail_on(self, pattern: &str, code: &str, message: &str) -> Self {
        let err = fake_error(self.kind, code, message);
        self.state().errors.push((pattern.to_string(), err));
        self
    }

    pub(crate) fn fail_explain(self, message: &str) -> Self {
        self.state().explain_error = Some(fake_error(self.kind, "", message));
        self
    }

    pub(crate) fn log(&self) -> Vec<String> {
        self.state().log.clone()
    }

    pub(crate) fn rows(&self, table: &str) -> u64 {
        self.state().row_counts.get(table).copied().unwrap_or(0)
    }
}

pub(crate) fn fake_error(kind: EngineKind, code: &str, message: &str) -> DriverError {
    let mut err = DriverError::from_string(kind, message.to_string());
    err.code = code.to_string();
    err.category = match code {
        "42501" | "ORA-01031" | "ORA-01950" | "ORA-01536" => ErrorCategory::Privilege,
        "42703" | "42P01" | "ORA-00904" | "ORA-00942" => ErrorCategory::Semantic,
        _ => ErrorCategory::Unknown,
    };
    err
}

/// A preview with a single integer column and `total` rows, `limit` of them kept.
pub(crate) fn int_preview(column: &str, values: &[i64], total: u64) -> ResultPreview {
    ResultPreview {
        columns: vec![ColumnInfo {
            name: column.to_string(),
            type_name: "int8".to_string(),
        }],
        rows: values.iter().map(|v| vec![CellValue::Int64(*v)]).collect(),
        total_rows: total,
        execution_time: Duration::from_millis(3),
        affected_rows: None,
    }
}

#[derive(Debug)]
pub(crate) struct FakeSession {
    kind: EngineKind,
    state: Arc<Mutex<FakeState>>,
}

impl FakeSession {
    fn record(&self, sql: &str) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        state.log.push(sql.to_string());
        if let Some((_, err)) = state.errors.iter().find(|(p, _)| sql.contains(p.as_str())) {
            return Err(err.clone());
        }
        Ok(())
    }

    /// Track tables and row counts from the generated statements.
    fn apply(&self, sql: &str) -> Result<u64, DriverError> {
        let mut state = self.state.lock().unwrap();
        let upper = sql.trim_start().to_uppercase();
        if upper.starts_with("CREATE TABLE") {
            let name = table_name(sql, "CREATE TABLE");
            if !state.tables.insert(name.clone()) {
                let code = match self.kind {
                    EngineKind::Postgres => "42P07",
                    EngineKind::Oracle => "ORA-00955",
                };
                return Err(fake_error(self.kind, code, &format!("{name} already exists")));
            }
            Ok(0)
        } else if upper.starts_with("DROP TABLE") {
            let name = table_name(sql, "DROP TABLE");
            state.row_counts.remove(&name);
            if !state.tables.remove(&name) && self.kind == EngineKind::Oracle {
                return Err(fake_error(self.kind, "ORA-00942", "table or view does not exist"));
            }
            Ok(0)
        } else if upper.starts_with("DELETE FROM") {
            let name = table_name(sql, "DELETE FROM");
            Ok(state.row_counts.insert(name, 0).unwrap_or(0))
        } else if upper.starts_with("INSERT") {
            let target = if upper.starts_with("INSERT ALL") {
                sql.lines().nth(1).map(|l| table_name(l, "INTO")).unwrap_or_default()
            } else {
                table_name(sql, "INSERT INTO")
            };
            let inserted = sql
                .lines()
                .filter(|l| l.starts_with('(') || l.starts_with("INTO "))
                .count() as u64;
            *state.row_counts.entry(target).or_insert(0) += inserted;
            Ok(inserted)
        } else {
            Ok(0)
        }
    }
}

/// Canonical (lowercase, unquoted) table name following `keyword`.
fn table_name(sql: &str, keyword: &str) -> String {
    let upper = sql.to_uppercase();
    let rest = match upper.find(keyword) {
        Some(idx) => &sql[idx + keyword.len()..],
        None => return String::new(),
    };
    let rest = rest.trim_start();
    let rest = rest
        .strip_prefix("IF EXISTS ")
        .or_else(|| rest.strip_prefix("if exists "))
        .unwrap_or(rest)
        .trim_start();
    rest.split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default()
        .trim_matches('"')
        .to_lowercase()
}

#[async_trait]
impl EngineSession for FakeSession {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    async fn execute(&mut self, sql: &str) -> Result<u64, DriverError> {
        self.record(sql)?;
        self.apply(sql)
    }

    async fn query_preview(
        &mut self,
        sql: &str,
        limit: usize,
    ) -> Result<ResultPreview, DriverError> {
        self.record(sql)?;
        let state = self.state.lock().unwrap();
        let canned = state
            .previews
            .iter()
            .find(|(p, _)| sql.contains(p.as_str()))
            .map(|(_, preview)| preview.clone());
        drop(state);
        match canned {
            Some(mut preview) => {
                preview.rows.truncate(limit);
                Ok(preview)
            }
            None if sql.trim_start().to_uppercase().starts_with("SELECT") => {
                Ok(ResultPreview::empty())
            }
            None => {
                let affected = self.apply(sql)?;
                Ok(ResultPreview {
                    affected_rows: Some(affected),
                    ..ResultPreview::empty()
                })
            }
        }
    }

    async fn explain(&mut self, sql: &str, read_only: bool) -> Result<String, DriverError> {
        let mut state = self.state.lock().unwrap();
        state.log.push(format!("EXPLAIN[{}] {}", if read_only { "analyze" } else { "plain" }, sql));
        if let Some(err) = &state.explain_error {
            return Err(err.clone());
        }
        Ok(state.plan.clone())
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool, DriverError> {
        let state = self.state.lock().unwrap();
        Ok(state.tables.contains(table))
    }

    async fn begin(&mut self) -> Result<(), DriverError> {
        self.record("BEGIN")?;
        self.state.lock().unwrap().in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        self.record("COMMIT")?;
        let mut state = self.state.lock().unwrap();
        state.in_transaction = false;
        state.commits += 1;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        self.record("ROLLBACK")?;
        let mut state = self.state.lock().unwrap();
        state.in_transaction = false;
        state.rollbacks += 1;
        Ok(())
    }

    async fn close(self: Box<Self>) {
        self.state.lock().unwrap().closed = true;
    }
}

/// Hands out sessions on the registered engines; unregistered or failing
/// engines produce connection errors.
#[derive(Debug, Default)]
pub(crate) struct FakeConnector {
    engines: Vec<FakeEngine>,
    failing: HashSet<EngineKind>,
}

impl FakeConnector {
    pub(crate) fn new(engines: Vec<FakeEngine>) -> Self {
        Self {
            engines,
            failing: HashSet::new(),
        }
    }

    pub(crate) fn failing(mut self, kind: EngineKind) -> Self {
        self.failing.insert(kind);
        self
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        kind: EngineKind,
        config: &EngineConfig,
    ) -> Result<Box<dyn EngineSession>, HarnessError> {
        let engine = self.engines.iter().find(|e| e.kind == kind);
        match engine {
            Some(engine) if !self.failing.contains(&kind) => Ok(Box::new(engine.session())),
            _ => Err(HarnessError::Connection {
                engine: kind,
                target: config.display_string(),
                message: "connection refused".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_parsing() {
        assert_eq!(table_name("CREATE TABLE \"GROUPE\" (\n", "CREATE TABLE"), "groupe");
        assert_eq!(table_name("DROP TABLE IF EXISTS \"scene\" CASCADE", "DROP TABLE"), "scene");
        assert_eq!(table_name("DELETE FROM \"concert\"", "DELETE FROM"), "concert");
        assert_eq!(table_name("INTO \"SCENE\" (\"ID_SCENE\") VALUES (1)", "INTO"), "scene");
    }

    #[tokio::test]
    async fn test_fake_tracks_inserts() {
        let engine = FakeEngine::new(EngineKind::Oracle).with_table("scene");
        let mut session = engine.session();
        session
            .execute("INSERT ALL\nINTO \"SCENE\" (\"ID_SCENE\") VALUES (1)\nINTO \"SCENE\" (\"ID_SCENE\") VALUES (2)\nSELECT 1 FROM DUAL")
            .await
            .unwrap();
        assert_eq!(engine.rows("scene"), 2);
        session.execute("DELETE FROM \"SCENE\"").await.unwrap();
        assert_eq!(engine.rows("scene"), 0);
        assert!(engine.log().iter().any(|s| s.starts_with("DELETE")));
    }
}
