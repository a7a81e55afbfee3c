use sqlparser::ast as sp;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser as SqlParser;
use thiserror::Error;

use crate::db::{DriverError, EngineKind, EngineSession, ResultPreview};
use crate::explain::{is_explain_query, parse_plan, QueryPlan};

/// A statement that failed on one engine. Isolated: the run goes on.
#[derive(Debug, Clone, Error)]
#[error("[{engine}] {file}: {error}")]
pub struct ExecutionError {
    pub file: String,
    pub engine: EngineKind,
    #[source]
    pub error: DriverError,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlanText {
    /// Plan text exactly as the engine printed it.
    Native {
        text: String,
        plan: Option<QueryPlan>,
    },
    Unavailable {
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Execution {
    pub preview: ResultPreview,
    pub plan: PlanText,
}

/// Execute `statement` keeping at most `preview_limit` rows, then ask for its
/// plan in a separate round trip. A failed plan request never fails the
/// execution.
pub async fn execute(
    session: &mut dyn EngineSession,
    file: &str,
    statement: &str,
    preview_limit: usize,
) -> Result<Execution, ExecutionError> {
    let engine = session.kind();
    tracing::debug!(engine = %engine, file, sql = statement, "executing");

    let preview = session
        .query_preview(statement, preview_limit)
        .await
        .map_err(|error| ExecutionError {
            file: file.to_string(),
            engine,
            error,
        })?;

    let plan = if is_explain_query(statement) {
        PlanText::Unavailable {
            reason: "statement is itself a plan request".to_string(),
        }
    } else {
        match explain_rolled_back(session, statement).await {
            Ok(text) => PlanText::Native {
                plan: parse_plan(engine, &text),
                text,
            },
            Err(e) => {
                tracing::warn!(engine = %engine, file, error = %e, "plan unavailable");
                PlanText::Unavailable {
                    reason: e.to_string(),
                }
            }
        }
    };

    Ok(Execution { preview, plan })
}

/// Ask for the plan of `statement`. An analyzed plan runs the statement
/// again, so it goes inside a transaction that is always rolled back:
/// `SELECT nextval(..)` or a volatile function must not write twice.
async fn explain_rolled_back(
    session: &mut dyn EngineSession,
    statement: &str,
) -> Result<String, DriverError> {
    if !is_read_only(statement) {
        return session.explain(statement, false).await;
    }
    session.begin().await?;
    let result = session.explain(statement, true).await;
    if let Err(e) = session.rollback().await {
        tracing::warn!(engine = %session.kind(), error = %e, "rollback after plan failed");
    }
    result
}

/// Whether running `sql` a second time (for an analyzed plan) is harmless.
pub fn is_read_only(sql: &str) -> bool {
    match SqlParser::parse_sql(&PostgreSqlDialect {}, sql) {
        Ok(statements) if !statements.is_empty() => statements.iter().all(statement_is_read_only),
        _ => leading_keyword_is_read_only(sql),
    }
}

fn statement_is_read_only(statement: &sp::Statement) -> bool {
    match statement {
        sp::Statement::Query(query) => query_is_read_only(query),
        _ => false,
    }
}

fn query_is_read_only(query: &sp::Query) -> bool {
    let ctes_read_only = query.with.as_ref().map_or(true, |with| {
        with.cte_tables
            .iter()
            .all(|cte| query_is_read_only(&cte.query))
    });
    ctes_read_only && query.locks.is_empty() && set_expr_is_read_only(&query.body)
}

fn set_expr_is_read_only(expr: &sp::SetExpr) -> bool {
    match expr {
        sp::SetExpr::Select(select) => select.into.is_none(),
        sp::SetExpr::Query(query) => query_is_read_only(query),
        sp::SetExpr::SetOperation { left, right, .. } => {
            set_expr_is_read_only(left) && set_expr_is_read_only(right)
        }
        sp::SetExpr::Values(_) | sp::SetExpr::Table(_) => true,
        _ => false,
    }
}

const WRITE_KEYWORDS: [&str; 9] = [
    "INSERT", "UPDATE", "DELETE", "MERGE", "CREATE", "DROP", "ALTER", "TRUNCATE", "INTO",
];

/// Fallback for text the parser does not understand (Oracle-only syntax).
fn leading_keyword_is_read_only(sql: &str) -> bool {
    let code = strip_leading_comments(sql);
    let upper = code.to_uppercase();
    let words: Vec<&str> = upper
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .collect();
    match words.first().copied() {
        Some("SELECT") | Some("WITH") => !words.iter().any(|w| WRITE_KEYWORDS.contains(w)),
        Some("VALUES") | Some("TABLE") | Some("SHOW") => true,
        _ => false,
    }
}

fn strip_leading_comments(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map_or("", |(_, tail)| tail).trim_start();
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map_or("", |(_, tail)| tail).trim_start();
        } else {
            return rest;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fake::{int_preview, FakeEngine};

    #[test]
    fn test_read_only_classification() {
        assert!(is_read_only("SELECT COUNT(*) AS n FROM groupe"));
        assert!(is_read_only(
            "WITH t AS (SELECT id_groupe FROM groupe) SELECT * FROM t"
        ));
        assert!(is_read_only("SELECT 1 UNION SELECT 2"));
        assert!(!is_read_only("UPDATE groupe SET style = 'Rock'"));
        assert!(!is_read_only("DELETE FROM concert WHERE id_concert = 1"));
        assert!(!is_read_only("SELECT * INTO copie FROM groupe"));
        assert!(!is_read_only("SELECT * FROM groupe FOR UPDATE"));
        assert!(!is_read_only(
            "WITH d AS (DELETE FROM sponsoring RETURNING *) SELECT * FROM d"
        ));
        assert!(!is_read_only("CREATE TABLE t (id INTEGER)"));
    }

    #[test]
    fn test_read_only_fallback_for_unparsed_text() {
        assert!(is_read_only(
            "-- hierarchy\nSELECT LEVEL FROM dual CONNECT BY LEVEL <= 3 MODEL RETURN ALL ROWS"
        ));
        assert!(!is_read_only("MERGE INTO groupe g USING dual ON (1 = 1) WHEN MATCHED THEN UPDATE SET g.style = 'x'"));
        assert!(!is_read_only("BEGIN dbms_stats.gather_schema_stats(USER); END"));
    }

    #[test]
    fn test_strip_leading_comments() {
        assert_eq!(strip_leading_comments("/* a */ -- b\n SELECT 1"), "SELECT 1");
        assert_eq!(strip_leading_comments("-- only"), "");
    }

    #[tokio::test]
    async fn test_preview_is_bounded_and_plan_present() {
        let values: Vec<i64> = (1..=100).collect();
        let engine = FakeEngine::new(EngineKind::Postgres)
            .preview_for("FROM concert", int_preview("id_concert", &values, 100));
        let mut session = engine.session();

        let exec = execute(&mut session, "02_concerts.sql", "SELECT id_concert FROM concert", 5)
            .await
            .unwrap();

        assert_eq!(exec.preview.rows.len(), 5);
        assert_eq!(exec.preview.total_rows, 100);
        assert_eq!(exec.preview.truncated_rows(), 95);
        match &exec.plan {
            PlanText::Native { text, plan } => {
                assert!(!text.is_empty());
                assert_eq!(plan.as_ref().map(|p| p.relations()), Some(vec!["groupe"]));
            }
            other => panic!("expected a native plan, got {other:?}"),
        }
        assert!(engine
            .log()
            .contains(&"EXPLAIN[analyze] SELECT id_concert FROM concert".to_string()));
    }

    #[tokio::test]
    async fn test_volatile_select_plan_is_rolled_back() {
        let engine = FakeEngine::new(EngineKind::Postgres);
        let mut session = engine.session();
        let sql = "SELECT nextval(pg_get_serial_sequence('groupe', 'id_groupe'))";
        execute(&mut session, "07_sequence.sql", sql, 5).await.unwrap();

        assert_eq!(
            engine.log(),
            vec![
                sql.to_string(),
                "BEGIN".to_string(),
                format!("EXPLAIN[analyze] {sql}"),
                "ROLLBACK".to_string(),
            ]
        );
        assert_eq!(engine.state().rollbacks, 1);
        assert_eq!(engine.state().commits, 0);
        assert!(!engine.state().in_transaction);
    }

    #[tokio::test]
    async fn test_failed_analyzed_plan_still_rolls_back() {
        let engine = FakeEngine::new(EngineKind::Postgres).fail_explain("permission denied");
        let mut session = engine.session();
        let exec = execute(&mut session, "08_fn.sql", "SELECT audit_touch()", 5)
            .await
            .unwrap();
        assert!(matches!(exec.plan, PlanText::Unavailable { .. }));
        assert_eq!(engine.log().last().map(String::as_str), Some("ROLLBACK"));
    }

    #[tokio::test]
    async fn test_dml_is_explained_without_analyze() {
        let engine = FakeEngine::new(EngineKind::Postgres).with_table("groupe");
        let mut session = engine.session();
        let sql = "DELETE FROM \"groupe\"";
        let exec = execute(&mut session, "03_purge.sql", sql, 5).await.unwrap();

        assert_eq!(exec.preview.affected_rows, Some(0));
        let log = engine.log();
        assert_eq!(log.iter().filter(|s| s.as_str() == sql).count(), 1);
        assert!(log.contains(&format!("EXPLAIN[plain] {sql}")));
        assert!(!log.contains(&"BEGIN".to_string()));
    }

    #[tokio::test]
    async fn test_failed_plan_keeps_successful_execution() {
        let engine = FakeEngine::new(EngineKind::Oracle)
            .fail_explain("ORA-00942: table or view does not exist");
        let mut session = engine.session();
        let exec = execute(&mut session, "04_ddl.sql", "SELECT 1 FROM dual", 5)
            .await
            .unwrap();
        match exec.plan {
            PlanText::Unavailable { reason } => assert!(reason.contains("ORA-00942")),
            other => panic!("expected an unavailable plan, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_statement_failure_names_file_and_engine() {
        let engine = FakeEngine::new(EngineKind::Oracle).fail_on(
            "nom_de_scene",
            "ORA-00904",
            "ORA-00904: \"NOM_DE_SCENE\": invalid identifier",
        );
        let mut session = engine.session();
        let err = execute(&mut session, "05_scenes.sql", "SELECT nom_de_scene FROM scene", 5)
            .await
            .unwrap_err();
        assert_eq!(err.file, "05_scenes.sql");
        assert_eq!(err.engine, EngineKind::Oracle);
        assert_eq!(err.error.code, "ORA-00904");
        assert!(err.to_string().starts_with("[oracle] 05_scenes.sql: ORA-00904"));
        assert!(!engine.log().iter().any(|s| s.starts_with("EXPLAIN")));
    }

    #[tokio::test]
    async fn test_explain_statement_is_not_explained_again() {
        let engine = FakeEngine::new(EngineKind::Postgres);
        let mut session = engine.session();
        let exec = execute(&mut session, "06_plan.sql", "EXPLAIN SELECT 1", 5)
            .await
            .unwrap();
        assert!(matches!(exec.plan, PlanText::Unavailable { .. }));
        assert_eq!(engine.log(), vec!["EXPLAIN SELECT 1".to_string()]);
    }
}
