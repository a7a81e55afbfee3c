use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use std::fmt;
use std::time::Duration;

use super::{DriverError, EngineKind};
use crate::model::{ColumnType, Entity};

/// A literal value rendered into generated SQL (fixtures, DDL defaults).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    Interval(Duration),
    Decimal(Decimal),
}

/// SQL syntax and type-mapping conventions of one engine.
///
/// Only generated SQL goes through a dialect. User statements are sent
/// verbatim.
pub trait Dialect: Send + Sync + fmt::Debug {
    fn kind(&self) -> EngineKind;

    /// Case an unquoted identifier resolves to on this engine.
    fn fold_identifier(&self, ident: &str) -> String;

    /// Quoted form of a canonical name that matches its unquoted resolution.
    fn quote_identifier(&self, ident: &str) -> String {
        format!("\"{}\"", self.fold_identifier(ident).replace('"', "\"\""))
    }

    /// Report label for a result column.
    fn canonical_label(&self, label: &str) -> String {
        label.to_string()
    }

    fn column_type(&self, ty: ColumnType) -> String;

    fn identity_clause(&self) -> &'static str {
        "GENERATED BY DEFAULT AS IDENTITY"
    }

    fn render_date(&self, date: NaiveDate) -> String {
        format!("DATE '{}'", date.format("%Y-%m-%d"))
    }

    fn render_timestamp(&self, ts: NaiveDateTime) -> String {
        format!("TIMESTAMP '{}'", ts.format("%Y-%m-%d %H:%M:%S"))
    }

    fn render_interval(&self, duration: Duration) -> String;

    fn render_literal(&self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
            Value::Date(d) => self.render_date(*d),
            Value::Timestamp(ts) => self.render_timestamp(*ts),
            Value::Interval(d) => self.render_interval(*d),
            Value::Decimal(d) => d.to_string(),
        }
    }

    /// Rows sent per multi-row INSERT.
    fn insert_chunk_size(&self) -> usize;

    /// One multi-row INSERT for `rows`, one row per line.
    fn insert_rows(&self, table: &str, columns: &[&str], rows: &[Vec<Value>]) -> String;

    fn create_table(&self, entity: &Entity) -> String {
        let mut parts = Vec::new();
        for column in entity.columns {
            let mut def = format!(
                "    {} {}",
                self.quote_identifier(column.name),
                self.column_type(column.ty)
            );
            if column.identity {
                def.push(' ');
                def.push_str(self.identity_clause());
            } else if !column.nullable {
                def.push_str(" NOT NULL");
            }
            parts.push(def);
        }
        if !entity.primary_key.is_empty() {
            parts.push(format!(
                "    CONSTRAINT {} PRIMARY KEY ({})",
                self.quote_identifier(&entity.primary_key_name()),
                self.column_list(entity.primary_key)
            ));
        }
        for fk in entity.foreign_keys {
            parts.push(format!(
                "    CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
                self.quote_identifier(fk.name),
                self.quote_identifier(fk.column),
                self.quote_identifier(fk.references),
                self.quote_identifier(fk.referenced_column)
            ));
        }
        for check in entity.checks {
            parts.push(format!(
                "    CONSTRAINT {} CHECK ({})",
                self.quote_identifier(check.name),
                check.expression
            ));
        }
        format!(
            "CREATE TABLE {} (\n{}\n)",
            self.quote_identifier(entity.name),
            parts.join(",\n")
        )
    }

    fn column_list(&self, columns: &[&str]) -> String {
        columns
            .iter()
            .map(|c| self.quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn delete_all(&self, table: &str) -> String {
        format!("DELETE FROM {}", self.quote_identifier(table))
    }

    /// DROP that tolerates an absent table, together with
    /// [`Dialect::is_missing_table`] where the engine has no IF EXISTS.
    fn drop_table(&self, table: &str) -> String;

    fn set_default_schema(&self, schema: &str) -> String;

    /// Move the identity generator of `table.column` past the highest
    /// explicit id, so later inserts without an id do not collide.
    fn restart_identity(&self, table: &str, column: &str) -> String;

    fn is_missing_table(&self, err: &DriverError) -> bool;

    fn is_already_exists(&self, err: &DriverError) -> bool;

    fn is_privilege_error(&self, err: &DriverError) -> bool;

    /// Grants that let `user` create the harness tables.
    fn grant_hint(&self, user: &str, schema: Option<&str>) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn kind(&self) -> EngineKind {
        EngineKind::Postgres
    }

    fn fold_identifier(&self, ident: &str) -> String {
        ident.to_lowercase()
    }

    fn column_type(&self, ty: ColumnType) -> String {
        match ty {
            ColumnType::Integer => "INTEGER".to_string(),
            ColumnType::Text(n) => format!("VARCHAR({n})"),
            ColumnType::Date => "DATE".to_string(),
            ColumnType::Timestamp => "TIMESTAMP".to_string(),
            ColumnType::Interval => "INTERVAL".to_string(),
            ColumnType::Money { precision, scale } => format!("NUMERIC({precision},{scale})"),
        }
    }

    fn render_interval(&self, duration: Duration) -> String {
        format!("INTERVAL '{} seconds'", duration.as_secs())
    }

    fn insert_chunk_size(&self) -> usize {
        500
    }

    fn insert_rows(&self, table: &str, columns: &[&str], rows: &[Vec<Value>]) -> String {
        let tuples: Vec<String> = rows
            .iter()
            .map(|row| format!("({})", render_row(self, row)))
            .collect();
        format!(
            "INSERT INTO {} ({}) VALUES\n{}",
            self.quote_identifier(table),
            self.column_list(columns),
            tuples.join(",\n")
        )
    }

    fn drop_table(&self, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {} CASCADE", self.quote_identifier(table))
    }

    fn set_default_schema(&self, schema: &str) -> String {
        format!("SET search_path TO {}", self.quote_identifier(schema))
    }

    fn restart_identity(&self, table: &str, column: &str) -> String {
        let quoted_table = self.quote_identifier(table);
        format!(
            "SELECT setval(pg_get_serial_sequence('{}', '{}'), COALESCE(MAX({}), 0) + 1, false) FROM {}",
            quoted_table.replace('\'', "''"),
            self.fold_identifier(column).replace('\'', "''"),
            self.quote_identifier(column),
            quoted_table
        )
    }

    fn is_missing_table(&self, err: &DriverError) -> bool {
        err.code == "42P01"
    }

    fn is_already_exists(&self, err: &DriverError) -> bool {
        err.code == "42P07"
    }

    fn is_privilege_error(&self, err: &DriverError) -> bool {
        err.code == "42501"
    }

    fn grant_hint(&self, user: &str, schema: Option<&str>) -> String {
        let schema = schema.unwrap_or("public");
        format!(
            "GRANT USAGE, CREATE ON SCHEMA {} TO {};",
            self.quote_identifier(schema),
            self.quote_identifier(user)
        )
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OracleDialect;

impl Dialect for OracleDialect {
    fn kind(&self) -> EngineKind {
        EngineKind::Oracle
    }

    fn fold_identifier(&self, ident: &str) -> String {
        ident.to_uppercase()
    }

    /// Oracle reports unquoted labels in uppercase; a label with any
    /// lowercase letter was quoted by the user and is kept.
    fn canonical_label(&self, label: &str) -> String {
        if label.chars().any(|c| c.is_lowercase()) {
            label.to_string()
        } else {
            label.to_lowercase()
        }
    }

    fn column_type(&self, ty: ColumnType) -> String {
        match ty {
            ColumnType::Integer => "NUMBER(10)".to_string(),
            ColumnType::Text(n) => format!("VARCHAR2({n} CHAR)"),
            ColumnType::Date => "DATE".to_string(),
            ColumnType::Timestamp => "TIMESTAMP".to_string(),
            ColumnType::Interval => "INTERVAL DAY(2) TO SECOND(6)".to_string(),
            ColumnType::Money { precision, scale } => format!("NUMBER({precision},{scale})"),
        }
    }

    fn render_interval(&self, duration: Duration) -> String {
        let secs = duration.as_secs();
        format!(
            "INTERVAL '{} {:02}:{:02}:{:02}' DAY TO SECOND",
            secs / 86_400,
            (secs / 3600) % 24,
            (secs / 60) % 60,
            secs % 60
        )
    }

    fn insert_chunk_size(&self) -> usize {
        200
    }

    fn insert_rows(&self, table: &str, columns: &[&str], rows: &[Vec<Value>]) -> String {
        let target = format!(
            "INTO {} ({}) VALUES",
            self.quote_identifier(table),
            self.column_list(columns)
        );
        let mut sql = String::from("INSERT ALL\n");
        for row in rows {
            sql.push_str(&target);
            sql.push_str(" (");
            sql.push_str(&render_row(self, row));
            sql.push_str(")\n");
        }
        sql.push_str("SELECT 1 FROM DUAL");
        sql
    }

    fn drop_table(&self, table: &str) -> String {
        format!("DROP TABLE {} CASCADE CONSTRAINTS", self.quote_identifier(table))
    }

    fn set_default_schema(&self, schema: &str) -> String {
        format!(
            "ALTER SESSION SET CURRENT_SCHEMA = {}",
            self.quote_identifier(schema)
        )
    }

    fn restart_identity(&self, table: &str, column: &str) -> String {
        format!(
            "ALTER TABLE {} MODIFY {} GENERATED BY DEFAULT AS IDENTITY (START WITH LIMIT VALUE)",
            self.quote_identifier(table),
            self.quote_identifier(column)
        )
    }

    fn is_missing_table(&self, err: &DriverError) -> bool {
        err.code == "ORA-00942"
    }

    fn is_already_exists(&self, err: &DriverError) -> bool {
        err.code == "ORA-00955"
    }

    fn is_privilege_error(&self, err: &DriverError) -> bool {
        matches!(err.code.as_str(), "ORA-01031" | "ORA-01950" | "ORA-01536")
    }

    fn grant_hint(&self, user: &str, _schema: Option<&str>) -> String {
        let user = self.fold_identifier(user);
        format!(
            "GRANT CREATE SESSION, CREATE TABLE TO {user}; ALTER USER {user} QUOTA UNLIMITED ON USERS;"
        )
    }
}

fn render_row(dialect: &dyn Dialect, row: &[Value]) -> String {
    row.iter()
        .map(|v| dialect.render_literal(v))
        .collect::<Vec<_>>()
        .join(", ")
}
