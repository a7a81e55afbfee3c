use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;
use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::Row;

use super::EngineKind;

/// Categorized error types for SQL failures on either engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Syntax errors (SQLSTATE 42601, ORA-009xx parse errors)
    Syntax,
    /// Semantic errors (missing table/column, ambiguous reference)
    Semantic,
    /// Missing grants or quota
    Privilege,
    /// Execution/runtime errors (division by zero, constraint violation)
    Execution,
    /// Transaction state errors (e.g., transaction aborted)
    Transaction,
    /// Connection/communication errors
    Connection,
    /// Unknown or unclassified errors
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Syntax => write!(f, "Syntax Error"),
            ErrorCategory::Semantic => write!(f, "Semantic Error"),
            ErrorCategory::Privilege => write!(f, "Privilege Error"),
            ErrorCategory::Execution => write!(f, "Execution Error"),
            ErrorCategory::Transaction => write!(f, "Transaction Error"),
            ErrorCategory::Connection => write!(f, "Connection Error"),
            ErrorCategory::Unknown => write!(f, "Error"),
        }
    }
}

/// Engine-neutral driver error with as much context as the engine gave us.
#[derive(Debug, Clone)]
pub struct DriverError {
    pub engine: EngineKind,
    pub category: ErrorCategory,
    /// SQLSTATE (e.g. "42703") or Oracle code (e.g. "ORA-00904"); may be empty
    pub code: String,
    /// Primary error message
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    /// Computed line number (1-based) from the error position, if available
    pub line: Option<usize>,
    /// Computed column number (1-based) from the error position, if available
    pub col: Option<usize>,
}

impl DriverError {
    /// Create a DriverError from a tokio_postgres error, using the statement
    /// text to compute line/column from the byte position.
    pub fn from_pg_error(err: &tokio_postgres::Error, sql: &str) -> Self {
        if let Some(db_err) = err.as_db_error() {
            let code = db_err.code().code().to_string();
            let position = db_err.position().and_then(|p| match p {
                tokio_postgres::error::ErrorPosition::Original(pos) => Some(*pos),
                tokio_postgres::error::ErrorPosition::Internal { .. } => None,
            });
            let (line, col) = match position {
                Some(pos) => byte_offset_to_line_col(sql, pos as usize),
                None => (None, None),
            };

            DriverError {
                engine: EngineKind::Postgres,
                category: categorize_sqlstate(&code),
                code,
                message: db_err.message().to_string(),
                detail: db_err.detail().map(|s| s.to_string()),
                hint: db_err.hint().map(|s| s.to_string()),
                line,
                col,
            }
        } else {
            // Non-database error (connection, protocol, etc.)
            let category = if err.is_closed() || err.source().is_some() {
                ErrorCategory::Connection
            } else {
                ErrorCategory::Unknown
            };
            DriverError {
                engine: EngineKind::Postgres,
                category,
                code: String::new(),
                message: err.to_string(),
                detail: err.source().map(|e| e.to_string()),
                hint: None,
                line: None,
                col: None,
            }
        }
    }

    /// Create a DriverError from an Oracle driver error. The driver renders
    /// server errors as `ORA-NNNNN: message`, which is where the code comes from.
    pub fn from_oracle_error(err: &oracle::Error) -> Self {
        Self::from_oracle_message(err.to_string())
    }

    pub(crate) fn from_oracle_message(text: String) -> Self {
        let code = oracle_code(&text).unwrap_or_default();
        let category = if code.is_empty() {
            ErrorCategory::Unknown
        } else {
            categorize_ora(&code)
        };
        let (message, detail) = match text.split_once('\n') {
            Some((first, rest)) if !rest.trim().is_empty() => {
                (first.trim().to_string(), Some(rest.trim().to_string()))
            }
            _ => (text.trim().to_string(), None),
        };
        DriverError {
            engine: EngineKind::Oracle,
            category,
            code,
            message,
            detail,
            hint: None,
            line: None,
            col: None,
        }
    }

    /// Create a simple error from a plain string (for non-database errors).
    pub fn from_string(engine: EngineKind, msg: String) -> Self {
        DriverError {
            engine,
            category: ErrorCategory::Unknown,
            code: String::new(),
            message: msg,
            detail: None,
            hint: None,
            line: None,
            col: None,
        }
    }

    pub fn is_privilege(&self) -> bool {
        self.category == ErrorCategory::Privilege
    }

    /// Format as a rich multi-line string for the report.
    pub fn display_full(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("{}: {}", self.category, self.message));

        if let (Some(line), Some(col)) = (self.line, self.col) {
            lines.push(format!("  at line {}, column {}", line, col));
        }

        if !self.code.is_empty() && !self.message.starts_with(&self.code) {
            lines.push(format!("  Code: {}", self.code));
        }

        if let Some(detail) = &self.detail {
            lines.push(format!("  Detail: {}", detail));
        }

        if let Some(hint) = &self.hint {
            lines.push(format!("  Hint: {}", hint));
        }

        lines.join("\n")
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.code.is_empty() || self.message.starts_with(&self.code) {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{} ({})", self.message, self.code)
        }
    }
}

impl StdError for DriverError {}

/// Convert a 1-based byte offset in a statement to (line, column) both 1-based.
fn byte_offset_to_line_col(sql: &str, byte_pos: usize) -> (Option<usize>, Option<usize>) {
    if byte_pos == 0 || sql.is_empty() {
        return (Some(1), Some(1));
    }
    let target = (byte_pos - 1).min(sql.len());
    let mut line = 1usize;
    let mut col = 1usize;
    for (i, ch) in sql.char_indices() {
        if i >= target {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (Some(line), Some(col))
}

/// Categorize a SQLSTATE code into an ErrorCategory.
fn categorize_sqlstate(code: &str) -> ErrorCategory {
    if code.len() < 2 {
        return ErrorCategory::Unknown;
    }
    match &code[..2] {
        // Class 42: Syntax Error or Access Rule Violation
        "42" => match code {
            "42601" | "42000" => ErrorCategory::Syntax,
            "42501" => ErrorCategory::Privilege,
            // 42P01 = undefined_table, 42703 = undefined_column, etc.
            _ => ErrorCategory::Semantic,
        },
        "22" | "23" | "53" | "54" | "55" | "57" => ErrorCategory::Execution,
        "25" | "40" => ErrorCategory::Transaction,
        "08" => ErrorCategory::Connection,
        _ => ErrorCategory::Unknown,
    }
}

/// Categorize an `ORA-NNNNN` code.
fn categorize_ora(code: &str) -> ErrorCategory {
    let number: u32 = match code.trim_start_matches("ORA-").parse() {
        Ok(n) => n,
        Err(_) => return ErrorCategory::Unknown,
    };
    match number {
        1031 | 1950 | 1536 | 1045 => ErrorCategory::Privilege,
        904 | 942 | 918 | 955 | 2289 | 4043 => ErrorCategory::Semantic,
        900..=999 | 1756 | 1740 => ErrorCategory::Syntax,
        1 | 1400 | 1407 | 1438 | 1476 | 1722 | 1830 | 1840 | 1841 | 1843 | 1847 | 1858 | 1861
        | 2290 | 2291 | 2292 | 1013 => ErrorCategory::Execution,
        1002 | 8177 | 60 => ErrorCategory::Transaction,
        3113 | 3114 | 3135 | 12154 | 12170 | 12514 | 12541 | 12543 => ErrorCategory::Connection,
        _ => ErrorCategory::Unknown,
    }
}

/// Find the first `ORA-NNNNN` token in a driver message.
fn oracle_code(text: &str) -> Option<String> {
    let start = text.find("ORA-")?;
    let digits: String = text[start + 4..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.len() == 5 {
        Some(format!("ORA-{digits}"))
    } else {
        None
    }
}

/// A bounded window onto a statement's result set.
#[derive(Debug, Clone)]
pub struct ResultPreview {
    pub columns: Vec<ColumnInfo>,
    /// At most `limit` rows.
    pub rows: Vec<Vec<CellValue>>,
    /// Rows the statement produced in total, including those not kept.
    pub total_rows: u64,
    pub execution_time: Duration,
    /// Set for statements that do not return rows (DML/DDL).
    pub affected_rows: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    /// Canonical (lowercase where the engine folded it) label.
    pub name: String,
    pub type_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Decimal(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Interval(String),
    Json(serde_json::Value),
    Unknown(String),
}

impl CellValue {
    pub fn display(&self) -> String {
        match self {
            CellValue::Null => "NULL".to_string(),
            CellValue::Bool(b) => b.to_string(),
            CellValue::Int16(i) => i.to_string(),
            CellValue::Int32(i) => i.to_string(),
            CellValue::Int64(i) => i.to_string(),
            CellValue::Float32(f) => f.to_string(),
            CellValue::Float64(f) => f.to_string(),
            CellValue::Decimal(d) => d.to_string(),
            CellValue::Text(s) => s.clone(),
            CellValue::Bytes(b) => format!("[{} bytes]", b.len()),
            CellValue::Date(d) => d.to_string(),
            CellValue::Time(t) => t.to_string(),
            CellValue::DateTime(dt) => dt.to_string(),
            CellValue::TimestampTz(dt) => dt.to_string(),
            CellValue::Interval(s) => s.clone(),
            CellValue::Json(j) => j.to_string(),
            CellValue::Unknown(s) => s.clone(),
        }
    }

    pub fn display_width(&self) -> usize {
        unicode_width::UnicodeWidthStr::width(self.display().as_str())
    }
}

impl ResultPreview {
    pub fn empty() -> Self {
        Self {
            columns: vec![],
            rows: vec![],
            total_rows: 0,
            execution_time: Duration::ZERO,
            affected_rows: None,
        }
    }

    pub fn returns_rows(&self) -> bool {
        self.affected_rows.is_none()
    }

    /// Rows that were produced but not kept.
    pub fn truncated_rows(&self) -> u64 {
        self.total_rows.saturating_sub(self.rows.len() as u64)
    }
}

/// Accumulates rows into a preview, keeping at most `limit`.
#[derive(Debug)]
pub(crate) struct PreviewBuilder {
    limit: usize,
    rows: Vec<Vec<CellValue>>,
    total: u64,
}

impl PreviewBuilder {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            limit,
            rows: Vec::with_capacity(limit.min(64)),
            total: 0,
        }
    }

    /// Whether the next row will be kept; lets callers skip decoding.
    pub(crate) fn wants_row(&self) -> bool {
        self.rows.len() < self.limit
    }

    pub(crate) fn push(&mut self, row: Vec<CellValue>) {
        if self.wants_row() {
            self.rows.push(row);
        }
        self.total += 1;
    }

    pub(crate) fn skip(&mut self) {
        self.total += 1;
    }

    pub(crate) fn finish(
        self,
        columns: Vec<ColumnInfo>,
        execution_time: Duration,
        affected_rows: Option<u64>,
    ) -> ResultPreview {
        ResultPreview {
            columns,
            rows: self.rows,
            total_rows: self.total,
            execution_time,
            affected_rows,
        }
    }
}

pub(crate) fn pg_row_values(row: &Row) -> Vec<CellValue> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| extract_value(row, i, col.type_()))
        .collect()
}

/// PostgreSQL `interval` in its binary wire form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PgInterval {
    pub months: i32,
    pub days: i32,
    pub micros: i64,
}

impl<'a> FromSql<'a> for PgInterval {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn StdError + Sync + Send>> {
        if raw.len() != 16 {
            return Err(format!("invalid interval length {}", raw.len()).into());
        }
        let mut micros = [0u8; 8];
        let mut days = [0u8; 4];
        let mut months = [0u8; 4];
        micros.copy_from_slice(&raw[0..8]);
        days.copy_from_slice(&raw[8..12]);
        months.copy_from_slice(&raw[12..16]);
        Ok(PgInterval {
            months: i32::from_be_bytes(months),
            days: i32::from_be_bytes(days),
            micros: i64::from_be_bytes(micros),
        })
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::INTERVAL
    }
}

impl fmt::Display for PgInterval {
    /// Mirrors PostgreSQL's default `postgres` interval style.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        let years = self.months / 12;
        let months = self.months % 12;
        if years != 0 {
            parts.push(plural(years as i64, "year"));
        }
        if months != 0 {
            parts.push(plural(months as i64, "mon"));
        }
        if self.days != 0 {
            parts.push(plural(self.days as i64, "day"));
        }
        if self.micros != 0 || parts.is_empty() {
            let sign = if self.micros < 0 { "-" } else { "" };
            let total = self.micros.unsigned_abs();
            let secs = total / 1_000_000;
            let frac = total % 1_000_000;
            let mut clock = format!(
                "{sign}{:02}:{:02}:{:02}",
                secs / 3600,
                (secs / 60) % 60,
                secs % 60
            );
            if frac != 0 {
                clock.push_str(format!(".{frac:06}").trim_end_matches('0'));
            }
            parts.push(clock);
        }
        write!(f, "{}", parts.join(" "))
    }
}

fn plural(n: i64, unit: &str) -> String {
    if n == 1 {
        format!("{n} {unit}")
    } else {
        format!("{n} {unit}s")
    }
}

/// NUMERIC in its exact text form, for values `Decimal` cannot hold
/// (NaN, infinities, more than 28 significant digits).
struct PgNumericText(String);

impl<'a> FromSql<'a> for PgNumericText {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn StdError + Sync + Send>> {
        numeric_text(raw)
            .map(PgNumericText)
            .ok_or_else(|| "malformed numeric value".into())
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

/// Binary NUMERIC: ndigits, weight, sign, dscale, then base-10000 digits.
fn numeric_text(raw: &[u8]) -> Option<String> {
    let word = |i: usize| {
        raw.get(i * 2..i * 2 + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
    };
    let ndigits = word(0)? as usize;
    let weight = word(1)? as i16 as i32;
    let sign = word(2)?;
    let dscale = word(3)? as usize;
    let negative = match sign {
        0x0000 => false,
        0x4000 => true,
        0xC000 => return Some("NaN".to_string()),
        0xD000 => return Some("Infinity".to_string()),
        0xF000 => return Some("-Infinity".to_string()),
        _ => return None,
    };
    let digits = (0..ndigits)
        .map(|i| word(4 + i))
        .collect::<Option<Vec<u16>>>()?;
    let digit = |i: i32| {
        usize::try_from(i)
            .ok()
            .and_then(|i| digits.get(i).copied())
            .unwrap_or(0)
    };

    let mut text = String::new();
    if negative {
        text.push('-');
    }
    if weight < 0 {
        text.push('0');
    } else {
        text.push_str(&digit(0).to_string());
        for i in 1..=weight {
            text.push_str(&format!("{:04}", digit(i)));
        }
    }
    if dscale > 0 {
        let mut frac = String::new();
        let mut i = weight + 1;
        while frac.len() < dscale {
            frac.push_str(&format!("{:04}", digit(i)));
            i += 1;
        }
        frac.truncate(dscale);
        text.push('.');
        text.push_str(&frac);
    }
    Some(text)
}

fn extract_value(row: &Row, idx: usize, pg_type: &Type) -> CellValue {
    fn get<'a, T: FromSql<'a>>(
        row: &'a Row,
        idx: usize,
        pg_type: &Type,
        wrap: fn(T) -> CellValue,
    ) -> CellValue {
        match row.try_get::<_, Option<T>>(idx) {
            Ok(Some(value)) => wrap(value),
            Ok(None) => CellValue::Null,
            Err(e) => {
                tracing::debug!(column = idx, pg_type = %pg_type.name(), error = %e, "cell decode failed");
                undecodable(row, idx, pg_type)
            }
        }
    }

    match *pg_type {
        Type::BOOL => get(row, idx, pg_type, CellValue::Bool),
        Type::INT2 => get(row, idx, pg_type, CellValue::Int16),
        Type::INT4 => get(row, idx, pg_type, CellValue::Int32),
        Type::INT8 => get(row, idx, pg_type, CellValue::Int64),
        Type::FLOAT4 => get(row, idx, pg_type, CellValue::Float32),
        Type::FLOAT8 => get(row, idx, pg_type, CellValue::Float64),
        Type::NUMERIC => get(row, idx, pg_type, CellValue::Decimal),
        Type::TEXT | Type::VARCHAR | Type::NAME | Type::CHAR | Type::BPCHAR => {
            get(row, idx, pg_type, CellValue::Text)
        }
        Type::BYTEA => get(row, idx, pg_type, CellValue::Bytes),
        Type::DATE => get(row, idx, pg_type, CellValue::Date),
        Type::TIME => get(row, idx, pg_type, CellValue::Time),
        Type::TIMESTAMP => get(row, idx, pg_type, CellValue::DateTime),
        Type::TIMESTAMPTZ => get(row, idx, pg_type, CellValue::TimestampTz),
        Type::INTERVAL => get(row, idx, pg_type, |i: PgInterval| {
            CellValue::Interval(i.to_string())
        }),
        Type::JSON | Type::JSONB => get(row, idx, pg_type, CellValue::Json),
        _ => match row.try_get::<_, Option<String>>(idx) {
            Ok(value) => value.map_or(CellValue::Null, CellValue::Text),
            Err(_) => CellValue::Unknown(format!("<{}>", pg_type.name())),
        },
    }
}

/// A non-NULL value the typed decoder rejected. Never shown as NULL.
fn undecodable(row: &Row, idx: usize, pg_type: &Type) -> CellValue {
    if *pg_type == Type::NUMERIC {
        if let Ok(Some(PgNumericText(text))) = row.try_get::<_, Option<PgNumericText>>(idx) {
            return CellValue::Text(text);
        }
    }
    CellValue::Unknown(format!("<{}: undecodable>", pg_type.name()))
}
