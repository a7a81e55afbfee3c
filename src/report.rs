use std::io::{self, Write};
use std::path::Path;

use crossterm::style::{Color, Stylize};
use crossterm::tty::IsTty;
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::db::{EngineKind, ResultPreview, SchemaReport};
use crate::executor::{Execution, ExecutionError, PlanText};
use crate::explain::{format_duration_ms, rows_mismatch, QueryPlan};
use crate::loader::{LoadError, Request};
use crate::orchestrator::{FatalFailure, RunSummary};
use crate::seed::RowCounts;

/// Widest a preview column may get before cells are cut.
const MAX_CELL_WIDTH: usize = 40;

pub struct Presenter<W: Write> {
    out: W,
    color: bool,
}

impl Presenter<io::Stdout> {
    pub fn stdout(no_color: bool) -> Self {
        let out = io::stdout();
        let color = !no_color && out.is_tty();
        Self::new(out, color)
    }
}

impl<W: Write> Presenter<W> {
    pub fn new(out: W, color: bool) -> Self {
        Self { out, color }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn paint(&self, text: &str, color: Color) -> String {
        if self.color {
            text.with(color).to_string()
        } else {
            text.to_string()
        }
    }

    fn strong(&self, text: &str, color: Color) -> String {
        if self.color {
            text.with(color).bold().to_string()
        } else {
            text.to_string()
        }
    }

    fn label(&self, engine: EngineKind) -> String {
        let color = match engine {
            EngineKind::Postgres => Color::Cyan,
            EngineKind::Oracle => Color::Magenta,
        };
        self.strong(&format!("[{engine}]"), color)
    }

    pub fn run_header(&mut self, dir: &Path) -> io::Result<()> {
        let title = format!("== requests from {} ==", dir.display());
        writeln!(self.out, "{}", self.strong(&title, Color::White))
    }

    pub fn request_header(&mut self, request: &Request) -> io::Result<()> {
        let title = format!("### {}", request.display_name());
        writeln!(self.out)?;
        writeln!(self.out, "{}", self.strong(&title, Color::Yellow))
    }

    pub fn schema_verified(&mut self, engine: EngineKind, report: &SchemaReport) -> io::Result<()> {
        writeln!(
            self.out,
            "{} schema: {} created, {} existing",
            self.label(engine),
            report.created.len(),
            report.existing.len()
        )
    }

    pub fn seeded(&mut self, engine: EngineKind, counts: &RowCounts) -> io::Result<()> {
        let tables: Vec<String> = counts
            .0
            .iter()
            .map(|(table, n)| format!("{table} {n}"))
            .collect();
        writeln!(
            self.out,
            "{} seeded {} rows ({})",
            self.label(engine),
            counts.total(),
            tables.join(", ")
        )
    }

    pub fn reset_done(&mut self, engine: EngineKind, dropped: &[String]) -> io::Result<()> {
        if dropped.is_empty() {
            writeln!(self.out, "{} nothing to drop", self.label(engine))
        } else {
            writeln!(
                self.out,
                "{} dropped {} table(s): {}",
                self.label(engine),
                dropped.len(),
                dropped.join(", ")
            )
        }
    }

    /// One engine's section for one file: counts, preview, plan.
    pub fn present(&mut self, file: &str, engine: EngineKind, execution: &Execution) -> io::Result<()> {
        tracing::trace!(file, engine = %engine, "presenting");
        let preview = &execution.preview;
        writeln!(self.out, "{} {}", self.label(engine), headline(preview))?;
        if preview.returns_rows() {
            for line in preview_lines(preview) {
                writeln!(self.out, "{line}")?;
            }
        }
        self.plan(&execution.plan)
    }

    fn plan(&mut self, plan: &PlanText) -> io::Result<()> {
        match plan {
            PlanText::Native { text, plan } => {
                if let Some(plan) = plan {
                    let summary = plan_summary(plan);
                    writeln!(self.out, "{}", self.paint(&summary, Color::Green))?;
                    for node in plan.root.walk().into_iter().filter(|n| rows_mismatch(n)) {
                        if let (Some(est), Some(actual)) = (node.estimated_rows, node.actual_rows) {
                            let warning =
                                format!("⚠ {}: est={} actual={}", node.node_type, est, actual);
                            writeln!(self.out, "{}", self.paint(&warning, Color::Yellow))?;
                        }
                    }
                }
                writeln!(self.out, "{}", text.trim_end())
            }
            PlanText::Unavailable { reason } => {
                let line = format!("plan unavailable: {reason}");
                writeln!(self.out, "{}", self.paint(&line, Color::Yellow))
            }
        }
    }

    pub fn execution_error(&mut self, error: &ExecutionError) -> io::Result<()> {
        let title = format!("error in {}", error.file);
        writeln!(
            self.out,
            "{} {}",
            self.label(error.engine),
            self.strong(&title, Color::Red)
        )?;
        for line in error.error.display_full().lines() {
            writeln!(self.out, "  {}", self.paint(line, Color::Red))?;
        }
        Ok(())
    }

    pub fn skipped(&mut self, engine: EngineKind) -> io::Result<()> {
        writeln!(
            self.out,
            "{} {}",
            self.label(engine),
            self.paint("skipped: no statement for this engine", Color::DarkGrey)
        )
    }

    pub fn rejected(&mut self, error: &LoadError) -> io::Result<()> {
        writeln!(self.out)?;
        let line = format!("rejected {error}");
        writeln!(self.out, "{}", self.strong(&line, Color::Red))
    }

    pub fn summary(&mut self, summary: &RunSummary) -> io::Result<()> {
        writeln!(self.out)?;
        let title = format!("== summary: {} request(s) ==", summary.requests);
        writeln!(self.out, "{}", self.strong(&title, Color::White))?;
        for engine in EngineKind::ALL {
            let tally = summary.tally(engine);
            writeln!(
                self.out,
                "{:<9} {} ok, {} failed, {} skipped",
                format!("{engine}:"),
                tally.succeeded,
                tally.failed,
                tally.skipped
            )?;
        }
        if !summary.failures.is_empty() {
            writeln!(self.out, "failures:")?;
            for failure in &summary.failures {
                writeln!(self.out, "  {}", self.paint(&failure.to_string(), Color::Red))?;
            }
        }
        if !summary.rejected.is_empty() {
            writeln!(self.out, "rejected:")?;
            for rejected in &summary.rejected {
                writeln!(self.out, "  {}", self.paint(&rejected.to_string(), Color::Red))?;
            }
        }
        Ok(())
    }

    pub fn fatal(&mut self, failure: &FatalFailure) -> io::Result<()> {
        writeln!(self.out)?;
        let line = format!("FATAL: {failure}");
        writeln!(self.out, "{}", self.strong(&line, Color::Red))
    }
}

fn headline(preview: &ResultPreview) -> String {
    let elapsed = format_duration_ms(preview.execution_time.as_secs_f64() * 1000.0);
    match preview.affected_rows {
        Some(n) => format!("{} affected in {}", plural(n, "row"), elapsed),
        None if preview.truncated_rows() > 0 => format!(
            "{} in {} (showing {})",
            plural(preview.total_rows, "row"),
            elapsed,
            preview.rows.len()
        ),
        None => format!("{} in {}", plural(preview.total_rows, "row"), elapsed),
    }
}

fn plural(n: u64, word: &str) -> String {
    if n == 1 {
        format!("{n} {word}")
    } else {
        format!("{n} {word}s")
    }
}

fn plan_summary(plan: &QueryPlan) -> String {
    let mut parts = vec![format!("plan: {}", plan.top_operation())];
    let relations = plan.relations();
    if !relations.is_empty() {
        parts.push(format!("relations: {}", relations.join(", ")));
    }
    let indexes = plan.indexes();
    if !indexes.is_empty() {
        parts.push(format!("indexes: {}", indexes.join(", ")));
    }
    let mismatches = plan.mismatches();
    if mismatches > 0 {
        parts.push(format!("{mismatches} estimate mismatch(es)"));
    }
    if let (Some(planning), Some(execution)) = (plan.planning_time, plan.execution_time) {
        parts.push(format!(
            "planning {}, execution {}",
            format_duration_ms(planning),
            format_duration_ms(execution)
        ));
    }
    parts.join(" | ")
}

/// The preview as text lines. A single row is shown as `column = value`.
fn preview_lines(preview: &ResultPreview) -> Vec<String> {
    if preview.columns.is_empty() {
        return Vec::new();
    }

    if preview.rows.len() == 1 && preview.total_rows == 1 {
        return preview
            .columns
            .iter()
            .zip(&preview.rows[0])
            .map(|(col, cell)| format!("{} = {}", col.name, cell.display()))
            .collect();
    }

    let widths: Vec<usize> = preview
        .columns
        .iter()
        .enumerate()
        .map(|(i, col)| {
            let widest_cell = preview
                .rows
                .iter()
                .filter_map(|row| row.get(i))
                .map(|cell| cell.display_width())
                .max()
                .unwrap_or(0);
            widest_cell.max(col.name.width()).min(MAX_CELL_WIDTH)
        })
        .collect();

    let render = |cells: Vec<String>| -> String {
        let padded: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| pad(&truncate_to_width(cell, *width), *width))
            .collect();
        padded.join(" | ").trim_end().to_string()
    };

    let mut lines = Vec::with_capacity(preview.rows.len() + 3);
    lines.push(render(preview.columns.iter().map(|c| c.name.clone()).collect()));
    lines.push(
        widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("-+-"),
    );
    for row in &preview.rows {
        lines.push(render(row.iter().map(|cell| cell.display()).collect()));
    }
    let more = preview.truncated_rows();
    if preview.rows.is_empty() && more == 0 {
        lines.push("(no rows)".to_string());
    }
    if more > 0 {
        lines.push(format!("({} more)", plural(more, "row")));
    }
    lines
}

/// Cut `text` to at most `max` display columns, marking the cut with `…`.
fn truncate_to_width(text: &str, max: usize) -> String {
    // Multi-line values would break the table.
    let text = text.replace(['\n', '\r'], " ");
    if text.width() <= max {
        return text;
    }
    let mut out = String::new();
    let mut used = 0;
    for ch in text.chars() {
        let w = ch.width().unwrap_or(0);
        if used + w > max.saturating_sub(1) {
            break;
        }
        out.push(ch);
        used += w;
    }
    out.push('…');
    out
}

fn pad(text: &str, width: usize) -> String {
    let fill = width.saturating_sub(text.width());
    format!("{}{}", text, " ".repeat(fill))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CellValue, ColumnInfo, DriverError};
    use crate::explain::parse_explain_output;
    use crate::orchestrator::EngineTally;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn render<F>(f: F) -> String
    where
        F: FnOnce(&mut Presenter<Vec<u8>>) -> io::Result<()>,
    {
        let mut presenter = Presenter::new(Vec::new(), false);
        f(&mut presenter).unwrap();
        String::from_utf8(presenter.into_inner()).unwrap()
    }

    fn concerts() -> ResultPreview {
        ResultPreview {
            columns: vec![
                ColumnInfo {
                    name: "id_concert".to_string(),
                    type_name: "int4".to_string(),
                },
                ColumnInfo {
                    name: "nom".to_string(),
                    type_name: "varchar".to_string(),
                },
            ],
            rows: vec![
                vec![CellValue::Int32(1), CellValue::Text("Rock en Seine".to_string())],
                vec![
                    CellValue::Int32(2),
                    CellValue::Text("Les Vieilles Charrues".to_string()),
                ],
            ],
            total_rows: 10,
            execution_time: Duration::from_micros(1500),
            affected_rows: None,
        }
    }

    #[test]
    fn test_present_table_and_plan() {
        let text = "Seq Scan on concert  (cost=0.00..80.00 rows=5000 width=12)";
        let execution = Execution {
            preview: concerts(),
            plan: PlanText::Native {
                text: text.to_string(),
                plan: parse_explain_output(text),
            },
        };
        let out = render(|p| p.present("02_concerts.sql", EngineKind::Postgres, &execution));

        let expected = [
            "[postgres] 10 rows in 1.50ms (showing 2)".to_string(),
            "id_concert | nom".to_string(),
            format!("{}-+-{}", "-".repeat(10), "-".repeat(21)),
            "1          | Rock en Seine".to_string(),
            "2          | Les Vieilles Charrues".to_string(),
            "(8 more rows)".to_string(),
            "plan: Seq Scan on concert | relations: concert".to_string(),
            text.to_string(),
            String::new(),
        ]
        .join("\n");
        assert_eq!(out, expected);
    }

    #[test]
    fn test_single_row_uses_column_equals_value() {
        let execution = Execution {
            preview: ResultPreview {
                columns: vec![ColumnInfo {
                    name: "n".to_string(),
                    type_name: "NUMBER".to_string(),
                }],
                rows: vec![vec![CellValue::Int64(500)]],
                total_rows: 1,
                execution_time: Duration::from_millis(2),
                affected_rows: None,
            },
            plan: PlanText::Unavailable {
                reason: "ORA-01031: insufficient privileges".to_string(),
            },
        };
        let out = render(|p| p.present("01_count_groupe.sql", EngineKind::Oracle, &execution));
        assert_eq!(
            out,
            "[oracle] 1 row in 2.00ms\nn = 500\nplan unavailable: ORA-01031: insufficient privileges\n"
        );
    }

    #[test]
    fn test_dml_reports_affected_rows() {
        let execution = Execution {
            preview: ResultPreview {
                affected_rows: Some(3),
                execution_time: Duration::from_millis(4),
                ..ResultPreview::empty()
            },
            plan: PlanText::Unavailable {
                reason: "none".to_string(),
            },
        };
        let out = render(|p| p.present("03_update.sql", EngineKind::Postgres, &execution));
        assert!(out.starts_with("[postgres] 3 rows affected in 4.00ms\nplan unavailable"));
    }

    #[test]
    fn test_mismatch_warning_is_rendered() {
        let text = "Seq Scan on groupe  (cost=0.00..9.00 rows=5 width=0) (actual time=0.010..0.100 rows=500 loops=1)";
        let execution = Execution {
            preview: ResultPreview::empty(),
            plan: PlanText::Native {
                text: text.to_string(),
                plan: parse_explain_output(text),
            },
        };
        let out = render(|p| p.present("x.sql", EngineKind::Postgres, &execution));
        assert!(out.contains("plan: Seq Scan on groupe | relations: groupe | 1 estimate mismatch(es)"));
        assert!(out.contains("⚠ Seq Scan on groupe: est=5 actual=500"));
    }

    #[test]
    fn test_empty_result_keeps_header() {
        let mut preview = concerts();
        preview.rows.clear();
        preview.total_rows = 0;
        assert_eq!(
            preview_lines(&preview),
            vec!["id_concert | nom", "-----------+----", "(no rows)"]
        );
    }

    #[test]
    fn test_plan_summary_lists_indexes() {
        let plan = parse_explain_output(
            "Index Scan using pk_groupe on groupe  (cost=0.28..8.29 rows=1 width=32)",
        )
        .unwrap();
        assert_eq!(
            plan_summary(&plan),
            "plan: Index Scan using pk_groupe on groupe | relations: groupe | indexes: pk_groupe"
        );
    }

    #[test]
    fn test_zero_limit_only_counts_rows() {
        let mut preview = concerts();
        preview.rows.clear();
        preview.total_rows = 12;
        assert_eq!(
            preview_lines(&preview),
            vec!["id_concert | nom", "-----------+----", "(12 more rows)"]
        );
    }

    #[test]
    fn test_truncate_to_width() {
        assert_eq!(truncate_to_width("short", 10), "short");
        let long = "x".repeat(50);
        let cut = truncate_to_width(&long, MAX_CELL_WIDTH);
        assert_eq!(cut.width(), MAX_CELL_WIDTH);
        assert!(cut.ends_with('…'));
        assert_eq!(truncate_to_width("日本語テキスト", 7), "日本語…");
        assert_eq!(truncate_to_width("a\nb", 5), "a b");
    }

    #[test]
    fn test_pad_uses_display_width() {
        assert_eq!(pad("Métal", 7), "Métal  ");
        assert_eq!(pad("日本", 6), "日本  ");
    }

    #[test]
    fn test_execution_error_section() {
        let mut error = DriverError::from_string(
            EngineKind::Oracle,
            "ORA-00904: \"NOM_SCENE\": invalid identifier".to_string(),
        );
        error.code = "ORA-00904".to_string();
        let out = render(|p| {
            p.execution_error(&ExecutionError {
                file: "05_scenes.sql".to_string(),
                engine: EngineKind::Oracle,
                error,
            })
        });
        assert_eq!(
            out,
            "[oracle] error in 05_scenes.sql\n  Error: ORA-00904: \"NOM_SCENE\": invalid identifier\n"
        );
    }

    #[test]
    fn test_summary_lists_engines_and_failures() {
        let mut summary = RunSummary {
            requests: 3,
            ..RunSummary::default()
        };
        summary.tallies.insert(
            EngineKind::Postgres,
            EngineTally {
                succeeded: 3,
                failed: 0,
                skipped: 0,
            },
        );
        summary.tallies.insert(
            EngineKind::Oracle,
            EngineTally {
                succeeded: 1,
                failed: 1,
                skipped: 1,
            },
        );
        summary.failures.push(ExecutionError {
            file: "02_x.sql".to_string(),
            engine: EngineKind::Oracle,
            error: DriverError::from_string(EngineKind::Oracle, "boom".to_string()),
        });
        summary.rejected.push(LoadError::Empty {
            file: "03_empty.sql".to_string(),
        });

        let out = render(|p| p.summary(&summary));
        let expected = "
== summary: 3 request(s) ==
postgres: 3 ok, 0 failed, 0 skipped
oracle:   1 ok, 1 failed, 1 skipped
failures:
  [oracle] 02_x.sql: boom
rejected:
  03_empty.sql: no executable statement
";
        assert_eq!(out, expected);
    }

    #[test]
    fn test_colour_only_when_enabled() {
        let mut presenter = Presenter::new(Vec::new(), true);
        presenter.skipped(EngineKind::Oracle).unwrap();
        let out = String::from_utf8(presenter.into_inner()).unwrap();
        assert!(out.contains("\u{1b}["));

        let plain = render(|p| p.skipped(EngineKind::Oracle));
        assert_eq!(plain, "[oracle] skipped: no statement for this engine\n");
    }
}
