use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::db::EngineKind;
use crate::error::HarnessError;

/// Why a request file was rejected. The file is skipped; the run goes on.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("{file}: found {count} statements, expected exactly one")]
    MultiStatement { file: String, count: usize },

    #[error("{file}: no executable statement")]
    Empty { file: String },

    #[error("{file}:{line}:{column}: {reason}")]
    Malformed {
        file: String,
        line: usize,
        column: usize,
        reason: String,
    },

    #[error("{file}: {source}")]
    Io {
        file: String,
        #[source]
        source: io::Error,
    },
}

impl LoadError {
    pub fn file(&self) -> &str {
        match self {
            LoadError::MultiStatement { file, .. }
            | LoadError::Empty { file }
            | LoadError::Malformed { file, .. }
            | LoadError::Io { file, .. } => file,
        }
    }
}

/// Scanner verdict on one file's text, before the file name is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementError {
    Empty,
    MultiStatement { count: usize },
    Malformed {
        line: usize,
        column: usize,
        reason: String,
    },
}

impl StatementError {
    fn into_load_error(self, file: &str) -> LoadError {
        let file = file.to_string();
        match self {
            StatementError::Empty => LoadError::Empty { file },
            StatementError::MultiStatement { count } => LoadError::MultiStatement { file, count },
            StatementError::Malformed {
                line,
                column,
                reason,
            } => LoadError::Malformed {
                file,
                line,
                column,
                reason,
            },
        }
    }
}

/// One logical request with its statement text per engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Logical name, e.g. `01_count_groupe`.
    pub name: String,
    /// File names that make up the request.
    pub files: Vec<String>,
    shared: Option<Source>,
    variants: BTreeMap<EngineKind, Source>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Source {
    file: String,
    statement: String,
}

impl Request {
    /// Statement for `kind`: its own variant, else the shared text. `None`
    /// means the engine is skipped for this request.
    pub fn statement_for(&self, kind: EngineKind) -> Option<&str> {
        self.source_for(kind).map(|s| s.statement.as_str())
    }

    /// File the statement for `kind` was read from.
    pub fn file_for(&self, kind: EngineKind) -> Option<&str> {
        self.source_for(kind).map(|s| s.file.as_str())
    }

    fn source_for(&self, kind: EngineKind) -> Option<&Source> {
        self.variants.get(&kind).or(self.shared.as_ref())
    }

    pub fn display_name(&self) -> String {
        self.files.join(", ")
    }
}

#[derive(Debug, Default)]
struct RequestFiles {
    /// Smallest contributing file name; requests run in this order.
    first_file: String,
    shared: Option<PathBuf>,
    variants: BTreeMap<EngineKind, PathBuf>,
}

/// A directory of request files. `NN_name.sql` is shared by both engines;
/// `NN_name.postgres.sql` and `NN_name.oracle.sql` are per-engine text.
#[derive(Debug, Clone)]
pub struct RequestDir {
    path: PathBuf,
}

impl RequestDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// List the directory and return its requests in order. Each call
    /// re-reads the directory. A missing directory is created and yields
    /// nothing.
    pub fn iter(&self) -> Result<Requests, HarnessError> {
        let dir_error = |source: io::Error| HarnessError::RequestDir {
            path: self.path.clone(),
            source,
        };

        if !self.path.exists() {
            fs::create_dir_all(&self.path).map_err(dir_error)?;
            tracing::info!(path = %self.path.display(), "created empty requests directory");
        }

        let mut grouped: BTreeMap<String, RequestFiles> = BTreeMap::new();
        for entry in fs::read_dir(&self.path).map_err(dir_error)? {
            let entry = entry.map_err(dir_error)?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                tracing::warn!(path = %path.display(), "skipping file with non UTF-8 name");
                continue;
            };
            let Some(stem) = file_name.strip_suffix(".sql") else {
                continue;
            };
            let (name, variant) = split_variant(stem);
            let files = grouped.entry(name.to_string()).or_default();
            if files.first_file.is_empty() || file_name < files.first_file.as_str() {
                files.first_file = file_name.to_string();
            }
            match variant {
                Some(kind) => {
                    files.variants.insert(kind, path);
                }
                None => files.shared = Some(path),
            }
        }

        let mut entries: Vec<(String, RequestFiles)> = grouped.into_iter().collect();
        entries.sort_by(|(_, a), (_, b)| a.first_file.cmp(&b.first_file));
        Ok(Requests {
            entries: entries.into_iter(),
        })
    }
}

/// `01_x.oracle` -> (`01_x`, Oracle). Unknown suffixes stay in the name.
fn split_variant(stem: &str) -> (&str, Option<EngineKind>) {
    if let Some((name, suffix)) = stem.rsplit_once('.') {
        if let Some(kind) = EngineKind::from_label(suffix) {
            if !name.is_empty() {
                return (name, Some(kind));
            }
        }
    }
    (stem, None)
}

/// Lazy sequence of requests from one directory listing, in file-name
/// order. Each file is read when its request is reached.
#[derive(Debug)]
pub struct Requests {
    entries: std::vec::IntoIter<(String, RequestFiles)>,
}

impl Iterator for Requests {
    type Item = Result<Request, LoadError>;

    fn next(&mut self) -> Option<Self::Item> {
        let (name, files) = self.entries.next()?;
        Some(load_request(name, files))
    }
}

fn load_request(name: String, files: RequestFiles) -> Result<Request, LoadError> {
    let mut request = Request {
        name,
        files: Vec::new(),
        shared: None,
        variants: BTreeMap::new(),
    };

    if let Some(path) = &files.shared {
        let source = load_file(path, None)?;
        request.files.push(source.file.clone());
        request.shared = Some(source);
    }
    for (kind, path) in &files.variants {
        let source = load_file(path, Some(*kind))?;
        request.files.push(source.file.clone());
        request.variants.insert(*kind, source);
    }
    Ok(request)
}

/// `engine` is `None` for shared text, which must read the same on both.
fn load_file(path: &Path, engine: Option<EngineKind>) -> Result<Source, LoadError> {
    let file = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let text = fs::read_to_string(path).map_err(|source| LoadError::Io {
        file: file.clone(),
        source,
    })?;
    let statement = match engine {
        Some(kind) => single_statement_for(&text, kind),
        None => single_statement(&text),
    }
    .map_err(|e| e.into_load_error(&file))?;
    Ok(Source { file, statement })
}

/// Keywords that start a new statement after a stray `:` terminator.
const STATEMENT_KEYWORDS: &[&str] = &[
    "SELECT", "INSERT", "UPDATE", "DELETE", "WITH", "CREATE", "ALTER", "DROP", "MERGE",
    "TRUNCATE", "GRANT", "REVOKE", "EXPLAIN", "BEGIN", "DECLARE", "CALL", "VALUES",
];

/// Reduce text shared by both engines to its one statement. PostgreSQL nests
/// block comments and Oracle does not, so text that the two read differently
/// is rejected.
pub fn single_statement(text: &str) -> Result<String, StatementError> {
    let nested = scan_statement(text, true)?;
    let flat = scan_statement(text, false)?;
    if nested.statement != flat.statement || nested.significant != flat.significant {
        let at = nested.nested_comment.unwrap_or(0);
        let (line, column) = line_col(text, at);
        return Err(StatementError::Malformed {
            line,
            column,
            reason: "nested block comment reads differently on postgres and oracle, \
                     use per-engine files"
                .to_string(),
        });
    }
    Ok(nested.statement)
}

/// Reduce one engine's text to its one statement, without comments around
/// it and without the trailing `;`.
pub fn single_statement_for(text: &str, kind: EngineKind) -> Result<String, StatementError> {
    let nests = match kind {
        EngineKind::Postgres => true,
        EngineKind::Oracle => false,
    };
    scan_statement(text, nests).map(|s| s.statement)
}

struct Scanned {
    statement: String,
    significant: Vec<usize>,
    nested_comment: Option<usize>,
}

fn scan_statement(text: &str, nest_comments: bool) -> Result<Scanned, StatementError> {
    let scan = Scanner::new(text, nest_comments).run()?;

    for &colon in &scan.colons {
        let next = scan.significant.iter().copied().find(|&p| p > colon);
        let stray = match next {
            None => true,
            Some(p) => text[colon..p].contains('\n') && starts_with_keyword(&text[p..]),
        };
        if stray {
            let (line, column) = line_col(text, colon);
            return Err(StatementError::Malformed {
                line,
                column,
                reason: "statement terminated with ':' instead of ';'".to_string(),
            });
        }
    }

    let statement = match scan.segments.as_slice() {
        [] => return Err(StatementError::Empty),
        [(start, end)] => text[*start..*end].to_string(),
        many => return Err(StatementError::MultiStatement { count: many.len() }),
    };
    Ok(Scanned {
        statement,
        significant: scan.significant,
        nested_comment: scan.nested_comment,
    })
}

fn starts_with_keyword(text: &str) -> bool {
    let word: String = text
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    let word = word.to_ascii_uppercase();
    STATEMENT_KEYWORDS.contains(&word.as_str())
}

/// 1-based line and column (in chars) of a byte offset.
fn line_col(text: &str, byte: usize) -> (usize, usize) {
    let before = &text[..byte];
    let line = before.matches('\n').count() + 1;
    let column = before.rsplit('\n').next().unwrap_or("").chars().count() + 1;
    (line, column)
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

fn is_typographic_quote(c: char) -> bool {
    matches!(c, '\u{2018}' | '\u{2019}' | '\u{201C}' | '\u{201D}')
}

#[derive(Debug, Default)]
struct Scan {
    /// Byte ranges of non-empty statements, comments trimmed.
    segments: Vec<(usize, usize)>,
    /// Offsets of lone `:` characters in code.
    colons: Vec<usize>,
    /// Offsets of every character that is code or literal (not comment or
    /// whitespace).
    significant: Vec<usize>,
    /// First `/*` seen inside a block comment.
    nested_comment: Option<usize>,
}

struct Scanner<'a> {
    text: &'a str,
    pos: usize,
    current: Option<(usize, usize)>,
    nest_comments: bool,
    scan: Scan,
}

impl<'a> Scanner<'a> {
    fn new(text: &'a str, nest_comments: bool) -> Self {
        Self {
            text,
            pos: 0,
            nest_comments,
            current: None,
            scan: Scan::default(),
        }
    }

    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn prev(&self) -> Option<char> {
        self.text[..self.pos].chars().next_back()
    }

    fn advance(&mut self) {
        if let Some(c) = self.peek() {
            self.pos += c.len_utf8();
        }
    }

    fn malformed(&self, at: usize, reason: &str) -> StatementError {
        let (line, column) = line_col(self.text, at);
        StatementError::Malformed {
            line,
            column,
            reason: reason.to_string(),
        }
    }

    /// Record `start..end` as part of the current statement.
    fn mark(&mut self, start: usize, end: usize) {
        self.scan.significant.push(start);
        self.current = Some(match self.current {
            Some((s, _)) => (s, end),
            None => (start, end),
        });
    }

    fn end_segment(&mut self) {
        if let Some(segment) = self.current.take() {
            self.scan.segments.push(segment);
        }
    }

    fn run(mut self) -> Result<Scan, StatementError> {
        while let Some(c) = self.peek() {
            let start = self.pos;
            let rest = self.rest();

            if rest.starts_with("--") {
                match rest.find('\n') {
                    Some(nl) => self.pos += nl,
                    None => self.pos = self.text.len(),
                }
            } else if rest.starts_with("/*") {
                self.block_comment(start)?;
            } else if c == '\'' {
                self.quoted(start, '\'', "unterminated string literal")?;
                self.mark(start, self.pos);
            } else if c == '"' {
                self.quoted(start, '"', "unterminated quoted identifier")?;
                self.mark(start, self.pos);
            } else if let Some(tag) = self.dollar_tag() {
                self.dollar_quoted(start, &tag)?;
                self.mark(start, self.pos);
            } else if let Some(close) = self.q_quote_close() {
                self.q_quoted(start, close)?;
                self.mark(start, self.pos);
            } else if c == ';' {
                self.end_segment();
                self.advance();
            } else if is_typographic_quote(c) {
                return Err(self.malformed(
                    start,
                    &format!(
                        "typographic quote U+{:04X} outside a literal, use ' or \" instead",
                        c as u32
                    ),
                ));
            } else if c.is_whitespace() {
                self.advance();
            } else {
                if c == ':'
                    && self.prev() != Some(':')
                    && !rest[1..].starts_with(':')
                    && !rest[1..].starts_with('=')
                {
                    self.scan.colons.push(start);
                }
                self.advance();
                self.mark(start, self.pos);
            }
        }
        self.end_segment();
        Ok(self.scan)
    }

    fn block_comment(&mut self, start: usize) -> Result<(), StatementError> {
        let mut depth = 0usize;
        loop {
            let rest = self.rest();
            if rest.is_empty() {
                return Err(self.malformed(start, "unterminated block comment"));
            }
            if rest.starts_with("/*") {
                if depth > 0 && self.scan.nested_comment.is_none() {
                    self.scan.nested_comment = Some(self.pos);
                }
                if depth == 0 || self.nest_comments {
                    depth += 1;
                }
                self.pos += 2;
            } else if rest.starts_with("*/") {
                depth -= 1;
                self.pos += 2;
                if depth == 0 {
                    return Ok(());
                }
            } else {
                self.advance();
            }
        }
    }

    /// Quoted text where the quote is escaped by doubling it.
    fn quoted(&mut self, start: usize, quote: char, reason: &str) -> Result<(), StatementError> {
        self.advance();
        loop {
            match self.rest().find(quote) {
                None => return Err(self.malformed(start, reason)),
                Some(idx) => {
                    self.pos += idx + quote.len_utf8();
                    if self.peek() == Some(quote) {
                        self.advance();
                    } else {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// `$tag$` opening a PostgreSQL dollar-quoted body, if one starts here.
    fn dollar_tag(&self) -> Option<String> {
        let rest = self.rest();
        if !rest.starts_with('$') || self.prev().is_some_and(is_ident_char) {
            return None;
        }
        let body = &rest[1..];
        let end = body.find('$')?;
        let tag = &body[..end];
        let valid = tag
            .chars()
            .enumerate()
            .all(|(i, c)| c == '_' || c.is_alphabetic() || (i > 0 && c.is_ascii_digit()));
        valid.then(|| format!("${}$", tag))
    }

    fn dollar_quoted(&mut self, start: usize, tag: &str) -> Result<(), StatementError> {
        self.pos += tag.len();
        match self.rest().find(tag) {
            Some(idx) => {
                self.pos += idx + tag.len();
                Ok(())
            }
            None => Err(self.malformed(start, "unterminated dollar-quoted string")),
        }
    }

    /// Closing delimiter of an Oracle `q'[...]'` literal starting here.
    fn q_quote_close(&self) -> Option<char> {
        let mut chars = self.rest().chars();
        let q = chars.next()?;
        if !matches!(q, 'q' | 'Q') || chars.next()? != '\'' {
            return None;
        }
        if self.prev().is_some_and(|p| is_ident_char(p) && !matches!(p, 'n' | 'N')) {
            return None;
        }
        let open = chars.next()?;
        let close = match open {
            '[' => ']',
            '{' => '}',
            '(' => ')',
            '<' => '>',
            c if c.is_whitespace() || c == '\'' => return None,
            c => c,
        };
        Some(close)
    }

    fn q_quoted(&mut self, start: usize, close: char) -> Result<(), StatementError> {
        // Skip `q'` and the opening delimiter.
        self.pos += 2;
        self.advance();
        let terminator = format!("{}'", close);
        match self.rest().find(&terminator) {
            Some(idx) => {
                self.pos += idx + terminator.len();
                Ok(())
            }
            None => Err(self.malformed(start, "unterminated quoted literal")),
        }
    }
}
