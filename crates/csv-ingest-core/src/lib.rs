use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use csv::{ByteRecord, ReaderBuilder};
use serde::{Deserialize, Serialize};

pub const DEFAULT_DELIMITER: u8 = b',';

const FALLBACK_TABLE_NAME: &str = "data";
const RESERVED_TABLE_PREFIX: &str = "sqlite_";
const RESERVED_TABLE_ESCAPE: &str = "t_";

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("source file not found: {}", .0.display())]
    SourceNotFound(PathBuf),
    #[error("Usage: {0}")]
    Usage(String),
    #[error("source file has no header row: {}", .0.display())]
    MissingHeader(PathBuf),
    #[error("failed to read source {}: {message}", .path.display())]
    SourceRead { path: PathBuf, message: String },
    #[error("store write error: {0}")]
    StoreWrite(String),
}

impl IngestError {
    fn source_read(path: &Path, err: impl Display) -> Self {
        Self::SourceRead {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

/// What to do when the destination already holds a table with the derived name.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum ExistingTable {
    #[default]
    Fail,
    Replace,
}

impl ExistingTable {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fail => "fail",
            Self::Replace => "replace",
        }
    }
}

/// How a data row wider than the header is collapsed to the header width.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum OverflowPolicy {
    #[default]
    Truncate,
    MergeIntoLast,
}

impl OverflowPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Truncate => "truncate",
            Self::MergeIntoLast => "merge_into_last",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOptions {
    pub delimiter: u8,
    pub existing_table: ExistingTable,
    pub overflow: OverflowPolicy,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            delimiter: DEFAULT_DELIMITER,
            existing_table: ExistingTable::default(),
            overflow: OverflowPolicy::default(),
        }
    }
}

/// Parse a user-supplied delimiter. Only a single ASCII character that cannot
/// be confused with quoting or record separators is accepted.
///
/// # Errors
/// Returns [`IngestError::Usage`] when the value is not a usable delimiter.
pub fn parse_delimiter(value: &str) -> Result<u8, IngestError> {
    let usage = || {
        IngestError::Usage(format!(
            "--delimiter expects a single ASCII character other than a quote or newline, \
             got {value:?}"
        ))
    };

    if value == "\\t" || value == "tab" {
        return Ok(b'\t');
    }

    let mut chars = value.chars();
    let (Some(ch), None) = (chars.next(), chars.next()) else {
        return Err(usage());
    };
    if !ch.is_ascii() || matches!(ch, '"' | '\n' | '\r') {
        return Err(usage());
    }
    u8::try_from(ch).map_err(|_| usage())
}

/// Table name and ordered column list derived from a source file and its header row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<String>,
}

impl TableDefinition {
    #[must_use]
    pub fn from_header<S: AsRef<str>>(source: &Path, header: &[S]) -> Self {
        Self {
            name: table_name_for(source),
            columns: column_names(header),
        }
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.columns.len()
    }
}

/// Strip what SQLite cannot carry in a quoted identifier. Spaces and
/// punctuation are kept.
#[must_use]
pub fn sanitize_identifier(raw: &str) -> String {
    raw.trim_start_matches('\u{feff}').trim().chars().filter(|ch| !ch.is_control()).collect()
}

/// Table name for a source file: its stem, sanitized.
#[must_use]
pub fn table_name_for(source: &Path) -> String {
    let stem = source
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = sanitize_identifier(&stem);

    if name.is_empty() {
        return FALLBACK_TABLE_NAME.to_string();
    }
    if name.to_ascii_lowercase().starts_with(RESERVED_TABLE_PREFIX) {
        return format!("{RESERVED_TABLE_ESCAPE}{name}");
    }
    name
}

/// Column identifiers for a header row, in order.
///
/// Blank names become `column_<n>` (1-based). Names are unique under ASCII
/// case folding, matching how SQLite compares column names: a repeated
/// `Name` becomes `Name_2`, then `Name_3`.
#[must_use]
pub fn column_names<S: AsRef<str>>(header: &[S]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(header.len());
    let mut columns = Vec::with_capacity(header.len());

    for (index, raw) in header.iter().enumerate() {
        let mut base = sanitize_identifier(raw.as_ref());
        if base.is_empty() {
            base = format!("column_{}", index + 1);
        }

        let mut candidate = base.clone();
        let mut suffix = 2_usize;
        while !seen.insert(candidate.to_ascii_lowercase()) {
            candidate = format!("{base}_{suffix}");
            suffix += 1;
        }
        columns.push(candidate);
    }

    columns
}

/// Render an identifier for SQL text. Embedded double quotes are doubled.
#[must_use]
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// How a data row compared to the header width before normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowShape {
    Exact,
    Padded { missing: usize },
    Overflowed { extra: usize },
}

impl RowShape {
    #[must_use]
    pub fn is_malformed(self) -> bool {
        !matches!(self, Self::Exact)
    }
}

/// Bring a row to exactly `width` fields: pad with empty text, or collapse
/// trailing extras according to `overflow`.
#[must_use]
pub fn normalize_row(
    mut fields: Vec<String>,
    width: usize,
    overflow: OverflowPolicy,
    delimiter: u8,
) -> (Vec<String>, RowShape) {
    let len = fields.len();

    if len == width {
        return (fields, RowShape::Exact);
    }

    if len < width {
        fields.resize(width, String::new());
        return (
            fields,
            RowShape::Padded {
                missing: width - len,
            },
        );
    }

    let extra = len - width;
    match overflow {
        OverflowPolicy::MergeIntoLast if width > 0 => {
            let tail = fields.split_off(width - 1);
            let separator = char::from(delimiter).to_string();
            fields.push(tail.join(&separator));
        }
        _ => fields.truncate(width),
    }
    (fields, RowShape::Overflowed { extra })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestSummary {
    pub table: String,
    pub columns: Vec<String>,
    pub rows_written: u64,
    pub padded_rows: u64,
    pub overflowed_rows: u64,
    pub lossy_rows: u64,
    pub replaced_existing: bool,
}

impl IngestSummary {
    #[must_use]
    pub fn new(definition: &TableDefinition, replaced_existing: bool) -> Self {
        Self {
            table: definition.name.clone(),
            columns: definition.columns.clone(),
            rows_written: 0,
            padded_rows: 0,
            overflowed_rows: 0,
            lossy_rows: 0,
            replaced_existing,
        }
    }

    pub fn record(&mut self, shape: RowShape, lossy: bool) {
        self.rows_written += 1;
        match shape {
            RowShape::Exact => {}
            RowShape::Padded { .. } => self.padded_rows += 1,
            RowShape::Overflowed { .. } => self.overflowed_rows += 1,
        }
        if lossy {
            self.lossy_rows += 1;
        }
    }

    #[must_use]
    pub fn malformed_rows(&self) -> u64 {
        self.padded_rows + self.overflowed_rows
    }
}

impl Display for IngestSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "table \"{}\", {} rows", self.table, self.rows_written)
    }
}

/// One data record as read from the source, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRow {
    pub fields: Vec<String>,
    pub line: u64,
    pub lossy: bool,
}

/// Delimited-text reader that yields the header once and then data rows in
/// file order. Field counts may vary between records.
pub struct CsvSource<R: Read> {
    path: PathBuf,
    reader: csv::Reader<R>,
    header: Vec<String>,
    record: ByteRecord,
}

impl CsvSource<File> {
    /// Open `path` for reading.
    ///
    /// # Errors
    /// Returns [`IngestError::SourceNotFound`] when the file does not exist,
    /// [`IngestError::MissingHeader`] when it has no header record, and
    /// [`IngestError::SourceRead`] for any other I/O or framing failure.
    pub fn open(path: &Path, delimiter: u8) -> Result<Self, IngestError> {
        let file = File::open(path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => IngestError::SourceNotFound(path.to_path_buf()),
            _ => IngestError::source_read(path, err),
        })?;
        Self::from_reader(path, file, delimiter)
    }
}

impl<R: Read> CsvSource<R> {
    /// Wrap an arbitrary reader; `path` only labels diagnostics.
    ///
    /// # Errors
    /// Returns [`IngestError::MissingHeader`] for empty input and
    /// [`IngestError::SourceRead`] when the header cannot be read.
    pub fn from_reader(path: &Path, reader: R, delimiter: u8) -> Result<Self, IngestError> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .delimiter(delimiter)
            .from_reader(reader);

        let raw_header = reader.byte_headers().map_err(|err| IngestError::source_read(path, err))?;
        if raw_header.is_empty() {
            return Err(IngestError::MissingHeader(path.to_path_buf()));
        }

        let header = raw_header.iter().map(|field| decode_field(field).0.into_owned()).collect();

        Ok(Self {
            path: path.to_path_buf(),
            reader,
            header,
            record: ByteRecord::new(),
        })
    }

    #[must_use]
    pub fn header(&self) -> &[String] {
        &self.header
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_row(&mut self) -> Result<Option<SourceRow>, IngestError> {
        let has_record = self
            .reader
            .read_byte_record(&mut self.record)
            .map_err(|err| IngestError::source_read(&self.path, err))?;
        if !has_record {
            return Ok(None);
        }

        let line = self.record.position().map_or(0, csv::Position::line);
        let mut lossy = false;
        let fields: Vec<String> = self
            .record
            .iter()
            .map(|field| {
                let (text, replaced) = decode_field(field);
                lossy |= replaced;
                text.into_owned()
            })
            .collect();

        if lossy {
            tracing::warn!(
                source = %self.path.display(),
                line,
                "replaced invalid UTF-8 bytes while decoding row"
            );
        }

        Ok(Some(SourceRow {
            fields,
            line,
            lossy,
        }))
    }
}

impl<R: Read> Iterator for CsvSource<R> {
    type Item = Result<SourceRow, IngestError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_row().transpose()
    }
}

fn decode_field(bytes: &[u8]) -> (Cow<'_, str>, bool) {
    let text = String::from_utf8_lossy(bytes);
    let replaced = matches!(text, Cow::Owned(_));
    (text, replaced)
}
