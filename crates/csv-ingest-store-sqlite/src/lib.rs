use std::io::Read;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use csv_ingest_core::{
    normalize_row, quote_identifier, CsvSource, ExistingTable, IngestError, IngestOptions,
    IngestSummary, SourceRow, TableDefinition,
};
use rusqlite::{params, params_from_iter, Connection, OpenFlags, Transaction};
use serde::{Deserialize, Serialize};

const ROWID_ALIASES: [&str; 3] = ["rowid", "_rowid_", "oid"];

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
}

impl SqliteStore {
    /// Open (or create) a SQLite database file for ingestion.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        Self::configure(conn)
    }

    /// Open an existing database without write access, for readers of finished tables.
    ///
    /// # Errors
    /// Returns an error when the file does not exist or cannot be opened.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| {
            format!("failed to open sqlite database read-only at {}", path.display())
        })?;
        Self::configure(conn)
    }

    fn configure(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA busy_timeout = 5000;")
            .context("failed to configure sqlite pragmas")?;
        Ok(Self { conn })
    }

    /// Derive a table from `source`'s header and load every data row into it.
    ///
    /// # Errors
    /// Returns [`IngestError::SourceRead`] when the source fails mid-stream and
    /// [`IngestError::StoreWrite`] for any database failure, including a name
    /// conflict under [`ExistingTable::Fail`]. Either way nothing is committed.
    pub fn ingest_source<R: Read>(
        &mut self,
        source: CsvSource<R>,
        options: &IngestOptions,
    ) -> Result<IngestSummary, IngestError> {
        let definition = TableDefinition::from_header(source.path(), source.header());
        tracing::info!(
            source = %source.path().display(),
            table = %definition.name,
            columns = definition.width(),
            "derived table definition from header"
        );
        self.load_table(&definition, source, options)
    }

    /// Create `definition` and insert `rows` in order inside one transaction.
    ///
    /// Rows are normalized to the definition's width before insertion, so the
    /// stored table always has exactly one value per declared column.
    ///
    /// # Errors
    /// Propagates the first source error, or a [`IngestError::StoreWrite`] for
    /// database failures. The transaction is rolled back on any error.
    pub fn load_table<I>(
        &mut self,
        definition: &TableDefinition,
        rows: I,
        options: &IngestOptions,
    ) -> Result<IngestSummary, IngestError>
    where
        I: IntoIterator<Item = Result<SourceRow, IngestError>>,
    {
        let tx = self
            .conn
            .transaction()
            .context("failed to start ingestion transaction")
            .map_err(store_write)?;

        let replaced =
            prepare_table(&tx, definition, options.existing_table).map_err(store_write)?;
        let mut summary = IngestSummary::new(definition, replaced);

        {
            let mut stmt = tx
                .prepare(&insert_sql(definition))
                .with_context(|| format!("failed to prepare insert for table {}", definition.name))
                .map_err(store_write)?;

            for row in rows {
                let row = row?;
                let (fields, shape) = normalize_row(
                    row.fields,
                    definition.width(),
                    options.overflow,
                    options.delimiter,
                );
                if shape.is_malformed() {
                    tracing::debug!(
                        table = %definition.name,
                        line = row.line,
                        ?shape,
                        "normalized malformed row"
                    );
                }

                stmt.execute(params_from_iter(fields.iter()))
                    .with_context(|| format!("failed to insert row from line {}", row.line))
                    .map_err(store_write)?;
                summary.record(shape, row.lossy);
            }
        }

        tx.commit().context("failed to commit ingestion transaction").map_err(store_write)?;

        if summary.malformed_rows() > 0 {
            tracing::warn!(
                table = %summary.table,
                padded = summary.padded_rows,
                overflowed = summary.overflowed_rows,
                overflow_policy = options.overflow.as_str(),
                "ingested rows whose field count differed from the header"
            );
        }
        tracing::info!(
            table = %summary.table,
            rows = summary.rows_written,
            existing_table = options.existing_table.as_str(),
            replaced = summary.replaced_existing,
            "ingestion committed"
        );

        Ok(summary)
    }

    /// Whether a table with this name exists. SQLite compares names case-insensitively.
    ///
    /// # Errors
    /// Returns an error when the catalog cannot be queried.
    pub fn table_exists(&self, table: &str) -> Result<bool> {
        table_exists(&self.conn, table)
    }

    /// User tables in the store, sorted by name.
    ///
    /// # Errors
    /// Returns an error when the catalog cannot be queried.
    pub fn table_names(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\'
             ORDER BY name ASC",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to list tables")?;
        Ok(names)
    }

    /// Columns of `table` in declaration order.
    ///
    /// # Errors
    /// Returns an error when the table does not exist.
    pub fn table_columns(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, type FROM pragma_table_info(?1) ORDER BY cid ASC")?;
        let columns = stmt
            .query_map(params![table], |row| {
                Ok(ColumnInfo {
                    name: row.get(0)?,
                    declared_type: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("failed to inspect columns of {table}"))?;

        if columns.is_empty() {
            return Err(anyhow!("table not found: {table}"));
        }
        Ok(columns)
    }

    /// # Errors
    /// Returns an error when the table does not exist.
    pub fn row_count(&self, table: &str) -> Result<u64> {
        self.ensure_table(table)?;
        let count = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", quote_identifier(table)), [], |row| {
                row.get::<_, i64>(0)
            })
            .with_context(|| format!("failed to count rows in {table}"))?;
        u64::try_from(count).context("row count out of range")
    }

    /// Rows of `table` in insertion order.
    ///
    /// # Errors
    /// Returns an error when the table does not exist or cannot be read.
    pub fn fetch_rows(&self, table: &str, limit: u32, offset: u64) -> Result<Vec<Vec<String>>> {
        let columns = self.table_columns(table)?;
        let order_key = rowid_alias(table, &columns)?;
        let offset = i64::try_from(offset).context("offset out of range")?;
        let sql = format!(
            "SELECT * FROM {} ORDER BY {order_key} ASC LIMIT ?1 OFFSET ?2",
            quote_identifier(table)
        );
        self.query_text_rows(&sql, params![i64::from(limit), offset], columns.len())
            .with_context(|| format!("failed to fetch rows from {table}"))
    }

    /// Rows of `table` whose `column` equals `value`, in insertion order.
    ///
    /// The column must exist in the catalog; `value` is always bound.
    ///
    /// # Errors
    /// Returns an error when the table or column does not exist.
    pub fn find_rows(&self, table: &str, column: &str, value: &str) -> Result<Vec<Vec<String>>> {
        let columns = self.table_columns(table)?;
        let Some(matched) = columns.iter().find(|info| info.name.eq_ignore_ascii_case(column))
        else {
            return Err(anyhow!("column not found: {table}.{column}"));
        };
        let order_key = rowid_alias(table, &columns)?;

        let sql = format!(
            "SELECT * FROM {} WHERE {} = ?1 ORDER BY {order_key} ASC",
            quote_identifier(table),
            quote_identifier(&matched.name)
        );
        self.query_text_rows(&sql, params![value], columns.len())
            .with_context(|| format!("failed to look up {table}.{column}"))
    }

    fn ensure_table(&self, table: &str) -> Result<()> {
        if self.table_exists(table)? {
            Ok(())
        } else {
            Err(anyhow!("table not found: {table}"))
        }
    }

    fn query_text_rows(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
        width: usize,
    ) -> Result<Vec<Vec<String>>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        let mut out = Vec::new();

        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for index in 0..width {
                values.push(row.get::<_, Option<String>>(index)?.unwrap_or_default());
            }
            out.push(values);
        }

        Ok(out)
    }
}

/// Ingest `source` into a new table in the database at `destination`.
///
/// Uses [`IngestOptions::default`]: comma-delimited, truncate overflow, and
/// fail when the table already exists.
///
/// # Errors
/// See [`ingest_with_options`].
pub fn ingest(destination: &Path, source: &Path) -> Result<u64, IngestError> {
    ingest_with_options(destination, source, &IngestOptions::default())
        .map(|summary| summary.rows_written)
}

/// Ingest `source` into the database at `destination`.
///
/// The source is opened and its header read before the destination is
/// touched, so a missing or empty source never creates a database file.
///
/// # Errors
/// Returns [`IngestError::SourceNotFound`], [`IngestError::MissingHeader`],
/// [`IngestError::SourceRead`] or [`IngestError::StoreWrite`].
pub fn ingest_with_options(
    destination: &Path,
    source: &Path,
    options: &IngestOptions,
) -> Result<IngestSummary, IngestError> {
    let source = CsvSource::open(source, options.delimiter)?;
    let mut store = SqliteStore::open(destination).map_err(store_write)?;
    store.ingest_source(source, options)
}

/// Ingest `source` through a store handle the caller already owns.
///
/// # Errors
/// See [`ingest_with_options`].
pub fn ingest_into(
    store: &mut SqliteStore,
    source: &Path,
    options: &IngestOptions,
) -> Result<IngestSummary, IngestError> {
    let source = CsvSource::open(source, options.delimiter)?;
    store.ingest_source(source, options)
}

/// A name for the implicit rowid that no declared column shadows.
fn rowid_alias(table: &str, columns: &[ColumnInfo]) -> Result<&'static str> {
    ROWID_ALIASES
        .into_iter()
        .find(|alias| !columns.iter().any(|info| info.name.eq_ignore_ascii_case(alias)))
        .ok_or_else(|| anyhow!("every rowid alias is shadowed by a column of {table}"))
}

fn store_write(err: anyhow::Error) -> IngestError {
    IngestError::StoreWrite(format!("{err:#}"))
}

fn prepare_table(
    tx: &Transaction<'_>,
    definition: &TableDefinition,
    policy: ExistingTable,
) -> Result<bool> {
    let exists = table_exists(tx, &definition.name)?;

    if exists {
        match policy {
            ExistingTable::Fail => {
                return Err(anyhow!(
                    "table {} already exists in destination store",
                    quote_identifier(&definition.name)
                ));
            }
            ExistingTable::Replace => {
                tracing::info!(table = %definition.name, "dropping existing table before reload");
                tx.execute_batch(&format!("DROP TABLE {};", quote_identifier(&definition.name)))
                    .with_context(|| format!("failed to drop existing table {}", definition.name))?;
            }
        }
    }

    tx.execute_batch(&create_table_sql(definition))
        .with_context(|| format!("failed to create table {}", definition.name))?;

    Ok(exists)
}

fn create_table_sql(definition: &TableDefinition) -> String {
    let columns = definition
        .columns
        .iter()
        .map(|column| format!("{} TEXT", quote_identifier(column)))
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE {} ({columns});", quote_identifier(&definition.name))
}

fn insert_sql(definition: &TableDefinition) -> String {
    let columns =
        definition.columns.iter().map(|column| quote_identifier(column)).collect::<Vec<_>>();
    let placeholders = (1..=columns.len()).map(|index| format!("?{index}")).collect::<Vec<_>>();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_identifier(&definition.name),
        columns.join(", "),
        placeholders.join(", ")
    )
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master \
             WHERE type = 'table' AND name = ?1 COLLATE NOCASE)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}
