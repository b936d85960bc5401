use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::Connection;
use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{}-{now}", std::process::id()));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_ingest<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_ingest"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute ingest binary: {err}"))
}

fn assert_success(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "ingest command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }
    stdout
}

fn combined_output(output: &Output) -> String {
    format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

fn write_csv(dir: &Path, name: &str, lines: &[&str]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, lines.join("\n"))
        .unwrap_or_else(|err| panic!("failed to write {}: {err}", path.display()));
    path
}

fn open_db(path: &Path) -> Connection {
    Connection::open(path)
        .unwrap_or_else(|err| panic!("failed to open sqlite db {}: {err}", path.display()))
}

fn table_names(conn: &Connection) -> Vec<String> {
    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
        .unwrap_or_else(|err| panic!("failed to prepare table listing: {err}"));
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .unwrap_or_else(|err| panic!("failed to list tables: {err}"));
    rows.map(|row| row.unwrap_or_else(|err| panic!("bad table row: {err}"))).collect()
}

fn column_names(conn: &Connection, table: &str) -> Vec<String> {
    let mut stmt = conn
        .prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")
        .unwrap_or_else(|err| panic!("failed to prepare table_info: {err}"));
    let rows = stmt
        .query_map([table], |row| row.get::<_, String>(0))
        .unwrap_or_else(|err| panic!("failed to read table_info for {table}: {err}"));
    rows.map(|row| row.unwrap_or_else(|err| panic!("bad column row: {err}"))).collect()
}

fn count_rows(conn: &Connection, table: &str) -> i64 {
    conn.query_row(&format!("SELECT COUNT(*) FROM \"{table}\""), [], |row| row.get(0))
        .unwrap_or_else(|err| panic!("failed to count rows in {table}: {err}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

#[test]
fn arbitrary_csv_is_converted_with_text_columns() {
    let dir = unique_temp_dir("ingest-arbitrary");
    let csv = write_csv(
        &dir,
        "test_data.csv",
        &[
            "Name,Age,City,Salary,Notes",
            "John Doe,25,New York,50000,Regular employee",
            "Jane Smith,30,Los Angeles,60000,Manager",
            "Bob Johnson,35,Chicago,55000,Senior developer",
            "Alice Brown,28,Houston,52000,Data scientist",
            "Charlie Wilson,45,Phoenix,70000,Director",
            "Diana Lee,32,Philadelphia,58000,Product manager",
            "Eve Davis,29,San Antonio,51000,Designer",
            "Frank Miller,38,San Diego,65000,Architect",
            "Grace Taylor,27,Dallas,49000,Analyst",
            "Henry Moore,41,San Jose,75000,VP Engineering",
        ],
    );
    let db = dir.join("test_arbitrary.db");

    let stdout = assert_success(&run_ingest([path_str(&db), path_str(&csv)]));
    assert!(stdout.contains("Successfully converted"), "stdout: {stdout}");
    assert!(stdout.contains("10 rows"), "stdout: {stdout}");

    let conn = open_db(&db);
    assert_eq!(table_names(&conn), vec!["test_data".to_string()]);
    assert_eq!(count_rows(&conn, "test_data"), 10);
    assert_eq!(column_names(&conn, "test_data"), vec!["Name", "Age", "City", "Salary", "Notes"]);

    let (name, age, age_type): (String, String, String) = conn
        .query_row(
            "SELECT Name, Age, typeof(Age) FROM test_data WHERE Name = ?1",
            ["John Doe"],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .unwrap_or_else(|err| panic!("expected John Doe row: {err}"));
    assert_eq!(name, "John Doe");
    assert_eq!(age, "25");
    assert_eq!(age_type, "text");

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn special_characters_are_preserved() {
    let dir = unique_temp_dir("ingest-special");
    let csv = write_csv(
        &dir,
        "special_chars.csv",
        &[
            "ID,Name,Description,Value",
            "1,Test & Co,\"Quoted, comma\",100.50",
            "2,Smith's Store,Contains 'quotes',200.75",
            "3,Multi\nLine,Contains newlines,300.25",
            "4,Empty Field,,400.00",
            "5,Unicode Test,测试中文,500.00",
            "6,Special Chars,!@#$%^&*(),600.00",
        ],
    );
    let db = dir.join("test_special.db");

    assert_success(&run_ingest([path_str(&db), path_str(&csv)]));

    let conn = open_db(&db);
    // The unquoted line break splits record 3 into two rows.
    assert_eq!(count_rows(&conn, "special_chars"), 7);

    let (name, description): (String, String) = conn
        .query_row("SELECT Name, Description FROM special_chars WHERE ID = ?1", ["1"], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .unwrap_or_else(|err| panic!("expected row 1: {err}"));
    assert_eq!(name, "Test & Co");
    assert_eq!(description, "Quoted, comma");

    let unicode: String = conn
        .query_row("SELECT Description FROM special_chars WHERE ID = ?1", ["5"], |row| row.get(0))
        .unwrap_or_else(|err| panic!("expected row 5: {err}"));
    assert_eq!(unicode, "测试中文");

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn malformed_rows_do_not_abort_the_run() {
    let dir = unique_temp_dir("ingest-malformed");
    let csv = write_csv(
        &dir,
        "malformed.csv",
        &[
            "Name,Age,City",
            "John,25,New York,Extra Field",
            "Jane,30",
            "Bob,35,Chicago,Extra,Fields,Here",
        ],
    );
    let db = dir.join("test_malformed.db");

    assert_success(&run_ingest([path_str(&db), path_str(&csv)]));

    let conn = open_db(&db);
    assert_eq!(count_rows(&conn, "malformed"), 3);
    assert_eq!(column_names(&conn, "malformed").len(), 3);

    let jane_city: String = conn
        .query_row("SELECT City FROM malformed WHERE Name = ?1", ["Jane"], |row| row.get(0))
        .unwrap_or_else(|err| panic!("expected Jane row: {err}"));
    assert_eq!(jane_city, "");

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn overflow_can_be_merged_into_last_column() {
    let dir = unique_temp_dir("ingest-merge");
    let csv = write_csv(&dir, "wide.csv", &["Name,Age,City", "John,25,NYC,Extra"]);
    let db = dir.join("wide.db");

    assert_success(&run_ingest([
        path_str(&db),
        path_str(&csv),
        "--overflow",
        "merge-into-last",
    ]));

    let conn = open_db(&db);
    let city: String = conn
        .query_row("SELECT City FROM wide", [], |row| row.get(0))
        .unwrap_or_else(|err| panic!("expected wide row: {err}"));
    assert_eq!(city, "NYC,Extra");

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn missing_source_fails_without_creating_a_table() {
    let dir = unique_temp_dir("ingest-missing");
    let db = dir.join("test.db");

    let output = run_ingest([path_str(&db), "nonexistent.csv"]);
    assert!(!output.status.success());
    let text = combined_output(&output);
    assert!(text.contains("not found"), "output: {text}");
    assert!(!db.exists());

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn wrong_argument_count_prints_usage() {
    let output = run_ingest(["only_one_arg"]);
    assert!(!output.status.success());
    let text = combined_output(&output);
    assert!(text.contains("Usage:"), "output: {text}");
    assert!(!Path::new("only_one_arg").exists());

    let output = run_ingest(["a.db", "b.csv", "c.csv"]);
    assert!(!output.status.success());
    assert!(combined_output(&output).contains("Usage:"));
}

#[test]
fn help_documents_every_option() {
    let stdout = assert_success(&run_ingest(["--help"]));
    for flag in ["--replace", "--overflow", "--delimiter", "--json"] {
        assert!(stdout.contains(flag), "missing {flag} in help:\n{stdout}");
    }
    assert!(stdout.contains("Field delimiter"), "help:\n{stdout}");
}

#[test]
fn invalid_delimiter_is_a_usage_error() {
    let dir = unique_temp_dir("ingest-delimiter");
    let csv = write_csv(&dir, "t.csv", &["a,b", "1,2"]);
    let db = dir.join("t.db");

    let output = run_ingest([path_str(&db), path_str(&csv), "--delimiter", ";;"]);
    assert!(!output.status.success());
    assert!(combined_output(&output).contains("Usage:"));
    assert!(!db.exists());

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn header_only_csv_creates_empty_table() {
    let dir = unique_temp_dir("ingest-empty");
    let csv = dir.join("empty.csv");
    fs::write(&csv, "Name,Age,City\n").unwrap_or_else(|err| panic!("failed to write csv: {err}"));
    let db = dir.join("test_empty.db");

    let stdout = assert_success(&run_ingest([path_str(&db), path_str(&csv)]));
    assert!(stdout.contains("0 rows"), "stdout: {stdout}");

    let conn = open_db(&db);
    assert_eq!(count_rows(&conn, "empty"), 0);
    assert_eq!(column_names(&conn, "empty"), vec!["Name", "Age", "City"]);

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn existing_table_fails_unless_replace_is_given() {
    let dir = unique_temp_dir("ingest-existing");
    let csv = write_csv(&dir, "people.csv", &["Name", "Ada", "Grace"]);
    let db = dir.join("people.db");

    assert_success(&run_ingest([path_str(&db), path_str(&csv)]));

    let second = run_ingest([path_str(&db), path_str(&csv)]);
    assert!(!second.status.success());
    assert!(combined_output(&second).contains("already exists"));
    assert_eq!(count_rows(&open_db(&db), "people"), 2);

    write_csv(&dir, "people.csv", &["Name", "Linus"]);
    assert_success(&run_ingest([path_str(&db), path_str(&csv), "--replace"]));
    assert_eq!(count_rows(&open_db(&db), "people"), 1);

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn json_output_reports_summary() {
    let dir = unique_temp_dir("ingest-json");
    let csv = write_csv(&dir, "t.csv", &["Name,Age,City", "John,25,NYC,Extra", "Jane,30"]);
    let db = dir.join("t.db");

    let stdout = assert_success(&run_ingest([path_str(&db), path_str(&csv), "--json"]));
    let payload: Value = serde_json::from_str(stdout.trim())
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"));

    assert_eq!(payload["contract_version"], "ingest.v1");
    assert_eq!(payload["table"], "t");
    assert_eq!(payload["rows_written"], 2);
    assert_eq!(payload["padded_rows"], 1);
    assert_eq!(payload["overflowed_rows"], 1);
    assert_eq!(payload["columns"], serde_json::json!(["Name", "Age", "City"]));
    assert_eq!(payload["replaced_existing"], false);

    let _ = fs::remove_dir_all(dir);
}
