use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::{Connection, params};
use serde::Serialize;
use tracing::debug;

/// `event_type` code of open-water rows in `pms_events`.
pub const OPEN_WATER_EVENT_TYPE: &str = "OW";

pub const RESULTS_TYPE_AGE_GROUP_OVERALL: &str = "Age Group+Overall";

const RESULTS_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS pms_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id INTEGER NOT NULL,
    event_date TEXT NOT NULL,
    category TEXT NOT NULL,
    distance TEXT NOT NULL,
    results_type TEXT NOT NULL,
    results_file TEXT NOT NULL,
    remote INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_pms_results_event_date ON pms_results(event_date);

CREATE TABLE IF NOT EXISTS pms_events (
    id INTEGER PRIMARY KEY,
    event_type TEXT NOT NULL,
    obsolete INTEGER NOT NULL DEFAULT 0,
    title TEXT NOT NULL
);
"#;

/// One row of the public results index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultLinkRow {
    pub event_id: i64,
    pub event_date: NaiveDate,
    pub category: String,
    pub distance: String,
    pub results_type: String,
    pub results_file: String,
    pub remote: bool,
}

pub trait ResultStore {
    /// Rows whose `results_file` contains `file_name` and whose event date
    /// falls inside `year`.
    fn count_installed(&mut self, file_name: &str, year: i32) -> Result<usize>;
    /// Ids of non-obsolete open-water events whose title contains `keyword`.
    fn find_open_water_events(&mut self, keyword: &str) -> Result<Vec<i64>>;
    fn insert_result_link(&mut self, row: &ResultLinkRow) -> Result<()>;
}

pub struct SqliteResultStore {
    connection: Connection,
}

impl SqliteResultStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        let connection = Connection::open(db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;
        connection
            .busy_timeout(Duration::from_secs(5))
            .context("failed to set sqlite busy timeout")?;
        Self::with_connection(connection)
    }

    pub fn with_connection(connection: Connection) -> Result<Self> {
        connection
            .execute_batch(RESULTS_SCHEMA_SQL)
            .context("failed to initialize results schema")?;
        Ok(Self { connection })
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

impl ResultStore for SqliteResultStore {
    fn count_installed(&mut self, file_name: &str, year: i32) -> Result<usize> {
        let (first_day, last_day) = year_bounds(year);
        debug!(file_name, year, "counting installed result links");
        let count: i64 = self
            .connection
            .query_row(
                "SELECT COUNT(*)
                 FROM pms_results
                 WHERE instr(results_file, ?1) > 0
                   AND event_date >= ?2
                   AND event_date <= ?3",
                params![file_name, first_day, last_day],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to count pms_results rows for {file_name}"))?;
        usize::try_from(count).context("count does not fit into usize")
    }

    fn find_open_water_events(&mut self, keyword: &str) -> Result<Vec<i64>> {
        debug!(keyword, "searching open-water event titles");
        let mut statement = self
            .connection
            .prepare(
                "SELECT id
                 FROM pms_events
                 WHERE obsolete = 0
                   AND event_type = ?1
                   AND instr(title, ?2) > 0
                 ORDER BY id ASC",
            )
            .context("failed to prepare pms_events lookup")?;
        let rows = statement
            .query_map(params![OPEN_WATER_EVENT_TYPE, keyword], |row| {
                row.get::<_, i64>(0)
            })
            .context("failed to run pms_events lookup")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to decode pms_events row")?);
        }
        Ok(out)
    }

    fn insert_result_link(&mut self, row: &ResultLinkRow) -> Result<()> {
        self.connection
            .execute(
                "INSERT INTO pms_results (
                    event_id,
                    event_date,
                    category,
                    distance,
                    results_type,
                    results_file,
                    remote
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    row.event_id,
                    row.event_date.format("%Y-%m-%d").to_string(),
                    row.category,
                    row.distance,
                    row.results_type,
                    row.results_file,
                    if row.remote { 1i64 } else { 0i64 },
                ],
            )
            .with_context(|| format!("failed to insert pms_results row for {}", row.results_file))?;
        Ok(())
    }
}

fn year_bounds(year: i32) -> (String, String) {
    (format!("{year:04}-01-01"), format!("{year:04}-12-31"))
}
