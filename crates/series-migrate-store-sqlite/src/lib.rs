use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OpenFlags};
use series_migrate_core::{
    DatasetPair, Partition, RepairError, Sample, SeriesStore, LEGACY_VARIANT,
};
use tracing::debug;

pub const TABLE_NAME: &str = "TimeSeries";
const REQUIRED_COLUMNS: [&str; 4] = ["dataset", "variant", "x", "y"];

// ?1 = persystem dataset, ?2 = sum dataset, ?3 = legacy variant.
const OVERLAP_EXISTS_SQL: &str = r"
SELECT EXISTS(
  SELECT 1 FROM TimeSeries
  WHERE dataset = ?1 AND variant = ?3
    AND x IN (SELECT x FROM TimeSeries WHERE dataset = ?2 AND variant = ?3 AND x IS NOT NULL)
)";

const DELETE_OVERLAPPING_SQL: &str = r"
DELETE FROM TimeSeries
WHERE dataset = ?1 AND variant = ?3
  AND x IN (SELECT x FROM TimeSeries WHERE dataset = ?2 AND variant = ?3 AND x IS NOT NULL)";

const LEGACY_EXISTS_SQL: &str = r"
SELECT EXISTS(
  SELECT 1 FROM TimeSeries
  WHERE dataset = ?1 AND variant = ?3
    AND x NOT IN (SELECT x FROM TimeSeries WHERE dataset = ?2 AND variant = ?3 AND x IS NOT NULL)
)";

const PROMOTE_LEGACY_SQL: &str = r"
UPDATE TimeSeries SET dataset = ?2
WHERE dataset = ?1 AND variant = ?3
  AND x NOT IN (SELECT x FROM TimeSeries WHERE dataset = ?2 AND variant = ?3 AND x IS NOT NULL)";

const LIST_DATASETS_SQL: &str =
    "SELECT DISTINCT dataset FROM TimeSeries WHERE dataset IS NOT NULL ORDER BY dataset ASC";

const LIST_VARIANTS_SQL: &str = "SELECT DISTINCT variant FROM TimeSeries
     WHERE dataset = ?1 AND variant IS NOT NULL
     ORDER BY variant ASC";

const LOAD_PARTITION_SQL: &str =
    "SELECT x, y FROM TimeSeries WHERE dataset = ?1 AND variant = ?2 ORDER BY x ASC";

const DELETE_PARTITION_SQL: &str = "DELETE FROM TimeSeries WHERE dataset = ?1 AND variant = ?2";

const INSERT_SAMPLE_SQL: &str =
    "INSERT INTO TimeSeries(dataset, variant, x, y) VALUES (?1, ?2, ?3, ?4)";

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open an existing SQLite store read-write. A missing file is an error, not
    /// a new empty database.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        Self::configure(conn)
    }

    /// Open a private in-memory store.
    ///
    /// # Errors
    /// Returns an error when the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        Self::configure(conn)
    }

    fn configure(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA busy_timeout = 5000;")
            .context("failed to configure sqlite pragmas")?;
        Ok(Self { conn })
    }

    /// Check that the time-series table exists with every column the passes touch.
    ///
    /// # Errors
    /// Returns an error naming the missing table or columns.
    pub fn ensure_schema(&self) -> Result<()> {
        if !table_exists(&self.conn, TABLE_NAME)? {
            return Err(anyhow!("database schema is invalid: table {TABLE_NAME} does not exist"));
        }

        let columns = table_columns(&self.conn, TABLE_NAME)?;
        let missing = REQUIRED_COLUMNS
            .iter()
            .filter(|column| !columns.iter().any(|name| name == *column))
            .copied()
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(anyhow!(
                "database schema is invalid: table {TABLE_NAME} is missing columns {}",
                missing.join(", ")
            ));
        }

        Ok(())
    }

    fn pair_flag(&self, sql: &str, pair: DatasetPair, what: &str) -> Result<bool> {
        let mut stmt = self
            .conn
            .prepare_cached(sql)
            .with_context(|| format!("failed to prepare {what} query"))?;
        let flag = stmt
            .query_row(params![pair.persystem.as_str(), pair.sum.as_str(), LEGACY_VARIANT], |row| {
                row.get::<_, bool>(0)
            })
            .with_context(|| {
                format!("failed to run {what} query for {} and {}", pair.persystem, pair.sum)
            })?;
        Ok(flag)
    }

    fn pair_execute(&self, sql: &str, pair: DatasetPair, what: &str) -> Result<usize> {
        let mut stmt = self
            .conn
            .prepare_cached(sql)
            .with_context(|| format!("failed to prepare {what} statement"))?;
        let changed = stmt
            .execute(params![pair.persystem.as_str(), pair.sum.as_str(), LEGACY_VARIANT])
            .with_context(|| format!("failed to {what} for {} and {}", pair.persystem, pair.sum))?;
        debug!(persystem = %pair.persystem, sum = %pair.sum, changed, "{what}");
        Ok(changed)
    }

    fn list_strings(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params, |row| row.get::<_, String>(0))?;
        let mut values = Vec::new();
        for row in rows {
            values.push(row?);
        }
        Ok(values)
    }
}

impl SeriesStore for SqliteStore {
    fn overlap_exists(&self, pair: DatasetPair) -> Result<bool> {
        self.pair_flag(OVERLAP_EXISTS_SQL, pair, "overlap")
    }

    fn delete_overlapping(&mut self, pair: DatasetPair) -> Result<usize> {
        self.pair_execute(DELETE_OVERLAPPING_SQL, pair, "delete overlapping rows")
    }

    fn legacy_exists(&self, pair: DatasetPair) -> Result<bool> {
        self.pair_flag(LEGACY_EXISTS_SQL, pair, "legacy rows")
    }

    fn promote_legacy(&mut self, pair: DatasetPair) -> Result<usize> {
        self.pair_execute(PROMOTE_LEGACY_SQL, pair, "promote legacy rows")
    }

    fn datasets(&self) -> Result<Vec<String>> {
        self.list_strings(LIST_DATASETS_SQL, []).context("failed to list datasets")
    }

    fn variants(&self, dataset: &str) -> Result<Vec<String>> {
        self.list_strings(LIST_VARIANTS_SQL, params![dataset])
            .with_context(|| format!("failed to list variants of {dataset}"))
    }

    fn load_partition(&self, partition: &Partition) -> Result<Vec<Sample>> {
        load_rows(&self.conn, partition)
    }

    fn replace_partition<F>(
        &mut self,
        partition: &Partition,
        samples: &[Sample],
        verify: F,
    ) -> Result<(), RepairError>
    where
        F: FnOnce(&[Sample]) -> Result<(), RepairError>,
    {
        let tx = self
            .conn
            .transaction()
            .with_context(|| format!("failed to start transaction for {partition}"))?;

        let deleted = tx
            .execute(DELETE_PARTITION_SQL, params![partition.dataset, partition.variant])
            .with_context(|| format!("failed to clear partition {partition}"))?;

        {
            let mut insert = tx
                .prepare_cached(INSERT_SAMPLE_SQL)
                .context("failed to prepare sample insert")?;
            for sample in samples {
                insert
                    .execute(params![partition.dataset, partition.variant, sample.x, sample.y])
                    .with_context(|| {
                        format!("failed to insert sample x={} into {partition}", sample.x)
                    })?;
            }
        }

        verify(&load_rows(&tx, partition)?)?;

        tx.commit().with_context(|| format!("failed to commit partition {partition}"))?;
        debug!(%partition, deleted, inserted = samples.len(), "partition rewritten");
        Ok(())
    }
}

fn load_rows(conn: &Connection, partition: &Partition) -> Result<Vec<Sample>> {
    let mut stmt = conn.prepare_cached(LOAD_PARTITION_SQL)?;
    let rows = stmt
        .query_map(params![partition.dataset, partition.variant], |row| {
            Ok(Sample { x: row.get(0)?, y: row.get(1)? })
        })
        .with_context(|| format!("failed to load partition {partition}"))?;

    let mut samples = Vec::new();
    for row in rows {
        samples.push(row.with_context(|| format!("malformed row in partition {partition}"))?);
    }
    Ok(samples)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        columns.push(row.get::<_, String>(1)?);
    }
    Ok(columns)
}
