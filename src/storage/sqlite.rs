//! SQLite storage implementation
//!
//! This module provides the reference `StorageBackend`, a single SQLite file
//! inside the crawl directory. Merges run inside one transaction that
//! renames the staging table over the committed snapshot, so a crash at any
//! point before commit leaves the previous snapshot and all segments intact.

use crate::state::{CrawlDatum, Injection, Status};
use crate::storage::merge::{resolve, Candidate, MergeStats};
use crate::storage::schema::{
    initialize_schema, BACKUP_TABLE, CREATE_NEW_TABLE_SQL, CURRENT_TABLE, DATUM_COLUMNS,
    INSTALL_NEW_TABLE_SQL, MERGE_CANDIDATES_SQL, NEW_TABLE,
};
use crate::storage::traits::{StorageBackend, StorageError, StorageResult};
use crate::storage::{LockRecord, SegmentName};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Statement};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// File name of the database inside the crawl directory
pub const DATABASE_FILE: &str = "crawldb.sqlite";

/// SQLite storage backend
pub struct SqliteBackend {
    crawl_path: PathBuf,
    conn: Option<Connection>,
    writer: Option<SegmentName>,
}

impl SqliteBackend {
    /// Creates a backend for the crawl directory at `crawl_path`
    ///
    /// Nothing is touched on disk until `open` is called.
    pub fn new(crawl_path: impl Into<PathBuf>) -> Self {
        Self {
            crawl_path: crawl_path.into(),
            conn: None,
            writer: None,
        }
    }

    pub fn crawl_path(&self) -> &Path {
        &self.crawl_path
    }

    pub fn database_path(&self) -> PathBuf {
        self.crawl_path.join(DATABASE_FILE)
    }

    /// Number of keys in the snapshot replaced by the last merge
    pub fn backup_len(&self) -> StorageResult<u64> {
        let conn = self.conn()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![BACKUP_TABLE],
            |row| row.get(0),
        )?;
        if !exists {
            return Ok(0);
        }
        let count: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", BACKUP_TABLE), [], |row| {
                row.get(0)
            })?;
        Ok(count as u64)
    }

    fn conn(&self) -> StorageResult<&Connection> {
        self.conn.as_ref().ok_or(StorageError::Closed)
    }

    fn conn_mut(&mut self) -> StorageResult<&mut Connection> {
        self.conn.as_mut().ok_or(StorageError::Closed)
    }

    fn last_segment_name(&self) -> StorageResult<Option<SegmentName>> {
        let name: Option<String> = self
            .conn()?
            .query_row("SELECT MAX(name) FROM segments", [], |row| row.get(0))?;
        Ok(name.as_deref().and_then(SegmentName::parse))
    }

    fn key_is_known(&self, key: &str) -> StorageResult<bool> {
        let known: bool = self.conn()?.query_row(
            "SELECT EXISTS(SELECT 1 FROM crawldb WHERE key = ?1)
                 OR EXISTS(SELECT 1 FROM injections WHERE key = ?1)",
            params![key],
            |row| row.get(0),
        )?;
        Ok(known)
    }

    fn append_segment(&self, table: &str, datums: &[CrawlDatum]) -> StorageResult<()> {
        let segment = self.writer.as_ref().ok_or(StorageError::NoSegmentWriter)?;
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "INSERT OR REPLACE INTO {} (segment, {}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            table, DATUM_COLUMNS
        ))?;
        for datum in datums {
            stmt.execute(params![
                segment.as_str(),
                datum.key,
                datum.url,
                datum.status.to_db_string(),
                datum.retry,
                datum.execute_count,
                datum.fetch_time.map(|t| t.to_rfc3339()),
                datum.code,
                datum.location,
                serde_json::to_string(&datum.metadata)?,
            ])?;
        }
        Ok(())
    }
}

/// Inserts a datum into a snapshot table
fn insert_datum(stmt: &mut Statement<'_>, datum: &CrawlDatum) -> StorageResult<()> {
    stmt.execute(params![
        datum.key,
        datum.url,
        datum.status.to_db_string(),
        datum.retry,
        datum.execute_count,
        datum.fetch_time.map(|t| t.to_rfc3339()),
        datum.code,
        datum.location,
        serde_json::to_string(&datum.metadata)?,
    ])?;
    Ok(())
}

/// Reads the nine datum columns starting at column 0
fn read_datum(row: &Row<'_>) -> StorageResult<CrawlDatum> {
    let key: String = row.get(0)?;
    let status: String = row.get(2)?;
    let status = Status::from_db_string(&status).ok_or_else(|| StorageError::Corrupt {
        key: key.clone(),
        reason: format!("unknown status '{}'", status),
    })?;
    let fetch_time: Option<String> = row.get(5)?;
    let fetch_time = match fetch_time {
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(&raw)
                .map_err(|e| StorageError::Corrupt {
                    key: key.clone(),
                    reason: format!("bad fetch_time '{}': {}", raw, e),
                })?
                .with_timezone(&Utc),
        ),
        None => None,
    };
    let metadata: String = row.get(8)?;

    Ok(CrawlDatum {
        url: row.get(1)?,
        status,
        retry: row.get(3)?,
        execute_count: row.get(4)?,
        fetch_time,
        code: row.get(6)?,
        location: row.get(7)?,
        metadata: serde_json::from_str(&metadata)?,
        key,
    })
}

/// Reads one row of `MERGE_CANDIDATES_SQL`
fn read_candidate(row: &Row<'_>) -> StorageResult<Candidate> {
    let datum = read_datum(row)?;
    let request: Option<String> = row.get(9)?;
    match request {
        None => Ok(Candidate::observed(datum)),
        Some(raw) => {
            let injection =
                Injection::from_db_string(&raw).ok_or_else(|| StorageError::Corrupt {
                    key: datum.key.clone(),
                    reason: format!("unknown injection request '{}'", raw),
                })?;
            Ok(Candidate::requested(datum, injection))
        }
    }
}

/// Candidates of the key being merged, tagged with whether they came from
/// the committed snapshot
type KeyGroup = Vec<(bool, Candidate)>;

/// Resolves one key's candidates into the staging table
fn flush_key(
    group: &mut KeyGroup,
    insert: &mut Statement<'_>,
    stats: &mut MergeStats,
) -> StorageResult<()> {
    if group.is_empty() {
        return Ok(());
    }

    let previous = group
        .iter()
        .find(|(current, _)| *current)
        .map(|(_, c)| c.datum.clone());
    stats.candidates += group.iter().filter(|(current, _)| !current).count() as u64;

    if let Some(resolution) = resolve(group.drain(..).map(|(_, c)| c)) {
        insert_datum(insert, &resolution.datum)?;
        stats.record(&resolution, previous.as_ref());
    }
    Ok(())
}

impl StorageBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    // ===== Lifecycle =====

    fn open(&mut self) -> StorageResult<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.crawl_path)?;
        let conn = Connection::open(self.database_path())?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        initialize_schema(&conn)?;
        tracing::debug!("Opened crawl database at {}", self.database_path().display());
        self.conn = Some(conn);
        Ok(())
    }

    fn close(&mut self) -> StorageResult<()> {
        self.close_segment_writer()?;
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, e)| StorageError::Sqlite(e))?;
            tracing::debug!("Closed crawl database at {}", self.database_path().display());
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    fn is_db_exists(&self) -> bool {
        self.database_path().exists()
    }

    fn clear(&mut self) -> StorageResult<()> {
        self.close()?;
        if self.crawl_path.exists() {
            std::fs::remove_dir_all(&self.crawl_path)?;
            tracing::info!("Cleared crawl database at {}", self.crawl_path.display());
        }
        Ok(())
    }

    // ===== Injection =====

    fn inject(&mut self, datum: &CrawlDatum, force: bool) -> StorageResult<bool> {
        if !force && self.key_is_known(&datum.key)? {
            return Ok(false);
        }

        let injection = Injection::from_force(force);
        self.conn()?.execute(
            &format!(
                "INSERT OR REPLACE INTO injections (request, {}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                DATUM_COLUMNS
            ),
            params![
                injection.to_db_string(),
                datum.key,
                datum.url,
                datum.status.to_db_string(),
                datum.retry,
                datum.execute_count,
                datum.fetch_time.map(|t| t.to_rfc3339()),
                datum.code,
                datum.location,
                serde_json::to_string(&datum.metadata)?,
            ],
        )?;
        Ok(true)
    }

    fn inject_all(&mut self, datums: &[CrawlDatum], force: bool) -> StorageResult<usize> {
        self.conn()?.execute_batch("BEGIN")?;
        let mut staged = 0;
        for datum in datums {
            match self.inject(datum, force) {
                Ok(true) => staged += 1,
                Ok(false) => {}
                Err(e) => {
                    self.conn()?.execute_batch("ROLLBACK")?;
                    return Err(e);
                }
            }
        }
        self.conn()?.execute_batch("COMMIT")?;
        Ok(staged)
    }

    // ===== Lock =====

    fn lock(&mut self, config_hash: Option<&str>) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        self.conn()?.execute(
            "UPDATE crawl_lock SET locked = 1, locked_at = ?1, config_hash = ?2 WHERE id = 1",
            params![now, config_hash],
        )?;
        Ok(())
    }

    fn unlock(&mut self) -> StorageResult<()> {
        self.conn()?
            .execute("UPDATE crawl_lock SET locked = 0 WHERE id = 1", [])?;
        Ok(())
    }

    fn lock_record(&self) -> StorageResult<LockRecord> {
        let record = self
            .conn()?
            .query_row(
                "SELECT locked, locked_at, config_hash FROM crawl_lock WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, bool>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;

        Ok(match record {
            Some((locked, locked_at, config_hash)) => LockRecord {
                locked,
                locked_at: locked_at
                    .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
                    .map(|t| t.with_timezone(&Utc)),
                config_hash,
            },
            None => LockRecord::default(),
        })
    }

    // ===== Snapshot reads =====

    fn get(&self, key: &str) -> StorageResult<Option<CrawlDatum>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM {} WHERE key = ?1",
            DATUM_COLUMNS, CURRENT_TABLE
        ))?;
        let mut rows = stmt.query(params![key])?;
        match rows.next()? {
            Some(row) => Ok(Some(read_datum(row)?)),
            None => Ok(None),
        }
    }

    fn scan(&self, after: Option<&str>, limit: usize) -> StorageResult<Vec<CrawlDatum>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM {} WHERE ?1 IS NULL OR key > ?1 ORDER BY key LIMIT ?2",
            DATUM_COLUMNS, CURRENT_TABLE
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut rows = stmt.query(params![after, limit])?;

        let mut datums = Vec::new();
        while let Some(row) = rows.next()? {
            datums.push(read_datum(row)?);
        }
        Ok(datums)
    }

    fn count_by_status(&self) -> StorageResult<BTreeMap<Status, u64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM crawldb GROUP BY status")?;
        let mut rows = stmt.query([])?;

        let mut counts = BTreeMap::new();
        while let Some(row) = rows.next()? {
            let raw: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            let status = Status::from_db_string(&raw).ok_or_else(|| StorageError::Corrupt {
                key: String::from("*"),
                reason: format!("unknown status '{}'", raw),
            })?;
            counts.insert(status, count as u64);
        }
        Ok(counts)
    }

    fn count_given_up(&self, max_retry: u32, max_execute_count: Option<u32>) -> StorageResult<u64> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM crawldb
             WHERE status IN ('unfetched', 'retry')
               AND (retry > ?1 OR (?2 IS NOT NULL AND execute_count > ?2))",
            params![max_retry, max_execute_count],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn count_pending_injections(&self) -> StorageResult<u64> {
        let count: i64 =
            self.conn()?
                .query_row("SELECT COUNT(*) FROM injections", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    // ===== Segments =====

    fn init_segment_writer(&mut self) -> StorageResult<SegmentName> {
        if let Some(open) = &self.writer {
            return Err(StorageError::SegmentWriterOpen(open.clone()));
        }
        let name = SegmentName::next(Utc::now(), self.last_segment_name()?.as_ref());
        self.conn()?.execute(
            "INSERT INTO segments (name, created_at) VALUES (?1, ?2)",
            params![name.as_str(), Utc::now().to_rfc3339()],
        )?;
        tracing::debug!("Opened segment {}", name);
        self.writer = Some(name.clone());
        Ok(name)
    }

    fn write_fetch_segment(&mut self, datum: &CrawlDatum) -> StorageResult<()> {
        self.append_segment("segment_fetch", std::slice::from_ref(datum))
    }

    fn write_parse_segment(&mut self, datums: &[CrawlDatum]) -> StorageResult<()> {
        if datums.is_empty() {
            return Ok(());
        }
        self.conn()?.execute_batch("SAVEPOINT parse_segment")?;
        match self.append_segment("segment_parse", datums) {
            Ok(()) => {
                self.conn()?.execute_batch("RELEASE parse_segment")?;
                Ok(())
            }
            Err(e) => {
                self.conn()?
                    .execute_batch("ROLLBACK TO parse_segment; RELEASE parse_segment")?;
                Err(e)
            }
        }
    }

    fn close_segment_writer(&mut self) -> StorageResult<()> {
        if let Some(name) = self.writer.take() {
            self.conn()?.execute(
                "UPDATE segments SET closed_at = ?1 WHERE name = ?2",
                params![Utc::now().to_rfc3339(), name.as_str()],
            )?;
            tracing::debug!("Closed segment {}", name);
        }
        Ok(())
    }

    fn pending_segments(&self) -> StorageResult<Vec<SegmentName>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT name FROM segments ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names
            .iter()
            .filter_map(|name| SegmentName::parse(name))
            .collect())
    }

    // ===== Merge =====

    fn merge(&mut self) -> StorageResult<MergeStats> {
        if let Some(open) = &self.writer {
            return Err(StorageError::SegmentWriterOpen(open.clone()));
        }
        let segments = self.pending_segments()?.len();
        let conn = self.conn_mut()?;
        let tx = conn.transaction()?;
        let mut stats = MergeStats {
            segments,
            ..MergeStats::default()
        };

        tx.execute_batch(CREATE_NEW_TABLE_SQL)?;
        {
            let mut select = tx.prepare(MERGE_CANDIDATES_SQL)?;
            let mut insert = tx.prepare(&format!(
                "INSERT INTO {} ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                NEW_TABLE, DATUM_COLUMNS
            ))?;
            let mut rows = select.query([])?;
            let mut group: KeyGroup = Vec::new();

            while let Some(row) = rows.next()? {
                let candidate = read_candidate(row)?;
                let origin: String = row.get(10)?;
                if group
                    .first()
                    .is_some_and(|(_, first)| first.datum.key != candidate.datum.key)
                {
                    flush_key(&mut group, &mut insert, &mut stats)?;
                }
                group.push((origin == "0", candidate));
            }
            flush_key(&mut group, &mut insert, &mut stats)?;
        }
        tx.execute_batch(INSTALL_NEW_TABLE_SQL)?;
        tx.commit()?;

        tracing::info!(
            "Merged {} segment(s): {} keys ({} new, {} updated, {} forced)",
            stats.segments,
            stats.total_keys,
            stats.new_keys,
            stats.updated_keys,
            stats.forced
        );
        Ok(stats)
    }
}

impl Drop for SqliteBackend {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("Failed to close crawl database: {}", e);
        }
    }
}
