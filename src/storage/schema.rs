//! Database schema definitions
//!
//! This module contains all SQL schema definitions for the SQLite crawl
//! database.
//!
//! Layout:
//! - `crawldb`: the committed snapshot, one row per key
//! - `crawldb_new`: staging table, only present while a merge runs
//! - `crawldb_old`: the snapshot replaced by the last merge (backup)
//! - `segments`, `segment_fetch`, `segment_parse`: unmerged iteration output
//! - `injections`: staged seed requests
//! - `crawl_lock`: the single advisory lock row

/// Name of the committed snapshot table
pub const CURRENT_TABLE: &str = "crawldb";

/// Name of the staging table a merge writes into
pub const NEW_TABLE: &str = "crawldb_new";

/// Name of the backup table holding the previous snapshot
pub const BACKUP_TABLE: &str = "crawldb_old";

/// Datum columns shared by every table that stores datums
pub const DATUM_COLUMNS: &str =
    "key, url, status, retry, execute_count, fetch_time, code, location, metadata";

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Committed snapshot: exactly one row per key
CREATE TABLE IF NOT EXISTS crawldb (
    key TEXT PRIMARY KEY,
    url TEXT NOT NULL,
    status TEXT NOT NULL,
    retry INTEGER NOT NULL DEFAULT 0,
    execute_count INTEGER NOT NULL DEFAULT 0,
    fetch_time TEXT,
    code INTEGER,
    location TEXT,
    metadata TEXT NOT NULL DEFAULT '{}'
);

-- One row per iteration that has not been merged yet
CREATE TABLE IF NOT EXISTS segments (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    closed_at TEXT
);

-- Fetch outcomes, one per attempted key and segment
CREATE TABLE IF NOT EXISTS segment_fetch (
    segment TEXT NOT NULL REFERENCES segments(name),
    key TEXT NOT NULL,
    url TEXT NOT NULL,
    status TEXT NOT NULL,
    retry INTEGER NOT NULL DEFAULT 0,
    execute_count INTEGER NOT NULL DEFAULT 0,
    fetch_time TEXT,
    code INTEGER,
    location TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    PRIMARY KEY (segment, key)
);

-- Discovered outlinks, one per key and segment
CREATE TABLE IF NOT EXISTS segment_parse (
    segment TEXT NOT NULL REFERENCES segments(name),
    key TEXT NOT NULL,
    url TEXT NOT NULL,
    status TEXT NOT NULL,
    retry INTEGER NOT NULL DEFAULT 0,
    execute_count INTEGER NOT NULL DEFAULT 0,
    fetch_time TEXT,
    code INTEGER,
    location TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    PRIMARY KEY (segment, key)
);

-- Seed requests waiting for the next merge
CREATE TABLE IF NOT EXISTS injections (
    key TEXT PRIMARY KEY,
    request TEXT NOT NULL,
    url TEXT NOT NULL,
    status TEXT NOT NULL,
    retry INTEGER NOT NULL DEFAULT 0,
    execute_count INTEGER NOT NULL DEFAULT 0,
    fetch_time TEXT,
    code INTEGER,
    location TEXT,
    metadata TEXT NOT NULL DEFAULT '{}'
);

-- Advisory lock marker
CREATE TABLE IF NOT EXISTS crawl_lock (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    locked INTEGER NOT NULL DEFAULT 0,
    locked_at TEXT,
    config_hash TEXT
);

INSERT OR IGNORE INTO crawl_lock (id, locked) VALUES (1, 0);
"#;

/// Recreates the empty staging table a merge writes into
pub const CREATE_NEW_TABLE_SQL: &str = r#"
DROP TABLE IF EXISTS crawldb_new;
CREATE TABLE crawldb_new (
    key TEXT PRIMARY KEY,
    url TEXT NOT NULL,
    status TEXT NOT NULL,
    retry INTEGER NOT NULL DEFAULT 0,
    execute_count INTEGER NOT NULL DEFAULT 0,
    fetch_time TEXT,
    code INTEGER,
    location TEXT,
    metadata TEXT NOT NULL DEFAULT '{}'
);
"#;

/// Installs the staging table as the committed snapshot and drops the
/// consumed segments and injections
pub const INSTALL_NEW_TABLE_SQL: &str = r#"
DROP TABLE IF EXISTS crawldb_old;
ALTER TABLE crawldb RENAME TO crawldb_old;
ALTER TABLE crawldb_new RENAME TO crawldb;
DELETE FROM segment_fetch;
DELETE FROM segment_parse;
DELETE FROM segments;
DELETE FROM injections;
"#;

/// Every candidate for every key, grouped by key and ordered oldest first
///
/// The `origin` column orders candidates within a key: the committed
/// snapshot first, then segments by name (parse output before fetch output),
/// then staged injections.
pub const MERGE_CANDIDATES_SQL: &str = r#"
SELECT key, url, status, retry, execute_count, fetch_time, code, location, metadata, request, origin
FROM (
    SELECT key, url, status, retry, execute_count, fetch_time, code, location, metadata,
           NULL AS request, '0' AS origin
    FROM crawldb
    UNION ALL
    SELECT key, url, status, retry, execute_count, fetch_time, code, location, metadata,
           NULL AS request, '1:' || segment || ':1' AS origin
    FROM segment_parse
    UNION ALL
    SELECT key, url, status, retry, execute_count, fetch_time, code, location, metadata,
           NULL AS request, '1:' || segment || ':2' AS origin
    FROM segment_fetch
    UNION ALL
    SELECT key, url, status, retry, execute_count, fetch_time, code, location, metadata,
           request, '2' AS origin
    FROM injections
)
ORDER BY key, origin
"#;

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The database connection
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
