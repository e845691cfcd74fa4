// Persistent request archive. Every ring-buffer insertion is mirrored here
// asynchronously when the archive is enabled; store failures log and drop.
// Retention (age and row count) is applied at write time, as are the privacy
// toggles: a row holds either the captured text or the sentinel, never both.

use anyhow::Result;
use chrono::Utc;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::observe::LogEntry;

const REDACTED: &str = "[redacted]";

static ARCHIVE: OnceCell<Mutex<Connection>> = OnceCell::new();

pub fn init_archive(path: PathBuf) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(&path)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS request_archive (
            id TEXT PRIMARY KEY,
            timestamp INTEGER NOT NULL,
            backend TEXT NOT NULL,
            dialect TEXT,
            user_id TEXT,
            category TEXT,
            status INTEGER NOT NULL,
            duration_ms INTEGER NOT NULL,
            input_tokens INTEGER DEFAULT 0,
            output_tokens INTEGER DEFAULT 0,
            query TEXT,
            response TEXT,
            error TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_archive_timestamp ON request_archive(timestamp DESC)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_archive_backend ON request_archive(backend)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_archive_user ON request_archive(user_id)",
        [],
    )?;

    tracing::info!("Archive initialized at {:?}", path);

    ARCHIVE
        .set(Mutex::new(conn))
        .map_err(|_| anyhow::anyhow!("Archive already initialized"))?;
    Ok(())
}

/// Queue an archive write for a completed request. No-op when the archive is
/// disabled or uninitialized; failures are logged and dropped.
pub fn submit(entry: &LogEntry) {
    let config = match crate::config::get_config() {
        Some(c) if c.archive.enabled => c.archive,
        _ => return,
    };
    if ARCHIVE.get().is_none() {
        return;
    }
    let entry = entry.clone();
    let write = move || {
        if let Err(e) = insert(&entry, config.store_queries, config.store_responses) {
            tracing::warn!("Archive write failed for {}: {}", entry.id, e);
            return;
        }
        if let Err(e) = prune(config.retention_days, config.max_entries) {
            tracing::warn!("Archive prune failed: {}", e);
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(write);
        }
        Err(_) => write(),
    }
}

fn insert(entry: &LogEntry, store_queries: bool, store_responses: bool) -> Result<()> {
    let conn = ARCHIVE
        .get()
        .ok_or_else(|| anyhow::anyhow!("Archive not initialized"))?;
    let conn = conn.lock();

    let query = if store_queries {
        entry.request_body.clone().unwrap_or_default()
    } else {
        REDACTED.to_string()
    };
    let response = if store_responses {
        entry.response_body.clone().unwrap_or_default()
    } else {
        REDACTED.to_string()
    };

    conn.execute(
        "INSERT OR REPLACE INTO request_archive
         (id, timestamp, backend, dialect, user_id, category, status, duration_ms,
          input_tokens, output_tokens, query, response, error)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        rusqlite::params![
            entry.id,
            entry.timestamp.timestamp_millis(),
            entry.backend,
            entry.dialect,
            entry.user_id,
            entry.category,
            entry.status as i64,
            entry.duration_ms,
            entry.input_tokens as i64,
            entry.output_tokens as i64,
            query,
            response,
            entry.error,
        ],
    )?;
    Ok(())
}

fn prune(retention_days: i64, max_entries: i64) -> Result<()> {
    let conn = ARCHIVE
        .get()
        .ok_or_else(|| anyhow::anyhow!("Archive not initialized"))?;
    let conn = conn.lock();

    let cutoff = Utc::now().timestamp_millis() - retention_days * 86_400_000;
    conn.execute(
        "DELETE FROM request_archive WHERE timestamp < ?1",
        [cutoff],
    )?;

    conn.execute(
        "DELETE FROM request_archive WHERE id IN (
            SELECT id FROM request_archive ORDER BY timestamp DESC LIMIT -1 OFFSET ?1
        )",
        [max_entries],
    )?;
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedRequest {
    pub id: String,
    pub timestamp: i64,
    pub backend: String,
    pub dialect: Option<String>,
    pub user_id: Option<String>,
    pub category: Option<String>,
    pub status: u16,
    pub duration_ms: i64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub query: Option<String>,
    pub response: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryFilter {
    pub backend: Option<String>,
    pub user_id: Option<String>,
    pub category: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

fn row_to_request(row: &rusqlite::Row<'_>) -> rusqlite::Result<ArchivedRequest> {
    Ok(ArchivedRequest {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        backend: row.get(2)?,
        dialect: row.get(3)?,
        user_id: row.get(4)?,
        category: row.get(5)?,
        status: row.get::<_, i64>(6)? as u16,
        duration_ms: row.get(7)?,
        input_tokens: row.get::<_, i64>(8)? as u64,
        output_tokens: row.get::<_, i64>(9)? as u64,
        query: row.get(10)?,
        response: row.get(11)?,
        error: row.get(12)?,
    })
}

const SELECT_COLUMNS: &str = "id, timestamp, backend, dialect, user_id, category, status, \
     duration_ms, input_tokens, output_tokens, query, response, error";

pub fn query_history(filter: &HistoryFilter) -> Result<Vec<ArchivedRequest>> {
    let conn = ARCHIVE
        .get()
        .ok_or_else(|| anyhow::anyhow!("Archive not initialized"))?;
    let conn = conn.lock();

    let mut sql = format!(
        "SELECT {} FROM request_archive WHERE 1=1",
        SELECT_COLUMNS
    );
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(ref backend) = filter.backend {
        sql.push_str(" AND backend = ?");
        params.push(Box::new(backend.clone()));
    }
    if let Some(ref user_id) = filter.user_id {
        sql.push_str(" AND user_id = ?");
        params.push(Box::new(user_id.clone()));
    }
    if let Some(ref category) = filter.category {
        sql.push_str(" AND category = ?");
        params.push(Box::new(category.clone()));
    }
    sql.push_str(" ORDER BY timestamp DESC LIMIT ? OFFSET ?");
    params.push(Box::new(filter.limit.unwrap_or(50)));
    params.push(Box::new(filter.offset.unwrap_or(0)));

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let rows = stmt.query_map(param_refs.as_slice(), row_to_request)?;

    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

pub fn get_request(id: &str) -> Result<Option<ArchivedRequest>> {
    let conn = ARCHIVE
        .get()
        .ok_or_else(|| anyhow::anyhow!("Archive not initialized"))?;
    let conn = conn.lock();

    let sql = format!(
        "SELECT {} FROM request_archive WHERE id = ?1",
        SELECT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    match stmt.query_row([id], row_to_request) {
        Ok(request) => Ok(Some(request)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Serialize)]
pub struct DailyStat {
    pub day: String,
    pub requests: u64,
    pub errors: u64,
    pub avg_latency_ms: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Serialize)]
pub struct BackendStat {
    pub backend: String,
    pub requests: u64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct Analytics {
    pub days: i64,
    pub daily: Vec<DailyStat>,
    pub by_backend: Vec<BackendStat>,
    pub by_category: std::collections::HashMap<String, u64>,
}

pub fn analytics(days: i64) -> Result<Analytics> {
    let conn = ARCHIVE
        .get()
        .ok_or_else(|| anyhow::anyhow!("Archive not initialized"))?;
    let conn = conn.lock();
    let cutoff = Utc::now().timestamp_millis() - days * 86_400_000;

    let mut daily = Vec::new();
    let mut stmt = conn.prepare(
        "SELECT date(timestamp / 1000, 'unixepoch') AS day,
                COUNT(*),
                SUM(CASE WHEN status >= 500 OR error IS NOT NULL THEN 1 ELSE 0 END),
                AVG(duration_ms),
                SUM(input_tokens),
                SUM(output_tokens)
         FROM request_archive WHERE timestamp >= ?1
         GROUP BY day ORDER BY day DESC",
    )?;
    let rows = stmt.query_map([cutoff], |row| {
        Ok(DailyStat {
            day: row.get(0)?,
            requests: row.get::<_, i64>(1)? as u64,
            errors: row.get::<_, i64>(2)? as u64,
            avg_latency_ms: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
            input_tokens: row.get::<_, Option<i64>>(4)?.unwrap_or(0) as u64,
            output_tokens: row.get::<_, Option<i64>>(5)?.unwrap_or(0) as u64,
        })
    })?;
    for row in rows {
        daily.push(row?);
    }

    let mut by_backend = Vec::new();
    let mut stmt = conn.prepare(
        "SELECT backend, COUNT(*), AVG(duration_ms)
         FROM request_archive WHERE timestamp >= ?1
         GROUP BY backend ORDER BY COUNT(*) DESC",
    )?;
    let rows = stmt.query_map([cutoff], |row| {
        Ok(BackendStat {
            backend: row.get(0)?,
            requests: row.get::<_, i64>(1)? as u64,
            avg_latency_ms: row.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
        })
    })?;
    for row in rows {
        by_backend.push(row?);
    }

    let mut by_category = std::collections::HashMap::new();
    let mut stmt = conn.prepare(
        "SELECT category, COUNT(*) FROM request_archive
         WHERE timestamp >= ?1 AND category IS NOT NULL
         GROUP BY category",
    )?;
    let rows = stmt.query_map([cutoff], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
    })?;
    for row in rows {
        let (category, count) = row?;
        by_category.insert(category, count);
    }

    Ok(Analytics { days, daily, by_backend, by_category })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observe::entry_for_tests;

    // The archive connection is process-global, so these run one at a time.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    fn init_temp_archive() {
        if ARCHIVE.get().is_some() {
            return;
        }
        let path = std::env::temp_dir().join(format!(
            "llm-proxy-archive-test-{}.db",
            uuid::Uuid::new_v4().simple()
        ));
        init_archive(path).unwrap();
    }

    #[test]
    fn insert_and_fetch_roundtrip() {
        let _guard = TEST_LOCK.lock();
        init_temp_archive();
        let mut entry = entry_for_tests("arch-1", "general", 200);
        entry.request_body = Some("what is rust".into());
        entry.response_body = Some("a systems language".into());
        insert(&entry, true, true).unwrap();

        let fetched = get_request("arch-1").unwrap().unwrap();
        assert_eq!(fetched.backend, "general");
        assert_eq!(fetched.query.as_deref(), Some("what is rust"));
        assert_eq!(fetched.status, 200);
    }

    #[test]
    fn privacy_flags_redact_at_write_time() {
        let _guard = TEST_LOCK.lock();
        init_temp_archive();
        let mut entry = entry_for_tests("arch-private", "general", 200);
        entry.request_body = Some("secret question".into());
        entry.response_body = Some("secret answer".into());
        insert(&entry, false, false).unwrap();

        let fetched = get_request("arch-private").unwrap().unwrap();
        assert_eq!(fetched.query.as_deref(), Some(REDACTED));
        assert_eq!(fetched.response.as_deref(), Some(REDACTED));
    }

    #[test]
    fn history_filter_by_backend() {
        let _guard = TEST_LOCK.lock();
        init_temp_archive();
        insert(&entry_for_tests("arch-f1", "coder", 200), true, true).unwrap();
        insert(&entry_for_tests("arch-f2", "coder", 200), true, true).unwrap();
        let filter = HistoryFilter {
            backend: Some("coder".into()),
            ..Default::default()
        };
        let rows = query_history(&filter).unwrap();
        assert!(rows.len() >= 2);
        assert!(rows.iter().all(|r| r.backend == "coder"));
    }

    #[test]
    fn prune_caps_row_count() {
        let _guard = TEST_LOCK.lock();
        init_temp_archive();
        for i in 0..30 {
            insert(&entry_for_tests(&format!("arch-p{}", i), "general", 200), true, true)
                .unwrap();
        }
        prune(30, 5).unwrap();
        let rows = query_history(&HistoryFilter {
            limit: Some(1000),
            ..Default::default()
        })
        .unwrap();
        assert!(rows.len() <= 5);
    }
}
