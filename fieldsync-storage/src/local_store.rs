//! Local store: per-entity collections, the sync queue, and engine metadata.

use crate::error::{StorageError, StorageResult};
use fieldsync_types::time::now_millis;
use fieldsync_types::{DiscardReason, LocalId, NewQueueItem, QueueItem, Record, RecordId, RemoteId};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Meta key: completion time of the last successful full cache pass.
pub const META_LAST_FULL_CACHE: &str = "last_full_cache_at";
/// Meta key: completion time of the last background warm.
pub const META_LAST_WARM: &str = "last_warm_at";

/// A queue item that was dropped by the discard policy.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub item: QueueItem,
    pub reason: DiscardReason,
    pub discarded_at: i64,
}

/// Durable local store backed by SQLite.
///
/// Cloning is cheap; clones share the same connection.
#[derive(Clone)]
pub struct LocalStore {
    conn: Arc<Mutex<Connection>>,
}

type RawRecord = (String, String, i64);

impl LocalStore {
    /// Opens (or creates) a store at the given path.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        initialize_schema(&conn)?;
        info!("Opened local store at {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn with_conn<F, R>(&self, f: F) -> StorageResult<R>
    where
        F: FnOnce(&mut Connection) -> StorageResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StorageError::Poisoned)?;
            f(&mut guard)
        })
        .await?
    }

    // ── Collections ──────────────────────────────────────────────

    /// Upserts a record by id.
    pub async fn save<T: Serialize>(&self, collection: &str, record: &Record<T>) -> StorageResult<()> {
        let data_json = serde_json::to_string(&record.data)?;
        let collection = collection.to_string();
        let id = record.id;
        let updated_at = record.updated_at;
        self.with_conn(move |conn| {
            upsert_record(conn, &collection, &id, &data_json, updated_at)?;
            Ok(())
        })
        .await
    }

    /// Returns every record of a collection, oldest write first.
    pub async fn get_all<T: DeserializeOwned>(&self, collection: &str) -> StorageResult<Vec<Record<T>>> {
        let collection = collection.to_string();
        let rows = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, data_json, updated_at FROM records
                     WHERE collection = ?1 ORDER BY updated_at, id",
                )?;
                let rows = stmt
                    .query_map(params![collection], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                    })?
                    .collect::<Result<Vec<RawRecord>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(decode_record).collect()
    }

    /// Returns a single record by id.
    pub async fn get_by_id<T: DeserializeOwned>(
        &self,
        collection: &str,
        id: &RecordId,
    ) -> StorageResult<Option<Record<T>>> {
        let collection = collection.to_string();
        let key = id.to_string();
        let row: Option<RawRecord> = self
            .with_conn(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT id, data_json, updated_at FROM records
                         WHERE collection = ?1 AND id = ?2",
                        params![collection, key],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;
        row.map(decode_record).transpose()
    }

    /// Deletes a record. Returns whether a record was removed.
    pub async fn delete(&self, collection: &str, id: &RecordId) -> StorageResult<bool> {
        let collection = collection.to_string();
        let key = id.to_string();
        self.with_conn(move |conn| {
            let n = conn.execute(
                "DELETE FROM records WHERE collection = ?1 AND id = ?2",
                params![collection, key],
            )?;
            Ok(n > 0)
        })
        .await
    }

    /// Removes every record of a collection.
    pub async fn clear(&self, collection: &str) -> StorageResult<usize> {
        let collection = collection.to_string();
        self.with_conn(move |conn| {
            let n = conn.execute("DELETE FROM records WHERE collection = ?1", params![collection])?;
            Ok(n)
        })
        .await
    }

    /// Replaces the contents of a collection in one transaction.
    ///
    /// With `keep_pending`, records still carrying a locally-minted id survive
    /// the replacement: they exist only on this device until they sync.
    pub async fn replace_collection<T: Serialize>(
        &self,
        collection: &str,
        records: &[Record<T>],
        keep_pending: bool,
    ) -> StorageResult<usize> {
        let encoded = records
            .iter()
            .map(|r| Ok((r.id, serde_json::to_string(&r.data)?, r.updated_at)))
            .collect::<StorageResult<Vec<_>>>()?;
        let collection = collection.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let removed = if keep_pending {
                tx.execute(
                    "DELETE FROM records WHERE collection = ?1 AND is_local = 0",
                    params![collection],
                )?
            } else {
                tx.execute("DELETE FROM records WHERE collection = ?1", params![collection])?
            };
            for (id, data_json, updated_at) in &encoded {
                upsert_record(&tx, &collection, id, data_json, *updated_at)?;
            }
            tx.commit()?;
            debug!(
                "Replaced collection {}: removed {}, wrote {}",
                collection,
                removed,
                encoded.len()
            );
            Ok(encoded.len())
        })
        .await
    }

    /// Atomically supersedes a locally-minted record with its canonical
    /// version and remembers the mapping.
    pub async fn promote<T: Serialize>(
        &self,
        collection: &str,
        from: LocalId,
        to: &Record<T>,
    ) -> StorageResult<()> {
        let Some(remote) = to.id.as_remote() else {
            return Err(StorageError::InvalidData(format!(
                "cannot promote {from} to non-canonical id {}",
                to.id
            )));
        };
        let data_json = serde_json::to_string(&to.data)?;
        let updated_at = to.updated_at;
        let collection = collection.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM records WHERE collection = ?1 AND id = ?2",
                params![collection, from.to_string()],
            )?;
            upsert_record(&tx, &collection, &RecordId::Remote(remote), &data_json, updated_at)?;
            insert_mapping(&tx, &collection, from, remote)?;
            tx.commit()?;
            debug!("Promoted {} -> {} in {}", from, remote, collection);
            Ok(())
        })
        .await
    }

    // ── Id map ───────────────────────────────────────────────────

    /// Records that `local` was superseded by `remote`.
    pub async fn record_promotion(
        &self,
        collection: &str,
        local: LocalId,
        remote: RemoteId,
    ) -> StorageResult<()> {
        let collection = collection.to_string();
        self.with_conn(move |conn| insert_mapping(conn, &collection, local, remote))
            .await
    }

    /// Looks up the canonical id that superseded a locally-minted one.
    pub async fn resolve_local(&self, local: LocalId) -> StorageResult<Option<RemoteId>> {
        let raw: Option<String> = self
            .with_conn(move |conn| {
                let raw = conn
                    .query_row(
                        "SELECT remote_id FROM id_map WHERE local_id = ?1",
                        params![local.to_string()],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(raw)
            })
            .await?;
        raw.map(|s| {
            RemoteId::parse(&s).map_err(|e| StorageError::InvalidData(format!("id_map: {e}")))
        })
        .transpose()
    }

    // ── Sync queue ───────────────────────────────────────────────

    /// Appends a mutation to the sync queue.
    pub async fn enqueue(&self, item: NewQueueItem) -> StorageResult<QueueItem> {
        let payload_json = serde_json::to_string(&item.payload)?;
        let id = self
            .with_conn({
                let action = item.action.clone();
                let timestamp = item.timestamp;
                move |conn| {
                    conn.execute(
                        "INSERT INTO sync_queue (action, payload_json, timestamp, retry_count)
                         VALUES (?1, ?2, ?3, 0)",
                        params![action, payload_json, timestamp],
                    )?;
                    Ok(conn.last_insert_rowid())
                }
            })
            .await?;
        debug!("Enqueued {} as queue item {}", item.action, id);
        Ok(QueueItem {
            id,
            action: item.action,
            payload: item.payload,
            timestamp: item.timestamp,
            retry_count: 0,
            last_error: None,
        })
    }

    /// Returns the whole queue in enqueue order.
    pub async fn queue_items(&self) -> StorageResult<Vec<QueueItem>> {
        let rows = self
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, action, payload_json, timestamp, retry_count, last_error
                     FROM sync_queue ORDER BY id",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, u32>(4)?,
                            row.get::<_, Option<String>>(5)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(id, action, payload_json, timestamp, retry_count, last_error)| {
                Ok(QueueItem {
                    id,
                    action,
                    payload: serde_json::from_str(&payload_json)?,
                    timestamp,
                    retry_count,
                    last_error,
                })
            })
            .collect()
    }

    /// Number of items waiting in the queue.
    pub async fn queue_len(&self) -> StorageResult<usize> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))?;
            Ok(n as usize)
        })
        .await
    }

    /// Persists the retry bookkeeping of a queue item.
    pub async fn update_queue_item(&self, item: &QueueItem) -> StorageResult<()> {
        let id = item.id;
        let retry_count = item.retry_count;
        let last_error = item.last_error.clone();
        self.with_conn(move |conn| {
            let n = conn.execute(
                "UPDATE sync_queue SET retry_count = ?2, last_error = ?3 WHERE id = ?1",
                params![id, retry_count, last_error],
            )?;
            if n == 0 {
                return Err(StorageError::InvalidData(format!("queue item {id} not found")));
            }
            Ok(())
        })
        .await
    }

    /// Removes a queue item. Returns whether it existed.
    pub async fn remove_queue_item(&self, id: i64) -> StorageResult<bool> {
        self.with_conn(move |conn| {
            let n = conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![id])?;
            Ok(n > 0)
        })
        .await
    }

    /// Moves a queue item to the dead-letter table.
    pub async fn discard_queue_item(&self, item: &QueueItem, reason: DiscardReason) -> StorageResult<()> {
        let item = item.clone();
        let payload_json = serde_json::to_string(&item.payload)?;
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR REPLACE INTO dead_letter
                 (queue_id, action, payload_json, timestamp, retry_count, last_error, reason, discarded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    item.id,
                    item.action,
                    payload_json,
                    item.timestamp,
                    item.retry_count,
                    item.last_error,
                    reason.as_str(),
                    now_millis(),
                ],
            )?;
            tx.execute("DELETE FROM sync_queue WHERE id = ?1", params![item.id])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Returns the dead-lettered items, most recent first.
    pub async fn dead_letters(&self) -> StorageResult<Vec<DeadLetter>> {
        let rows = self
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT queue_id, action, payload_json, timestamp, retry_count, last_error,
                            reason, discarded_at
                     FROM dead_letter ORDER BY discarded_at DESC, queue_id DESC",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, u32>(4)?,
                            row.get::<_, Option<String>>(5)?,
                            row.get::<_, String>(6)?,
                            row.get::<_, i64>(7)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut result = Vec::with_capacity(rows.len());
        for (id, action, payload_json, timestamp, retry_count, last_error, reason, discarded_at) in rows {
            result.push(DeadLetter {
                item: QueueItem {
                    id,
                    action,
                    payload: serde_json::from_str(&payload_json)?,
                    timestamp,
                    retry_count,
                    last_error,
                },
                reason: parse_discard_reason(&reason)?,
                discarded_at,
            });
        }
        Ok(result)
    }

    // ── Meta ─────────────────────────────────────────────────────

    /// Stores a scalar timestamp (milliseconds since Unix epoch).
    pub async fn set_meta_time(&self, key: &str, at: i64) -> StorageResult<()> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
                params![key, at],
            )?;
            Ok(())
        })
        .await
    }

    /// Reads a scalar timestamp.
    pub async fn meta_time(&self, key: &str) -> StorageResult<Option<i64>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let value = conn
                .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| row.get(0))
                .optional()?;
            Ok(value)
        })
        .await
    }

    /// Wipes everything tied to the signed-in user. The queue and dead-letter
    /// table survive unless `include_queue` is set, so pending mutations are
    /// not lost by a re-login.
    pub async fn reset_session(&self, include_queue: bool) -> StorageResult<()> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute_batch("DELETE FROM records; DELETE FROM id_map; DELETE FROM meta;")?;
            if include_queue {
                tx.execute_batch("DELETE FROM sync_queue; DELETE FROM dead_letter;")?;
            }
            tx.commit()?;
            Ok(())
        })
        .await?;
        info!("Local session reset (queue cleared: {})", include_queue);
        Ok(())
    }
}

fn initialize_schema(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS records (
            collection TEXT NOT NULL,
            id TEXT NOT NULL,
            is_local INTEGER NOT NULL,
            data_json TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (collection, id)
        );

        CREATE TABLE IF NOT EXISTS sync_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            action TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT
        );

        CREATE TABLE IF NOT EXISTS dead_letter (
            queue_id INTEGER PRIMARY KEY,
            action TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            retry_count INTEGER NOT NULL,
            last_error TEXT,
            reason TEXT NOT NULL,
            discarded_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS id_map (
            local_id TEXT PRIMARY KEY,
            remote_id TEXT NOT NULL,
            collection TEXT NOT NULL,
            promoted_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value INTEGER NOT NULL
        );
        ",
    )?;
    Ok(())
}

fn upsert_record(
    conn: &Connection,
    collection: &str,
    id: &RecordId,
    data_json: &str,
    updated_at: i64,
) -> StorageResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO records (collection, id, is_local, data_json, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![collection, id.to_string(), id.is_local(), data_json, updated_at],
    )?;
    Ok(())
}

fn insert_mapping(
    conn: &Connection,
    collection: &str,
    local: LocalId,
    remote: RemoteId,
) -> StorageResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO id_map (local_id, remote_id, collection, promoted_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![local.to_string(), remote.to_string(), collection, now_millis()],
    )?;
    Ok(())
}

fn decode_record<T: DeserializeOwned>((id, data_json, updated_at): RawRecord) -> StorageResult<Record<T>> {
    let id: RecordId = id
        .parse()
        .map_err(|e| StorageError::InvalidData(format!("record id {id}: {e}")))?;
    Ok(Record {
        id,
        data: serde_json::from_str(&data_json)?,
        updated_at,
    })
}

fn parse_discard_reason(s: &str) -> StorageResult<DiscardReason> {
    match s {
        "stale" => Ok(DiscardReason::Stale),
        "retries_exhausted" => Ok(DiscardReason::RetriesExhausted),
        other => Err(StorageError::InvalidData(format!("unknown discard reason: {other}"))),
    }
}
