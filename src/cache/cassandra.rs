//! Cassandra (L2) cache backend.
//!
//! The wide-column store acts as the persistent, higher-capacity tier.
//! `initialize` bootstraps the keyspace and two tables: the item table
//! (row-per-entry, written `USING TTL` with `expires_at` materialized for
//! filtered scans, leveled compaction, short GC grace, secondary index on
//! `expires_at`) and a sibling counter table for hit counts, since counters
//! cannot share a row with TTL'd regular columns.
//!
//! Item reads run at the configured consistency (LOCAL_QUORUM by default);
//! stats and capacity scans deliberately drop to LOCAL_ONE and may use
//! `ALLOW FILTERING`, trading accuracy for availability on what is already
//! an approximate accounting path.

use super::{CacheBackend, CacheItem, CacheMode, CacheStats, CapacityInfo, HitCountEntry, SetOptions};
use crate::config::{CacheConfig, CassandraConfig};
use crate::error::{EdgeError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use scylla::frame::value::Counter;
use scylla::prepared_statement::PreparedStatement;
use scylla::query::Query;
use scylla::statement::Consistency;
use scylla::transport::ExecutionProfile;
use scylla::{Session, SessionBuilder};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Seconds a tombstone survives before GC; short because eviction churn is
/// expected and the data is a cache, not a source of truth.
const GC_GRACE_SECONDS: u32 = 3600;

struct Prepared {
    get_item: PreparedStatement,
    set_item: PreparedStatement,
    delete_item: PreparedStatement,
    delete_hits: PreparedStatement,
    exists_item: PreparedStatement,
    increment_hits: PreparedStatement,
    get_hits: PreparedStatement,
}

struct Connection {
    session: Arc<Session>,
    prepared: Prepared,
}

/// Cassandra (L2) cache backend.
pub struct CassandraBackend {
    config: CassandraConfig,
    default_ttl: std::time::Duration,
    max_files: u64,
    conn: RwLock<Option<Arc<Connection>>>,
    connected: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

impl CassandraBackend {
    pub fn new(config: CassandraConfig, cache: &CacheConfig) -> Self {
        Self {
            config,
            default_ttl: cache.ttl,
            max_files: cache.cassandra_max_files,
            conn: RwLock::new(None),
            connected: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    fn item_table(&self) -> String {
        format!("{}.{}", self.config.keyspace, self.config.table)
    }

    fn hits_table(&self) -> String {
        format!("{}.{}_hits", self.config.keyspace, self.config.table)
    }

    fn read_consistency(&self) -> Consistency {
        match self.config.consistency.to_ascii_uppercase().as_str() {
            "ONE" => Consistency::One,
            "TWO" => Consistency::Two,
            "QUORUM" => Consistency::Quorum,
            "ALL" => Consistency::All,
            "LOCAL_ONE" => Consistency::LocalOne,
            _ => Consistency::LocalQuorum,
        }
    }

    async fn connection(&self) -> Option<Arc<Connection>> {
        self.conn.read().await.clone()
    }

    fn record_error(&self, what: &str, e: impl std::fmt::Display) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        warn!(operation = what, error = %e, "Cassandra operation failed");
    }

    /// Low-consistency scan statement for stats and capacity paths.
    fn scan_query(text: String) -> Query {
        let mut query = Query::new(text);
        query.set_consistency(Consistency::LocalOne);
        query
    }

    async fn bootstrap_schema(&self, session: &Session) -> Result<()> {
        let keyspace = format!(
            "CREATE KEYSPACE IF NOT EXISTS {} WITH replication = \
             {{'class': 'SimpleStrategy', 'replication_factor': {}}}",
            self.config.keyspace, self.config.replication_factor
        );
        session
            .query(keyspace, ())
            .await
            .map_err(|e| EdgeError::Backend(format!("create keyspace: {e}")))?;

        let table = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             cache_key TEXT PRIMARY KEY, \
             data BLOB, \
             size BIGINT, \
             content_type TEXT, \
             etag TEXT, \
             last_modified TIMESTAMP, \
             created_at TIMESTAMP, \
             expires_at TIMESTAMP) \
             WITH compaction = {{'class': 'LeveledCompactionStrategy'}} \
             AND gc_grace_seconds = {}",
            self.item_table(),
            GC_GRACE_SECONDS
        );
        session
            .query(table, ())
            .await
            .map_err(|e| EdgeError::Backend(format!("create table: {e}")))?;

        let index = format!(
            "CREATE INDEX IF NOT EXISTS {}_expiry_idx ON {} (expires_at)",
            self.config.table,
            self.item_table()
        );
        session
            .query(index, ())
            .await
            .map_err(|e| EdgeError::Backend(format!("create index: {e}")))?;

        let hits = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             cache_key TEXT PRIMARY KEY, \
             hits COUNTER)",
            self.hits_table()
        );
        session
            .query(hits, ())
            .await
            .map_err(|e| EdgeError::Backend(format!("create counter table: {e}")))?;

        Ok(())
    }

    async fn prepare_statements(&self, session: &Session) -> Result<Prepared> {
        let consistency = self.read_consistency();
        let item_table = self.item_table();
        let hits_table = self.hits_table();

        let prepare = |text: String| async {
            let mut statement = session
                .prepare(text)
                .await
                .map_err(|e| EdgeError::Backend(format!("prepare: {e}")))?;
            statement.set_consistency(consistency);
            Ok::<_, EdgeError>(statement)
        };

        Ok(Prepared {
            get_item: prepare(format!(
                "SELECT data, size, content_type, etag, last_modified, created_at, expires_at \
                 FROM {item_table} WHERE cache_key = ?"
            ))
            .await?,
            set_item: prepare(format!(
                "INSERT INTO {item_table} \
                 (cache_key, data, size, content_type, etag, last_modified, created_at, expires_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?) USING TTL ?"
            ))
            .await?,
            delete_item: prepare(format!("DELETE FROM {item_table} WHERE cache_key = ?")).await?,
            delete_hits: prepare(format!("DELETE FROM {hits_table} WHERE cache_key = ?")).await?,
            exists_item: prepare(format!(
                "SELECT cache_key FROM {item_table} WHERE cache_key = ?"
            ))
            .await?,
            increment_hits: prepare(format!(
                "UPDATE {hits_table} SET hits = hits + 1 WHERE cache_key = ?"
            ))
            .await?,
            get_hits: prepare(format!(
                "SELECT hits FROM {hits_table} WHERE cache_key = ?"
            ))
            .await?,
        })
    }

    async fn read_hit_count(&self, conn: &Connection, key: &str) -> u64 {
        match conn
            .session
            .execute(&conn.prepared.get_hits, (key,))
            .await
            .map(|result| result.maybe_first_row_typed::<(Counter,)>())
        {
            Ok(Ok(Some((Counter(count),)))) => count.max(0) as u64,
            Ok(Ok(None)) => 0,
            Ok(Err(e)) => {
                self.record_error("read hit counter", e);
                0
            }
            Err(e) => {
                self.record_error("read hit counter", e);
                0
            }
        }
    }
}

#[async_trait]
impl CacheBackend for CassandraBackend {
    async fn initialize(&self) -> Result<()> {
        let mut profile = ExecutionProfile::builder()
            .consistency(self.read_consistency())
            .request_timeout(Some(self.config.request_timeout));

        if let Some(dc) = &self.config.local_dc {
            let policy = scylla::load_balancing::DefaultPolicy::builder()
                .prefer_datacenter(dc.clone())
                .build();
            profile = profile.load_balancing_policy(policy);
        }

        let mut builder = SessionBuilder::new()
            .known_nodes(&self.config.hosts)
            .connection_timeout(self.config.connect_timeout)
            .default_execution_profile_handle(profile.build().into_handle());

        if let (Some(user), Some(password)) = (&self.config.username, &self.config.password) {
            builder = builder.user(user, password);
        }

        let session = builder
            .build()
            .await
            .map_err(|e| EdgeError::Backend(format!("cassandra connect: {e}")))?;

        self.bootstrap_schema(&session).await?;
        let prepared = self.prepare_statements(&session).await?;

        *self.conn.write().await = Some(Arc::new(Connection {
            session: Arc::new(session),
            prepared,
        }));
        self.connected.store(true, Ordering::SeqCst);
        info!(
            keyspace = %self.config.keyspace,
            table = %self.config.table,
            hosts = ?self.config.hosts,
            "Cassandra cache backend initialized"
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Option<CacheItem> {
        let Some(conn) = self.connection().await else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let row = match conn.session.execute(&conn.prepared.get_item, (key,)).await {
            Ok(result) => match result.maybe_first_row_typed::<ItemRow>() {
                Ok(row) => row,
                Err(e) => {
                    self.record_error("decode item row", e);
                    None
                }
            },
            Err(e) => {
                self.record_error("get", e);
                None
            }
        };

        let Some((data, size, content_type, etag, last_modified, created_at, expires_at)) = row
        else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let (Some(data), Some(size), Some(created_at), Some(expires_at)) =
            (data, size, created_at, expires_at)
        else {
            // Partially written row; treat as a miss and let TTL reap it.
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        if Utc::now() > expires_at {
            // Native TTL lags the materialized expiry; remove eagerly.
            let key = key.to_string();
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                let _ = conn.session.execute(&conn.prepared.delete_item, (key.as_str(),)).await;
                let _ = conn.session.execute(&conn.prepared.delete_hits, (key.as_str(),)).await;
            });
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        if let Err(e) = conn
            .session
            .execute(&conn.prepared.increment_hits, (key,))
            .await
        {
            self.record_error("increment hit counter", e);
        }
        let hit_count = self.read_hit_count(&conn, key).await;

        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(CacheItem {
            data: Bytes::from(data),
            size: size.max(0) as u64,
            content_type,
            etag,
            last_modified,
            created_at,
            expires_at,
            hit_count,
        })
    }

    async fn set(&self, key: &str, data: Bytes, opts: SetOptions) -> bool {
        let Some(conn) = self.connection().await else {
            return false;
        };

        let item = CacheItem::new(data, &opts, self.default_ttl);
        let ttl_secs = opts.ttl.unwrap_or(self.default_ttl).as_secs().max(1) as i32;

        let values = (
            key,
            item.data.to_vec(),
            item.size as i64,
            item.content_type.clone(),
            item.etag.clone(),
            item.last_modified,
            item.created_at,
            item.expires_at,
            ttl_secs,
        );

        match conn.session.execute(&conn.prepared.set_item, values).await {
            Ok(_) => true,
            Err(e) => {
                self.record_error("set", e);
                false
            }
        }
    }

    async fn delete(&self, key: &str) -> bool {
        let Some(conn) = self.connection().await else {
            return false;
        };

        let existed = self.exists(key).await;

        if let Err(e) = conn.session.execute(&conn.prepared.delete_item, (key,)).await {
            self.record_error("delete", e);
            return false;
        }
        if let Err(e) = conn.session.execute(&conn.prepared.delete_hits, (key,)).await {
            self.record_error("delete counter", e);
        }
        existed
    }

    async fn exists(&self, key: &str) -> bool {
        let Some(conn) = self.connection().await else {
            return false;
        };

        match conn.session.execute(&conn.prepared.exists_item, (key,)).await {
            Ok(result) => matches!(result.maybe_first_row_typed::<(String,)>(), Ok(Some(_))),
            Err(e) => {
                self.record_error("exists", e);
                false
            }
        }
    }

    async fn clear(&self) -> bool {
        let Some(conn) = self.connection().await else {
            return false;
        };

        for table in [self.item_table(), self.hits_table()] {
            if let Err(e) = conn.session.query(format!("TRUNCATE {table}"), ()).await {
                self.record_error("clear", e);
                return false;
            }
        }
        debug!("Cleared Cassandra cache tables");
        true
    }

    async fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let capacity = self.capacity().await;

        CacheStats {
            hits,
            misses,
            errors: self.errors.load(Ordering::Relaxed),
            items: capacity.item_count,
            size_bytes: capacity.used_bytes,
            hit_ratio: CacheStats::ratio(hits, misses),
            connected: self.connected.load(Ordering::SeqCst),
            mode: self.mode().to_string(),
        }
    }

    async fn is_healthy(&self) -> bool {
        let Some(conn) = self.connection().await else {
            return false;
        };
        conn.session
            .query("SELECT release_version FROM system.local", ())
            .await
            .is_ok()
    }

    async fn close(&self) {
        let mut conn = self.conn.write().await;
        if conn.take().is_some() {
            self.connected.store(false, Ordering::SeqCst);
            info!("Cassandra cache backend closed");
        }
    }

    async fn capacity(&self) -> CapacityInfo {
        let Some(conn) = self.connection().await else {
            return CapacityInfo::default();
        };

        // COUNT/SUM over the table run at LOCAL_ONE; approximate by design.
        let scan = Self::scan_query(format!(
            "SELECT COUNT(cache_key), SUM(size) FROM {}",
            self.item_table()
        ));
        let (item_count, used_bytes) = match conn.session.query(scan, ()).await {
            Ok(result) => match result.maybe_first_row_typed::<(i64, Option<i64>)>() {
                Ok(Some((count, sum))) => {
                    (count.max(0) as u64, sum.unwrap_or(0).max(0) as u64)
                }
                _ => (0, 0),
            },
            Err(e) => {
                self.record_error("capacity scan", e);
                (0, 0)
            }
        };

        CapacityInfo {
            used_bytes,
            max_bytes: 0,
            // Row count against the configured file ceiling is the capacity
            // signal for this tier.
            used_percentage: CapacityInfo::percentage(item_count, self.max_files),
            item_count,
            max_items: self.max_files,
        }
    }

    async fn items_by_hit_count(&self, limit: usize) -> Vec<HitCountEntry> {
        let Some(conn) = self.connection().await else {
            return Vec::new();
        };

        let items = Self::scan_query(format!(
            "SELECT cache_key, size FROM {}",
            self.item_table()
        ));
        let mut listing: HashMap<String, HitCountEntry> = HashMap::new();
        match conn.session.query(items, ()).await {
            Ok(result) => {
                if let Ok(rows) = result.rows_typed::<(String, Option<i64>)>() {
                    for row in rows.flatten() {
                        let (key, size) = row;
                        listing.insert(
                            key.clone(),
                            HitCountEntry {
                                key,
                                hit_count: 0,
                                size: size.unwrap_or(0).max(0) as u64,
                            },
                        );
                    }
                }
            }
            Err(e) => {
                self.record_error("hit count scan", e);
                return Vec::new();
            }
        }

        let counters = Self::scan_query(format!(
            "SELECT cache_key, hits FROM {}",
            self.hits_table()
        ));
        if let Ok(result) = conn.session.query(counters, ()).await {
            if let Ok(rows) = result.rows_typed::<(String, Counter)>() {
                for (key, Counter(count)) in rows.flatten() {
                    if let Some(entry) = listing.get_mut(&key) {
                        entry.hit_count = count.max(0) as u64;
                    }
                }
            }
        }

        let mut listing: Vec<HitCountEntry> = listing.into_values().collect();
        listing.sort_by(|a, b| a.hit_count.cmp(&b.hit_count).then(a.key.cmp(&b.key)));
        listing.truncate(limit);
        listing
    }

    async fn increment_hit_count(&self, key: &str) -> bool {
        if !self.exists(key).await {
            return false;
        }
        let Some(conn) = self.connection().await else {
            return false;
        };

        match conn.session.execute(&conn.prepared.increment_hits, (key,)).await {
            Ok(_) => true,
            Err(e) => {
                self.record_error("increment hit counter", e);
                false
            }
        }
    }

    fn mode(&self) -> CacheMode {
        CacheMode::Cassandra
    }
}

type ItemRow = (
    Option<Vec<u8>>,
    Option<i64>,
    Option<String>,
    Option<String>,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
);
