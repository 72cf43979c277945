//! Durable event storage.
//!
//! The pipeline only needs two operations: a digest-deduplicated `write` on
//! the writer handle and a filter `query` on the reader handle. Writers and
//! readers never share a connection, so a slow historical scan cannot stall
//! ingestion.

use crate::error::StoreError;
use async_trait::async_trait;
use ostrich_common::types::KIND_METADATA;
use ostrich_common::{Event, Filter};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use tracing::info;

/// Outcome of a successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// The event is newly durable.
    Stored,
    /// An event with the same id was already stored.
    Duplicate,
}

/// A durable event store.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persists `event`, deduplicating on its id.
    async fn write(&self, event: &Event) -> Result<WriteStatus, StoreError>;

    /// Returns up to `limit` stored events matching `filter`, newest first.
    async fn query(&self, filter: &Filter, limit: u64) -> Result<Vec<Event>, StoreError>;

    /// Most recent metadata event published by `pubkey`.
    async fn latest_metadata(&self, pubkey: &str) -> Result<Option<Event>, StoreError> {
        let filter = Filter::new().authors([pubkey]).kinds([KIND_METADATA]);
        Ok(self.query(&filter, 1).await?.into_iter().next())
    }
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS event (
        id TEXT PRIMARY KEY,
        pubkey TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        kind INTEGER NOT NULL,
        raw TEXT NOT NULL,
        first_seen INTEGER NOT NULL DEFAULT (strftime('%s','now'))
    )",
    "CREATE INDEX IF NOT EXISTS idx_event_pubkey ON event(pubkey, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_event_kind ON event(kind, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_event_created ON event(created_at)",
    "CREATE TABLE IF NOT EXISTS tag (
        event_id TEXT NOT NULL REFERENCES event(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        value TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_tag_value ON tag(name, value)",
    "CREATE INDEX IF NOT EXISTS idx_tag_event ON tag(event_id)",
];

fn db_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn hex_prefixes(values: &[String]) -> Vec<String> {
    values
        .iter()
        .filter(|v| !v.is_empty() && v.len() <= 64 && v.bytes().all(|b| b.is_ascii_hexdigit()))
        .map(|v| format!("{}%", v.to_ascii_lowercase()))
        .collect()
}

/// SQLite store with a single-connection writer pool and a read-only reader pool.
#[derive(Clone)]
pub struct SqliteStore {
    writer: SqlitePool,
    reader: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `location` and applies the schema.
    ///
    /// `location` is a filesystem path or a `sqlite:` URL.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the database cannot be opened.
    pub async fn open(location: &str, reader_pool_size: u32) -> Result<Self, StoreError> {
        let url = if location.starts_with("sqlite:") {
            location.to_string()
        } else {
            format!("sqlite://{location}")
        };
        let options = SqliteConnectOptions::from_str(&url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5));

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone().create_if_missing(true))
            .await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&writer).await?;
        }

        let reader = SqlitePoolOptions::new()
            .max_connections(reader_pool_size.max(1))
            .connect_with(options.read_only(true))
            .await?;

        info!(database = %location, readers = reader_pool_size, "opened sqlite store");
        Ok(Self { writer, reader })
    }

    fn build_query(filter: &Filter, limit: u64) -> Option<QueryBuilder<'static, Sqlite>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT e.raw FROM event e WHERE 1=1");

        for (column, values) in [("e.id", &filter.ids), ("e.pubkey", &filter.authors)] {
            if let Some(values) = values {
                let prefixes = hex_prefixes(values);
                if prefixes.is_empty() {
                    return None;
                }
                qb.push(" AND (");
                let mut sep = qb.separated(" OR ");
                for prefix in prefixes {
                    sep.push(column);
                    sep.push_unseparated(" LIKE ");
                    sep.push_bind_unseparated(prefix);
                }
                qb.push(")");
            }
        }

        if let Some(kinds) = &filter.kinds {
            if kinds.is_empty() {
                return None;
            }
            qb.push(" AND e.kind IN (");
            let mut sep = qb.separated(", ");
            for kind in kinds {
                sep.push_bind(i64::from(*kind));
            }
            qb.push(")");
        }
        if let Some(since) = filter.since {
            qb.push(" AND e.created_at >= ").push_bind(db_int(since));
        }
        if let Some(until) = filter.until {
            qb.push(" AND e.created_at <= ").push_bind(db_int(until));
        }

        for (name, values) in &filter.tags {
            if values.is_empty() {
                return None;
            }
            qb.push(" AND EXISTS (SELECT 1 FROM tag t WHERE t.event_id = e.id AND t.name = ")
                .push_bind(name.to_string())
                .push(" AND t.value IN (");
            let mut sep = qb.separated(", ");
            for value in values {
                sep.push_bind(value.clone());
            }
            qb.push("))");
        }

        qb.push(" ORDER BY e.created_at DESC LIMIT ")
            .push_bind(db_int(limit));
        Some(qb)
    }
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn write(&self, event: &Event) -> Result<WriteStatus, StoreError> {
        let raw = serde_json::to_string(event).map_err(|e| StoreError::Rejected(e.to_string()))?;
        let mut tx = self.writer.begin().await?;

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO event (id, pubkey, created_at, kind, raw) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(event.id.to_ascii_lowercase())
        .bind(event.pubkey.to_ascii_lowercase())
        .bind(db_int(event.created_at))
        .bind(i64::from(event.kind))
        .bind(&raw)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(WriteStatus::Duplicate);
        }

        // only single-letter tags are queryable
        for tag in &event.tags {
            if let [name, value, ..] = tag.as_slice() {
                if name.chars().count() == 1 {
                    sqlx::query("INSERT INTO tag (event_id, name, value) VALUES (?, ?, ?)")
                        .bind(event.id.to_ascii_lowercase())
                        .bind(name)
                        .bind(value)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(WriteStatus::Stored)
    }

    async fn query(&self, filter: &Filter, limit: u64) -> Result<Vec<Event>, StoreError> {
        let Some(mut qb) = Self::build_query(filter, limit) else {
            return Ok(Vec::new());
        };
        let rows: Vec<String> = qb.build_query_scalar().fetch_all(&self.reader).await?;
        rows.iter()
            .map(|raw| serde_json::from_str(raw).map_err(|e| StoreError::Rejected(e.to_string())))
            .collect()
    }
}

/// Non-durable store kept in memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    ids: HashSet<String>,
    events: Vec<Arc<Event>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().map(|g| g.events.len()).unwrap_or(0)
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of stored events in write order.
    #[must_use]
    pub fn ids_in_order(&self) -> Vec<String> {
        self.inner
            .read()
            .map(|g| g.events.iter().map(|e| e.id.clone()).collect())
            .unwrap_or_default()
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Unavailable("memory store lock poisoned".into())
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn write(&self, event: &Event) -> Result<WriteStatus, StoreError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        if !inner.ids.insert(event.id.to_ascii_lowercase()) {
            return Ok(WriteStatus::Duplicate);
        }
        inner.events.push(Arc::new(event.clone()));
        Ok(WriteStatus::Stored)
    }

    async fn query(&self, filter: &Filter, limit: u64) -> Result<Vec<Event>, StoreError> {
        let inner = self.inner.read().map_err(poisoned)?;
        let mut matched: Vec<&Arc<Event>> =
            inner.events.iter().filter(|e| filter.matches(e)).collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        Ok(matched
            .into_iter()
            .take(limit)
            .map(|e| e.as_ref().clone())
            .collect())
    }
}
