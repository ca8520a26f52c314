//! SQLite-backed container store.
//!
//! Timestamps are stored as Unix nanoseconds, the full precision `chrono`
//! keeps, so `list_dying` compares exactly what was saved.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;

use arena_core::{
    types::{Container, ContainerStatus, Endpoint},
    ContainerStore, Error, Result,
};

const COLUMNS: &str = "id, image, status, started_at, expect_stop_at, internal_host, \
                       internal_port, is_proxy, public_host, public_port, team_id, challenge_id";

/// Durable store over a single SQLite connection.
pub struct SqliteContainerStore {
    conn: Arc<tokio::sync::Mutex<Connection>>,
}

impl SqliteContainerStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::storage(format!("Cannot create {}: {}", parent.display(), e)))?;
        }
        let conn = Connection::open(path).map_err(|e| Error::storage(format!("DB error: {}", e)))?;
        Self::init(conn)
    }

    /// Private in-memory database, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| Error::storage(format!("DB error: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS containers (
                id TEXT PRIMARY KEY,
                image TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at INTEGER NOT NULL,     -- unix nanos
                expect_stop_at INTEGER NOT NULL, -- unix nanos
                internal_host TEXT NOT NULL,
                internal_port INTEGER NOT NULL,
                is_proxy INTEGER NOT NULL,
                public_host TEXT,
                public_port INTEGER,
                team_id TEXT NOT NULL,
                challenge_id TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_containers_owner ON containers (team_id, challenge_id);
            CREATE INDEX IF NOT EXISTS idx_containers_deadline ON containers (expect_stop_at);",
        )
        .map_err(|e| Error::storage(format!("Schema error: {}", e)))?;

        Ok(Self {
            conn: Arc::new(tokio::sync::Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            f(&conn).map_err(|e| Error::storage(format!("Query error: {}", e)))
        })
        .await
        .map_err(|e| Error::internal(e.to_string()))?
    }
}

fn conversion_error(column: usize, ty: Type, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, ty, msg.into())
}

fn port(column: usize, value: i64) -> rusqlite::Result<u16> {
    u16::try_from(value)
        .map_err(|_| conversion_error(column, Type::Integer, format!("invalid port {}", value)))
}

fn timestamp(nanos: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_nanos(nanos)
}

fn nanos(at: DateTime<Utc>) -> Result<i64> {
    at.timestamp_nanos_opt()
        .ok_or_else(|| Error::storage(format!("timestamp {} out of range", at)))
}

fn row_to_container(row: &Row<'_>) -> rusqlite::Result<Container> {
    let status: String = row.get(2)?;
    let status = ContainerStatus::parse(&status)
        .ok_or_else(|| conversion_error(2, Type::Text, format!("unknown status {}", status)))?;

    let public_host: Option<String> = row.get(8)?;
    let public_port: Option<i64> = row.get(9)?;
    let public = match (public_host, public_port) {
        (Some(host), Some(p)) => Some(Endpoint::new(host, port(9, p)?)),
        _ => None,
    };

    Ok(Container {
        id: row.get(0)?,
        image: row.get(1)?,
        status,
        started_at: timestamp(row.get(3)?),
        expect_stop_at: timestamp(row.get(4)?),
        internal: Endpoint::new(row.get::<_, String>(5)?, port(6, row.get(6)?)?),
        is_proxy: row.get(7)?,
        public,
        team_id: row.get(10)?,
        challenge_id: row.get(11)?,
    })
}

#[async_trait]
impl ContainerStore for SqliteContainerStore {
    async fn save(&self, container: &Container) -> Result<()> {
        let c = container.clone();
        let started_at = nanos(c.started_at)?;
        let expect_stop_at = nanos(c.expect_stop_at)?;
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO containers ({}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    COLUMNS
                ),
                params![
                    c.id,
                    c.image,
                    c.status.as_str(),
                    started_at,
                    expect_stop_at,
                    c.internal.host,
                    i64::from(c.internal.port),
                    c.is_proxy,
                    c.public.as_ref().map(|p| p.host.clone()),
                    c.public.as_ref().map(|p| i64::from(p.port)),
                    c.team_id,
                    c.challenge_id,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<Container>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM containers WHERE id = ?1", COLUMNS),
                params![id],
                row_to_container,
            )
            .optional()
        })
        .await
    }

    async fn find_active(&self, team_id: &str, challenge_id: &str) -> Result<Option<Container>> {
        let team_id = team_id.to_string();
        let challenge_id = challenge_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM containers \
                     WHERE team_id = ?1 AND challenge_id = ?2 AND status != ?3 \
                     ORDER BY started_at DESC LIMIT 1",
                    COLUMNS
                ),
                params![team_id, challenge_id, ContainerStatus::Destroyed.as_str()],
                row_to_container,
            )
            .optional()
        })
        .await
    }

    async fn list_dying(&self, now: DateTime<Utc>) -> Result<Vec<Container>> {
        let now = nanos(now)?;
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM containers WHERE expect_stop_at < ?1 ORDER BY expect_stop_at",
                COLUMNS
            ))?;
            let rows = stmt.query_map(params![now], row_to_container)?;
            let dying = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(dying)
        })
        .await
    }

    async fn remove(&self, container: &Container) -> Result<()> {
        let id = container.id.clone();
        let blocked = self
            .with_conn(move |conn| {
                let deleted = conn.execute(
                    "DELETE FROM containers WHERE id = ?1 AND status = ?2",
                    params![id, ContainerStatus::Destroyed.as_str()],
                )?;
                if deleted > 0 {
                    return Ok(None);
                }
                conn.query_row(
                    "SELECT status FROM containers WHERE id = ?1",
                    params![id],
                    |row| row.get::<_, String>(0),
                )
                .optional()
            })
            .await?;

        match blocked {
            Some(status) => Err(Error::invalid_state(format!(
                "container {} is {}, only destroyed records can be removed",
                container.id, status
            ))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roundtrip_preserves_endpoints() {
        let store = SqliteContainerStore::open_in_memory().unwrap();
        let mut record = Container::new("pod-1", "web:1", Endpoint::new("10.96.0.10", 8080))
            .with_owner("t1", "c1");
        record.status = ContainerStatus::Running;
        record.is_proxy = false;
        record.public = Some(Endpoint::new("ctf.example.com", 30001));
        store.save(&record).await.unwrap();

        let loaded = store.get("pod-1").await.unwrap().unwrap();
        assert_eq!(loaded.internal, record.internal);
        assert_eq!(loaded.public, record.public);
        assert!(!loaded.is_proxy);
        assert_eq!(loaded.expect_stop_at, record.expect_stop_at);
        assert_eq!(loaded.started_at, record.started_at);
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("containers.db");

        {
            let store = SqliteContainerStore::open(&path).unwrap();
            let record = Container::new("c1", "echo", Endpoint::new("172.17.0.2", 7))
                .with_owner("t1", "c1");
            store.save(&record).await.unwrap();
        }

        let reopened = SqliteContainerStore::open(&path).unwrap();
        let found = reopened.find_active("t1", "c1").await.unwrap();
        assert_eq!(found.map(|c| c.id), Some("c1".to_string()));
    }
}
