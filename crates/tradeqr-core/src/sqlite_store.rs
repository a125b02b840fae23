//! SQLite-based persistent storage for pairing sessions.
//!
//! Conditional updates are a single guarded `UPDATE` run inside a
//! transaction that also reads back the post-image, so two processes sharing
//! one database file still resolve a race to exactly one winner.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, TimeZone, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{ffi, params, params_from_iter, Connection, OptionalExtension};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::store::{CasOutcome, Change, Guard, SessionStore, StoreError};
use crate::types::{DomainParams, Session, SessionState};

// ============================================================================
// Schema Version
// ============================================================================

/// Current schema version for migrations.
const SCHEMA_VERSION: i32 = 1;

const SESSION_COLUMNS: &str = "id, pairing_code, creator_id, joiner_id, game, price_source, \
     fairness_threshold, currency, event_id, state, expires_at, created_at, updated_at";

// ============================================================================
// SQLite Store Implementation
// ============================================================================

/// SQLite-based persistent store.
pub struct SqliteStore {
    /// SQLite connection wrapped in a mutex for thread-safe access
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run migrations.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)
            .map_err(|e| StoreError::OperationFailed(format!("failed to open database: {}", e)))?;

        // WAL lets readers proceed while a writer holds the lock; the busy
        // timeout covers a second process writing the same file.
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;",
        )
        .map_err(|e| StoreError::OperationFailed(format!("failed to set pragmas: {}", e)))?;

        Self::run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create a new in-memory SQLite store for testing.
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            StoreError::OperationFailed(format!("failed to open in-memory database: {}", e))
        })?;

        Self::run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            [],
        )
        .map_err(|e| StoreError::OperationFailed(format!("failed to create schema_version: {}", e)))?;

        let current_version: i32 = conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
                row.get(0)
            })
            .map_err(|e| StoreError::OperationFailed(format!("failed to read schema version: {}", e)))?;

        if current_version < 1 {
            Self::migrate_v1(conn)?;
        }

        debug_assert!(current_version <= SCHEMA_VERSION);
        Ok(())
    }

    /// Migration to schema version 1 - initial schema.
    fn migrate_v1(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                pairing_code TEXT NOT NULL UNIQUE,
                creator_id TEXT NOT NULL,
                joiner_id TEXT,
                game TEXT NOT NULL,
                price_source TEXT NOT NULL,
                fairness_threshold REAL NOT NULL,
                currency TEXT NOT NULL,
                event_id TEXT,
                state TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                CHECK (joiner_id IS NULL OR joiner_id <> creator_id)
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_state_expires ON sessions(state, expires_at);

            INSERT INTO schema_version (version) VALUES (1);
            "#,
        )
        .map_err(|e| StoreError::OperationFailed(format!("migration v1 failed: {}", e)))?;

        Ok(())
    }

    fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<Session> {
        let id: String = row.get(0)?;
        let id = Uuid::parse_str(&id)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;

        let state: String = row.get(9)?;
        let state = state
            .parse::<SessionState>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, Type::Text, Box::new(e)))?;

        Ok(Session {
            id,
            pairing_code: row.get(1)?,
            creator_id: row.get(2)?,
            joiner_id: row.get(3)?,
            params: DomainParams {
                game: row.get(4)?,
                price_source: row.get(5)?,
                fairness_threshold: row.get(6)?,
                currency: row.get(7)?,
                event_id: row.get(8)?,
            },
            state,
            expires_at: from_millis(row.get(10)?, 10)?,
            created_at: from_millis(row.get(11)?, 11)?,
            updated_at: from_millis(row.get(12)?, 12)?,
        })
    }

    fn load(conn: &Connection, id: &Uuid) -> Result<Option<Session>, StoreError> {
        conn.query_row(
            &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS),
            params![id.to_string()],
            Self::row_to_session,
        )
        .optional()
        .map_err(map_read_error)
    }
}

fn from_millis(millis: i64, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(column, millis))
}

fn map_read_error(e: rusqlite::Error) -> StoreError {
    match e {
        rusqlite::Error::FromSqlConversionFailure(..) | rusqlite::Error::IntegralValueOutOfRange(..) => {
            StoreError::DataCorruption(e.to_string())
        }
        other => StoreError::OperationFailed(other.to_string()),
    }
}

// ============================================================================
// Store Trait Implementation
// ============================================================================

#[async_trait]
impl SessionStore for SqliteStore {
    async fn insert(&self, session: Session) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;

        conn.execute(
            &format!(
                "INSERT INTO sessions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                SESSION_COLUMNS
            ),
            params![
                session.id.to_string(),
                session.pairing_code,
                session.creator_id,
                session.joiner_id,
                session.params.game,
                session.params.price_source,
                session.params.fairness_threshold,
                session.params.currency,
                session.params.event_id,
                session.state.as_str(),
                session.expires_at.timestamp_millis(),
                session.created_at.timestamp_millis(),
                session.updated_at.timestamp_millis(),
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(ref err, _)
                if err.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
                    || err.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
            {
                StoreError::AlreadyExists(format!("session insert: {}", e))
            }
            other => StoreError::OperationFailed(format!("failed to insert session: {}", other)),
        })?;

        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Session>, StoreError> {
        let conn = self.conn.lock().await;
        Self::load(&conn, &id)
    }

    async fn find_by_code(&self, code: &str) -> Result<Option<Session>, StoreError> {
        let conn = self.conn.lock().await;

        conn.query_row(
            &format!("SELECT {} FROM sessions WHERE pairing_code = ?1", SESSION_COLUMNS),
            params![code],
            Self::row_to_session,
        )
        .optional()
        .map_err(map_read_error)
    }

    async fn conditional_update(
        &self,
        id: Uuid,
        guard: &Guard,
        change: &Change,
        now: DateTime<Utc>,
    ) -> Result<CasOutcome, StoreError> {
        guard.check_transition(change)?;
        if guard.states.is_empty() {
            return Err(StoreError::OperationFailed("guard admits no state".to_string()));
        }

        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::OperationFailed(format!("failed to begin transaction: {}", e)))?;

        let placeholders = vec!["?"; guard.states.len()].join(", ");
        let mut sql = format!(
            "UPDATE sessions SET state = ?, joiner_id = COALESCE(?, joiner_id), updated_at = ? \
             WHERE id = ? AND state IN ({})",
            placeholders
        );

        let mut values: Vec<Value> = vec![
            Value::Text(change.state.as_str().to_string()),
            change
                .joiner_id
                .clone()
                .map(Value::Text)
                .unwrap_or(Value::Null),
            Value::Integer(now.trunc_subsecs(3).timestamp_millis()),
            Value::Text(id.to_string()),
        ];
        values.extend(
            guard
                .states
                .iter()
                .map(|s| Value::Text(s.as_str().to_string())),
        );

        if guard.joiner_absent {
            sql.push_str(" AND joiner_id IS NULL");
        }
        if let Some(at) = guard.unexpired_at {
            sql.push_str(" AND expires_at >= ?");
            values.push(Value::Integer(at.timestamp_millis()));
        }

        let changed = tx
            .execute(&sql, params_from_iter(values.iter()))
            .map_err(|e| StoreError::OperationFailed(format!("conditional update failed: {}", e)))?;

        let current = Self::load(&tx, &id)?;

        tx.commit()
            .map_err(|e| StoreError::OperationFailed(format!("failed to commit: {}", e)))?;

        Ok(match (current, changed) {
            (None, _) => CasOutcome::Missing,
            (Some(session), 0) => CasOutcome::Rejected(session),
            (Some(session), _) => CasOutcome::Applied(session),
        })
    }

    async fn expire_stale(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.conn.lock().await;

        let count = conn
            .execute(
                "UPDATE sessions SET state = ?1, updated_at = ?2 \
                 WHERE state = ?3 AND expires_at < ?4",
                params![
                    SessionState::Expired.as_str(),
                    now.trunc_subsecs(3).timestamp_millis(),
                    SessionState::Waiting.as_str(),
                    now.timestamp_millis(),
                ],
            )
            .map_err(|e| StoreError::OperationFailed(format!("failed to expire sessions: {}", e)))?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn make_session(code: &str, now: DateTime<Utc>) -> Session {
        Session::new(
            "alice",
            code.to_string(),
            DomainParams {
                event_id: Some("fnm-2026-10-16".into()),
                ..DomainParams::default()
            },
            now,
            Duration::seconds(120),
        )
    }

    #[tokio::test]
    async fn test_sqlite_insert_and_load() {
        let store = SqliteStore::new_in_memory().unwrap();
        let session = make_session("AAAABBBBCCCCDDDD", Utc::now());

        store.insert(session.clone()).await.unwrap();

        assert_eq!(store.find_by_id(session.id).await.unwrap(), Some(session.clone()));
        assert_eq!(
            store.find_by_code(&session.pairing_code).await.unwrap(),
            Some(session)
        );
    }

    #[tokio::test]
    async fn test_sqlite_load_nonexistent() {
        let store = SqliteStore::new_in_memory().unwrap();

        assert!(store.find_by_id(Uuid::new_v4()).await.unwrap().is_none());
        assert!(store.find_by_code("ZZZZZZZZZZZZZZZZ").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_duplicate_code() {
        let store = SqliteStore::new_in_memory().unwrap();
        let now = Utc::now();

        store.insert(make_session("AAAABBBBCCCCDDDD", now)).await.unwrap();
        let result = store.insert(make_session("AAAABBBBCCCCDDDD", now)).await;

        assert!(matches!(result, Err(StoreError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_sqlite_conditional_update() {
        let store = SqliteStore::new_in_memory().unwrap();
        let now = Utc::now();
        let session = make_session("AAAABBBBCCCCDDDD", now);
        store.insert(session.clone()).await.unwrap();

        let guard = Guard::in_states(&[SessionState::Waiting])
            .joiner_absent()
            .unexpired_at(now);
        let join = Change::to(SessionState::Connected).with_joiner("bob");

        let outcome = store
            .conditional_update(session.id, &guard, &join, now)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            CasOutcome::Applied(ref s)
                if s.state == SessionState::Connected && s.joiner_id.as_deref() == Some("bob")
        ));

        let again = Change::to(SessionState::Connected).with_joiner("carol");
        let outcome = store
            .conditional_update(session.id, &guard, &again, now)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            CasOutcome::Rejected(ref s) if s.joiner_id.as_deref() == Some("bob")
        ));
    }

    #[tokio::test]
    async fn test_sqlite_conditional_update_expired_and_missing() {
        let store = SqliteStore::new_in_memory().unwrap();
        let now = Utc::now();
        let session = make_session("AAAABBBBCCCCDDDD", now);
        store.insert(session.clone()).await.unwrap();

        let late = session.expires_at + Duration::seconds(1);
        let guard = Guard::in_states(&[SessionState::Waiting]).unexpired_at(late);
        let outcome = store
            .conditional_update(session.id, &guard, &Change::to(SessionState::Connected), late)
            .await
            .unwrap();
        assert!(matches!(outcome, CasOutcome::Rejected(_)));

        let outcome = store
            .conditional_update(Uuid::new_v4(), &guard, &Change::to(SessionState::Connected), late)
            .await
            .unwrap();
        assert!(matches!(outcome, CasOutcome::Missing));
    }

    #[tokio::test]
    async fn test_sqlite_expire_stale() {
        let store = SqliteStore::new_in_memory().unwrap();
        let now = Utc::now();
        let stale = make_session("AAAABBBBCCCCDDDD", now);
        let fresh = make_session("EEEEFFFFGGGGHHHH", now + Duration::minutes(5));
        store.insert(stale.clone()).await.unwrap();
        store.insert(fresh.clone()).await.unwrap();

        let later = now + Duration::minutes(3);
        assert_eq!(store.expire_stale(later).await.unwrap(), 1);

        let stale = store.find_by_id(stale.id).await.unwrap().unwrap();
        assert_eq!(stale.state, SessionState::Expired);
        let fresh = store.find_by_id(fresh.id).await.unwrap().unwrap();
        assert_eq!(fresh.state, SessionState::Waiting);
    }

    #[tokio::test]
    async fn test_sqlite_persists_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("sessions.db");
        let session = make_session("AAAABBBBCCCCDDDD", Utc::now());

        {
            let store = SqliteStore::new(&db_path).unwrap();
            store.insert(session.clone()).await.unwrap();
        }

        let store = SqliteStore::new(&db_path).unwrap();
        assert_eq!(store.find_by_id(session.id).await.unwrap(), Some(session));
    }

    #[tokio::test]
    async fn test_sqlite_rejects_self_join_row() {
        let store = SqliteStore::new_in_memory().unwrap();
        let mut session = make_session("AAAABBBBCCCCDDDD", Utc::now());
        session.joiner_id = Some("alice".into());

        assert!(matches!(
            store.insert(session).await,
            Err(StoreError::OperationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_sqlite_duplicate_id_already_exists() {
        let store = SqliteStore::new_in_memory().unwrap();
        let session = make_session("AAAABBBBCCCCDDDD", Utc::now());
        store.insert(session.clone()).await.unwrap();

        let mut same_id = make_session("EEEEFFFFGGGGHHHH", Utc::now());
        same_id.id = session.id;

        assert!(matches!(
            store.insert(same_id).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_sqlite_rejects_illegal_transition() {
        let store = SqliteStore::new_in_memory().unwrap();
        let now = Utc::now();
        let session = make_session("AAAABBBBCCCCDDDD", now);
        store.insert(session.clone()).await.unwrap();

        let result = store
            .conditional_update(
                session.id,
                &Guard::in_states(&[SessionState::Waiting]),
                &Change::to(SessionState::Completed),
                now,
            )
            .await;
        assert!(matches!(result, Err(StoreError::IllegalTransition { .. })));

        let stored = store.find_by_id(session.id).await.unwrap().unwrap();
        assert_eq!(stored.state, SessionState::Waiting);
    }
}
