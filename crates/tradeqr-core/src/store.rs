//! Storage abstraction for pairing sessions.
//!
//! This module defines the `SessionStore` trait and provides an in-memory
//! implementation for tests and single-node deployments.
//!
//! The load-bearing primitive is [`SessionStore::conditional_update`]: a
//! compare-and-set that applies a [`Change`] only if the current record
//! satisfies a [`Guard`], atomically. Two racing writers on the same session
//! resolve to exactly one winner; the loser is handed the winner's record.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::types::{Session, SessionState, UserId};

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during store operations.
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("record already exists: {0}")]
    AlreadyExists(String),

    #[error("storage operation failed: {0}")]
    OperationFailed(String),

    #[error("data corruption detected: {0}")]
    DataCorruption(String),

    #[error("illegal transition from {from} to {to}")]
    IllegalTransition { from: SessionState, to: SessionState },
}

// ============================================================================
// Conditional Update
// ============================================================================

/// Precondition a record must meet for a conditional update to apply.
#[derive(Debug, Clone)]
pub struct Guard {
    /// The stored state must be one of these.
    pub states: Vec<SessionState>,
    /// The joiner must not be set yet.
    pub joiner_absent: bool,
    /// If set, `expires_at` must not be before this instant.
    pub unexpired_at: Option<DateTime<Utc>>,
}

impl Guard {
    pub fn in_states(states: &[SessionState]) -> Self {
        Self {
            states: states.to_vec(),
            joiner_absent: false,
            unexpired_at: None,
        }
    }

    /// Every state with an edge to `target` in the state machine.
    pub fn reaching(target: SessionState) -> Self {
        let states: Vec<SessionState> = SessionState::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(target))
            .collect();
        Self::in_states(&states)
    }

    pub fn joiner_absent(mut self) -> Self {
        self.joiner_absent = true;
        self
    }

    pub fn unexpired_at(mut self, now: DateTime<Utc>) -> Self {
        self.unexpired_at = Some(now);
        self
    }

    pub fn admits(&self, session: &Session) -> bool {
        self.states.contains(&session.state)
            && (!self.joiner_absent || session.joiner_id.is_none())
            && self
                .unexpired_at
                .map_or(true, |now| !session.is_expired_at(now))
    }

    /// Reject a change that some admitted state could not legally make.
    pub fn check_transition(&self, change: &Change) -> Result<(), StoreError> {
        match self.states.iter().find(|s| !s.can_transition_to(change.state)) {
            Some(&from) => Err(StoreError::IllegalTransition {
                from,
                to: change.state,
            }),
            None => Ok(()),
        }
    }
}

/// Mutation applied when a guard admits a record.
#[derive(Debug, Clone)]
pub struct Change {
    pub state: SessionState,
    pub joiner_id: Option<UserId>,
}

impl Change {
    pub fn to(state: SessionState) -> Self {
        Self {
            state,
            joiner_id: None,
        }
    }

    pub fn with_joiner(mut self, joiner_id: impl Into<UserId>) -> Self {
        self.joiner_id = Some(joiner_id.into());
        self
    }

    pub fn apply(&self, session: &mut Session, now: DateTime<Utc>) {
        session.state = self.state;
        if let Some(joiner_id) = &self.joiner_id {
            session.joiner_id = Some(joiner_id.clone());
        }
        session.updated_at = now.trunc_subsecs(3);
    }
}

/// Result of a conditional update.
#[derive(Debug, Clone)]
pub enum CasOutcome {
    /// The guard held; carries the post-image.
    Applied(Session),
    /// The guard did not hold; carries the current record, unchanged.
    Rejected(Session),
    /// No record with that id.
    Missing,
}

// ============================================================================
// Store Trait
// ============================================================================

/// Durable source of truth for pairing sessions.
///
/// Sessions are never physically deleted through this interface. Terminal
/// records are kept for audit.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a new session.
    ///
    /// Fails with `StoreError::AlreadyExists` if the id or the pairing code
    /// is already taken.
    async fn insert(&self, session: Session) -> Result<(), StoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Session>, StoreError>;

    async fn find_by_code(&self, code: &str) -> Result<Option<Session>, StoreError>;

    /// Atomically apply `change` if the current record satisfies `guard`.
    ///
    /// Fails with `StoreError::IllegalTransition` before touching anything
    /// if a state the guard admits has no edge to `change.state`.
    async fn conditional_update(
        &self,
        id: Uuid,
        guard: &Guard,
        change: &Change,
        now: DateTime<Utc>,
    ) -> Result<CasOutcome, StoreError>;

    /// Rewrite every `Waiting` session whose deadline passed before `now`
    /// to `Expired`. Returns the number of sessions rewritten.
    async fn expire_stale(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}

// ============================================================================
// In-Memory Store Implementation
// ============================================================================

#[derive(Default)]
struct Tables {
    sessions: HashMap<Uuid, Session>,
    /// pairing code -> session id
    codes: HashMap<String, Uuid>,
}

/// Thread-safe in-memory store.
///
/// All writes take the single write lock, which makes every conditional
/// update atomic with respect to every other operation.
#[derive(Default, Clone)]
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new in-memory store wrapped in an Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub async fn len(&self) -> usize {
        self.tables.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn insert(&self, session: Session) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;

        if tables.codes.contains_key(&session.pairing_code) {
            return Err(StoreError::AlreadyExists("pairing code".to_string()));
        }
        if tables.sessions.contains_key(&session.id) {
            return Err(StoreError::AlreadyExists(format!("session {}", session.id)));
        }

        tables.codes.insert(session.pairing_code.clone(), session.id);
        tables.sessions.insert(session.id, session);
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Session>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.sessions.get(&id).cloned())
    }

    async fn find_by_code(&self, code: &str) -> Result<Option<Session>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .codes
            .get(code)
            .and_then(|id| tables.sessions.get(id))
            .cloned())
    }

    async fn conditional_update(
        &self,
        id: Uuid,
        guard: &Guard,
        change: &Change,
        now: DateTime<Utc>,
    ) -> Result<CasOutcome, StoreError> {
        guard.check_transition(change)?;
        let mut tables = self.tables.write().await;

        let Some(session) = tables.sessions.get_mut(&id) else {
            return Ok(CasOutcome::Missing);
        };

        if !guard.admits(session) {
            return Ok(CasOutcome::Rejected(session.clone()));
        }

        change.apply(session, now);
        Ok(CasOutcome::Applied(session.clone()))
    }

    async fn expire_stale(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut tables = self.tables.write().await;
        let expire = Change::to(SessionState::Expired);

        let mut count = 0;
        for session in tables.sessions.values_mut() {
            if session.state == SessionState::Waiting && session.is_expired_at(now) {
                expire.apply(session, now);
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DomainParams;
    use chrono::Duration;

    fn make_session(code: &str, now: DateTime<Utc>) -> Session {
        Session::new(
            "alice",
            code.to_string(),
            DomainParams::default(),
            now,
            Duration::seconds(120),
        )
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let store = InMemoryStore::new();
        let session = make_session("AAAABBBBCCCCDDDD", Utc::now());

        store.insert(session.clone()).await.unwrap();

        assert_eq!(store.find_by_id(session.id).await.unwrap(), Some(session.clone()));
        assert_eq!(
            store.find_by_code("AAAABBBBCCCCDDDD").await.unwrap(),
            Some(session)
        );
        assert!(store.find_by_code("ZZZZZZZZZZZZZZZZ").await.unwrap().is_none());
        assert!(store.find_by_id(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_code_rejected() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        store.insert(make_session("AAAABBBBCCCCDDDD", now)).await.unwrap();
        let result = store.insert(make_session("AAAABBBBCCCCDDDD", now)).await;

        assert!(matches!(result, Err(StoreError::AlreadyExists(_))));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_conditional_update_applies_once() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let session = make_session("AAAABBBBCCCCDDDD", now);
        store.insert(session.clone()).await.unwrap();

        let guard = Guard::in_states(&[SessionState::Waiting])
            .joiner_absent()
            .unexpired_at(now);

        let first = store
            .conditional_update(
                session.id,
                &guard,
                &Change::to(SessionState::Connected).with_joiner("bob"),
                now,
            )
            .await
            .unwrap();
        let CasOutcome::Applied(applied) = first else {
            panic!("first update should apply");
        };
        assert_eq!(applied.state, SessionState::Connected);
        assert_eq!(applied.joiner_id.as_deref(), Some("bob"));

        let second = store
            .conditional_update(
                session.id,
                &guard,
                &Change::to(SessionState::Connected).with_joiner("carol"),
                now,
            )
            .await
            .unwrap();
        let CasOutcome::Rejected(current) = second else {
            panic!("second update should be rejected");
        };
        assert_eq!(current.joiner_id.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn test_conditional_update_respects_expiry() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let session = make_session("AAAABBBBCCCCDDDD", now);
        store.insert(session.clone()).await.unwrap();

        let late = session.expires_at + Duration::seconds(1);
        let guard = Guard::in_states(&[SessionState::Waiting]).unexpired_at(late);

        let outcome = store
            .conditional_update(session.id, &guard, &Change::to(SessionState::Connected), late)
            .await
            .unwrap();
        assert!(matches!(outcome, CasOutcome::Rejected(s) if s.state == SessionState::Waiting));
    }

    #[tokio::test]
    async fn test_conditional_update_missing() {
        let store = InMemoryStore::new();
        let outcome = store
            .conditional_update(
                Uuid::new_v4(),
                &Guard::in_states(&[SessionState::Waiting]),
                &Change::to(SessionState::Cancelled),
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, CasOutcome::Missing));
    }

    #[test]
    fn test_guard_reaching_follows_state_machine() {
        assert_eq!(
            Guard::reaching(SessionState::Connected).states,
            vec![SessionState::Waiting]
        );
        assert_eq!(
            Guard::reaching(SessionState::Cancelled).states,
            vec![
                SessionState::Waiting,
                SessionState::Connected,
                SessionState::Proposing
            ]
        );
    }

    #[tokio::test]
    async fn test_conditional_update_rejects_illegal_transition() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let session = make_session("AAAABBBBCCCCDDDD", now);
        store.insert(session.clone()).await.unwrap();

        let result = store
            .conditional_update(
                session.id,
                &Guard::in_states(&[SessionState::Waiting, SessionState::Completed]),
                &Change::to(SessionState::Cancelled),
                now,
            )
            .await;
        assert!(matches!(
            result,
            Err(StoreError::IllegalTransition {
                from: SessionState::Completed,
                to: SessionState::Cancelled
            })
        ));

        let stored = store.find_by_id(session.id).await.unwrap().unwrap();
        assert_eq!(stored.state, SessionState::Waiting);
    }

    #[tokio::test]
    async fn test_expire_stale_only_touches_waiting() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        let waiting = make_session("AAAABBBBCCCCDDDD", now);
        let mut connected = make_session("EEEEFFFFGGGGHHHH", now);
        connected.state = SessionState::Connected;
        connected.joiner_id = Some("bob".into());
        let fresh = make_session("JJJJKKKKMMMMNNNN", now + Duration::minutes(5));

        store.insert(waiting.clone()).await.unwrap();
        store.insert(connected.clone()).await.unwrap();
        store.insert(fresh.clone()).await.unwrap();

        let later = now + Duration::minutes(3);
        assert_eq!(store.expire_stale(later).await.unwrap(), 1);
        assert_eq!(store.expire_stale(later).await.unwrap(), 0);

        let waiting = store.find_by_id(waiting.id).await.unwrap().unwrap();
        assert_eq!(waiting.state, SessionState::Expired);
        let connected = store.find_by_id(connected.id).await.unwrap().unwrap();
        assert_eq!(connected.state, SessionState::Connected);
        let fresh = store.find_by_id(fresh.id).await.unwrap().unwrap();
        assert_eq!(fresh.state, SessionState::Waiting);
    }
}
