//! Session lifecycle manager.
//!
//! Orchestrates creation, redemption, cancellation and expiry of pairing
//! sessions against a [`SessionStore`]. Every mutation goes through the
//! store's conditional update, so correctness never depends on an in-process
//! lock: two service instances racing on one code still resolve to a single
//! winner.

use std::sync::Arc;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::code::{normalize_code, redact, CodeGenerator, RandomCodeGenerator};
use crate::errors::SessionError;
use crate::rate_limit::{Admission, CreationLimiter};
use crate::store::{CasOutcome, Change, Guard, SessionStore, StoreError};
use crate::types::{CreateSessionRequest, Session, SessionState, SessionView};

/// Conditional cancel attempts before giving up on a contended session.
const CANCEL_ATTEMPTS: usize = 2;

/// Lifecycle tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Time a new session stays joinable.
    pub ttl: Duration,
    /// Fresh codes tried when the store reports a collision.
    pub max_code_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::seconds(120),
            max_code_attempts: 3,
        }
    }
}

/// Result of a cancel request.
#[derive(Debug, Clone)]
pub struct Cancellation {
    pub session: Session,
    /// False when the session was already cancelled or expired.
    pub applied: bool,
}

/// The protocol core.
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    limiter: Arc<dyn CreationLimiter>,
    codes: Arc<dyn CodeGenerator>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, limiter: Arc<dyn CreationLimiter>) -> Self {
        Self {
            store,
            limiter,
            codes: Arc::new(RandomCodeGenerator),
            clock: Arc::new(SystemClock),
            config: SessionConfig::default(),
        }
    }

    pub fn with_code_generator(mut self, codes: Arc<dyn CodeGenerator>) -> Self {
        self.codes = codes;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Millisecond precision, the finest every store keeps.
    fn now(&self) -> DateTime<Utc> {
        self.clock.now().trunc_subsecs(3)
    }

    /// Create a new `Waiting` session owned by `creator_id`.
    ///
    /// The rate limit is consulted first; a rejected or failed check leaves
    /// no trace in the store.
    pub async fn create(
        &self,
        creator_id: &str,
        origin: &str,
        request: CreateSessionRequest,
    ) -> Result<SessionView, SessionError> {
        if let Admission::Limited { retry_after_secs } = self.limiter.allow(origin).await? {
            return Err(SessionError::RateLimitExceeded { retry_after_secs });
        }

        let params = request.into_params()?;

        for attempt in 1..=self.config.max_code_attempts {
            let code = self.codes.generate()?;
            let session = Session::new(
                creator_id,
                code,
                params.clone(),
                self.now(),
                self.config.ttl,
            );

            match self.store.insert(session.clone()).await {
                Ok(()) => {
                    info!(
                        session_id = %session.id,
                        code = redact(&session.pairing_code),
                        creator = %creator_id,
                        "Created pairing session"
                    );
                    return Ok(SessionView {
                        session,
                        is_creator: true,
                    });
                }
                Err(StoreError::AlreadyExists(reason)) => {
                    warn!(attempt, reason = %reason, "Pairing code collision, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(SessionError::Generation(format!(
            "no unique code after {} attempts",
            self.config.max_code_attempts
        )))
    }

    /// Redeem a pairing code, moving its session to `Connected`.
    pub async fn join(&self, joiner_id: &str, code: &str) -> Result<SessionView, SessionError> {
        let code = normalize_code(code)
            .ok_or_else(|| SessionError::Validation("malformed pairing code".to_string()))?;

        let session = self
            .store
            .find_by_code(&code)
            .await?
            .ok_or(SessionError::CodeNotFound)?;

        let now = self.now();
        check_joinable(&session, joiner_id, now)?;

        let guard = Guard::reaching(SessionState::Connected)
            .joiner_absent()
            .unexpired_at(now);
        let change = Change::to(SessionState::Connected).with_joiner(joiner_id);

        match self
            .store
            .conditional_update(session.id, &guard, &change, now)
            .await?
        {
            CasOutcome::Applied(session) => {
                info!(
                    session_id = %session.id,
                    code = redact(&code),
                    joiner = %joiner_id,
                    "Joined pairing session"
                );
                Ok(SessionView {
                    session,
                    is_creator: false,
                })
            }
            CasOutcome::Rejected(current) => {
                debug!(session_id = %current.id, "Lost join race");
                Err(check_joinable(&current, joiner_id, now)
                    .err()
                    .unwrap_or(SessionError::SessionFull))
            }
            CasOutcome::Missing => Err(SessionError::CodeNotFound),
        }
    }

    /// Fetch a session on behalf of one of its participants.
    pub async fn get(&self, id: Uuid, caller_id: &str) -> Result<SessionView, SessionError> {
        let session = self
            .store
            .find_by_id(id)
            .await?
            .ok_or(SessionError::SessionNotFound)?;

        if !session.is_participant(caller_id) {
            return Err(SessionError::NotAParticipant);
        }

        let is_creator = session.is_creator(caller_id);
        Ok(SessionView {
            session: session.observed_at(self.now()),
            is_creator,
        })
    }

    /// Cancel a session. Only the creator may cancel.
    ///
    /// Cancelling a session that is already cancelled or expired succeeds
    /// without writing anything and reports `applied: false`.
    pub async fn cancel(&self, id: Uuid, caller_id: &str) -> Result<Cancellation, SessionError> {
        let mut session = self
            .store
            .find_by_id(id)
            .await?
            .ok_or(SessionError::SessionNotFound)?;

        if !session.is_creator(caller_id) {
            return Err(SessionError::OnlyCreatorMayCancel);
        }

        for _ in 0..CANCEL_ATTEMPTS {
            let now = self.now();
            match session.effective_state(now) {
                SessionState::Completed => return Err(SessionError::AlreadyCompleted),
                state if state.is_terminal() => {
                    debug!(session_id = %id, %state, "Cancel on finished session is a no-op");
                    return Ok(Cancellation {
                        session: session.observed_at(now),
                        applied: false,
                    });
                }
                _ => {}
            }

            let guard = Guard::reaching(SessionState::Cancelled);
            let change = Change::to(SessionState::Cancelled);
            match self.store.conditional_update(id, &guard, &change, now).await? {
                CasOutcome::Applied(cancelled) => {
                    info!(session_id = %id, "Cancelled pairing session");
                    return Ok(Cancellation {
                        session: cancelled,
                        applied: true,
                    });
                }
                CasOutcome::Rejected(current) => session = current,
                CasOutcome::Missing => return Err(SessionError::SessionNotFound),
            }
        }

        Err(StoreError::OperationFailed(format!("session {} kept changing during cancel", id)).into())
    }

    /// Rewrite `Waiting` sessions past their deadline to `Expired`.
    pub async fn sweep_expired(&self) -> Result<usize, SessionError> {
        let expired = self.store.expire_stale(self.now()).await?;
        if expired > 0 {
            info!(count = expired, "Expired stale pairing sessions");
        }
        Ok(expired)
    }
}

/// Join preconditions, checked in order. A code past its deadline reads as
/// expired whatever state the session has moved on to.
fn check_joinable(session: &Session, joiner_id: &str, now: DateTime<Utc>) -> Result<(), SessionError> {
    if session.is_expired_at(now) || session.state == SessionState::Expired {
        return Err(SessionError::SessionExpired);
    }
    if !session.state.can_transition_to(SessionState::Connected) {
        return Err(SessionError::SessionNotJoinable);
    }
    if session.is_creator(joiner_id) {
        return Err(SessionError::SelfJoinForbidden);
    }
    if session.joiner_id.is_some() {
        return Err(SessionError::SessionFull);
    }
    Ok(())
}
