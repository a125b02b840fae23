//! Session record, state enumeration and creation parameters.

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::errors::SessionError;

pub const DEFAULT_GAME: &str = "mtg";
pub const DEFAULT_PRICE_SOURCE: &str = "tcgplayer_market";
pub const DEFAULT_FAIRNESS_THRESHOLD: f64 = 5.0;
pub const DEFAULT_CURRENCY: &str = "USD";

pub const SUPPORTED_GAMES: &[&str] = &["mtg"];
pub const SUPPORTED_PRICE_SOURCES: &[&str] = &["tcgplayer_market"];
pub const FAIRNESS_THRESHOLD_RANGE: RangeInclusive<f64> = 2.0..=10.0;
pub const MAX_EVENT_ID_LEN: usize = 128;

/// Stable identity of a caller, resolved by the external auth collaborator.
pub type UserId = String;

// ============================================================================
// Session State
// ============================================================================

/// Lifecycle state of a pairing session.
///
/// `Expired` is only ever written by the expiry sweep; reads fold the expiry
/// check in through [`Session::effective_state`] so a `Waiting` row past its
/// deadline is reported as `Expired` even before the sweep rewrites it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Waiting,
    Connected,
    Proposing,
    Completed,
    Cancelled,
    Expired,
}

impl SessionState {
    pub const ALL: [SessionState; 6] = [
        SessionState::Waiting,
        SessionState::Connected,
        SessionState::Proposing,
        SessionState::Completed,
        SessionState::Cancelled,
        SessionState::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Waiting => "waiting",
            SessionState::Connected => "connected",
            SessionState::Proposing => "proposing",
            SessionState::Completed => "completed",
            SessionState::Cancelled => "cancelled",
            SessionState::Expired => "expired",
        }
    }

    /// No operation may mutate a session in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Cancelled | SessionState::Expired
        )
    }

    /// Forward edges of the state machine. Nothing ever runs backward.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Waiting, Connected)
                | (Connected, Proposing)
                | (Proposing, Completed)
                | (Waiting, Cancelled)
                | (Connected, Cancelled)
                | (Proposing, Cancelled)
                | (Waiting, Expired)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown session state: {0}")]
pub struct UnknownState(pub String);

impl FromStr for SessionState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(SessionState::Waiting),
            "connected" => Ok(SessionState::Connected),
            "proposing" => Ok(SessionState::Proposing),
            "completed" => Ok(SessionState::Completed),
            "cancelled" => Ok(SessionState::Cancelled),
            "expired" => Ok(SessionState::Expired),
            other => Err(UnknownState(other.to_string())),
        }
    }
}

// ============================================================================
// Domain Parameters
// ============================================================================

/// Trade parameters fixed at creation and immutable afterward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainParams {
    pub game: String,
    pub price_source: String,
    pub fairness_threshold: f64,
    pub currency: String,
    pub event_id: Option<String>,
}

impl Default for DomainParams {
    fn default() -> Self {
        Self {
            game: DEFAULT_GAME.to_string(),
            price_source: DEFAULT_PRICE_SOURCE.to_string(),
            fairness_threshold: DEFAULT_FAIRNESS_THRESHOLD,
            currency: DEFAULT_CURRENCY.to_string(),
            event_id: None,
        }
    }
}

/// Caller-supplied creation options. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub game: Option<String>,
    pub price_source: Option<String>,
    pub fairness_threshold: Option<f64>,
    pub event_id: Option<String>,
}

impl CreateSessionRequest {
    /// Validate and resolve defaults.
    pub fn into_params(self) -> Result<DomainParams, SessionError> {
        let mut params = DomainParams::default();

        if let Some(game) = self.game {
            if !SUPPORTED_GAMES.contains(&game.as_str()) {
                return Err(SessionError::Validation(format!(
                    "unsupported game '{}', supported: {}",
                    game,
                    SUPPORTED_GAMES.join(", ")
                )));
            }
            params.game = game;
        }

        if let Some(source) = self.price_source {
            if !SUPPORTED_PRICE_SOURCES.contains(&source.as_str()) {
                return Err(SessionError::Validation(format!(
                    "unsupported price source '{}', supported: {}",
                    source,
                    SUPPORTED_PRICE_SOURCES.join(", ")
                )));
            }
            params.price_source = source;
        }

        if let Some(threshold) = self.fairness_threshold {
            if !threshold.is_finite() || !FAIRNESS_THRESHOLD_RANGE.contains(&threshold) {
                return Err(SessionError::Validation(format!(
                    "fairness threshold must be between {}% and {}%",
                    FAIRNESS_THRESHOLD_RANGE.start(),
                    FAIRNESS_THRESHOLD_RANGE.end()
                )));
            }
            params.fairness_threshold = threshold;
        }

        if let Some(event_id) = self.event_id {
            let event_id = event_id.trim();
            if event_id.is_empty() || event_id.len() > MAX_EVENT_ID_LEN {
                return Err(SessionError::Validation(format!(
                    "event id must be 1 to {} characters",
                    MAX_EVENT_ID_LEN
                )));
            }
            params.event_id = Some(event_id.to_string());
        }

        Ok(params)
    }
}

// ============================================================================
// Session
// ============================================================================

/// Durable record of one pairing attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: Uuid,
    pub pairing_code: String,
    pub creator_id: UserId,
    pub joiner_id: Option<UserId>,
    #[serde(flatten)]
    pub params: DomainParams,
    pub state: SessionState,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Build a fresh `Waiting` session. Timestamps are truncated to
    /// milliseconds so every store round-trips them exactly.
    pub fn new(
        creator_id: impl Into<UserId>,
        pairing_code: String,
        params: DomainParams,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        let now = now.trunc_subsecs(3);
        Self {
            id: Uuid::new_v4(),
            pairing_code,
            creator_id: creator_id.into(),
            joiner_id: None,
            params,
            state: SessionState::Waiting,
            expires_at: now + ttl,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// State as observed by callers at `now`.
    pub fn effective_state(&self, now: DateTime<Utc>) -> SessionState {
        if self.state == SessionState::Waiting && self.is_expired_at(now) {
            SessionState::Expired
        } else {
            self.state
        }
    }

    pub fn is_creator(&self, user_id: &str) -> bool {
        self.creator_id == user_id
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        self.is_creator(user_id) || self.joiner_id.as_deref() == Some(user_id)
    }

    /// Replace the stored state with the effective one.
    pub fn observed_at(mut self, now: DateTime<Utc>) -> Self {
        self.state = self.effective_state(now);
        self
    }
}

/// A session as returned to one particular caller.
#[derive(Debug, Clone)]
pub struct SessionView {
    pub session: Session,
    pub is_creator: bool,
}
