//! Upload session entity
//!
//! A durable record of one in-progress upload (small or chunked resumable).
//! Every state transition is persisted by the upload manager so that
//! non-terminal sessions survive a process restart and resume from
//! `next_offset`.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::ItemId;

/// Default boundary between the single-request and chunked strategies (4 MiB).
pub const SMALL_UPLOAD_THRESHOLD: u64 = 4 * 1024 * 1024;

/// Default chunk size for resumable sessions: 10 MiB, a multiple of the
/// 320 KiB granularity the service requires.
pub const UPLOAD_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// Base delay for exponential backoff.
pub const BACKOFF_BASE_SECS: i64 = 1;

/// Backoff ceiling.
pub const BACKOFF_CAP_SECS: i64 = 60;

/// Retry budget before a session fails terminally.
pub const MAX_UPLOAD_RETRIES: u32 = 5;

// ============================================================================
// Strategy, priority, endpoint
// ============================================================================

/// How the content will be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStrategy {
    /// Single PUT below the small-upload threshold
    Small,
    /// Resumable chunked session
    Chunked,
}

impl UploadStrategy {
    /// Picks the strategy for a given content length.
    #[must_use]
    pub fn for_size(size: u64, threshold: u64) -> Self {
        if size <= threshold {
            UploadStrategy::Small
        } else {
            UploadStrategy::Chunked
        }
    }
}

/// Scheduling class for the worker pool. `High` is user-initiated work
/// (flush on close); `Low` is background reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadPriority {
    High,
    #[default]
    Low,
}

/// A chunked-upload endpoint with its own lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadEndpoint {
    /// Pre-authenticated session URL
    pub url: String,
    /// When the URL stops accepting chunks
    pub expires_at: Option<DateTime<Utc>>,
}

impl UploadEndpoint {
    /// Returns true once the endpoint lifetime has elapsed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|t| Utc::now() >= t)
    }
}

// ============================================================================
// State machine
// ============================================================================

/// Session lifecycle. `Completed`, `Failed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    #[default]
    Queued,
    Starting,
    UploadingSmall,
    UploadingChunked,
    Finalizing,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl UploadState {
    /// Returns true for states no further transition may leave.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadState::Completed | UploadState::Failed | UploadState::Cancelled
        )
    }

    /// Returns true while bytes are on the wire or being finalized.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            UploadState::UploadingSmall | UploadState::UploadingChunked | UploadState::Finalizing
        )
    }

    /// Checks whether a transition to `target` is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: &UploadState) -> bool {
        if self.is_terminal() {
            return false;
        }
        // Any non-terminal state may fall back to retrying or fail outright.
        if matches!(target, UploadState::Retrying | UploadState::Failed) {
            return true;
        }

        matches!(
            (self, target),
            (UploadState::Queued, UploadState::Starting)
                | (UploadState::Starting, UploadState::UploadingSmall)
                | (UploadState::Starting, UploadState::UploadingChunked)
                | (UploadState::Starting, UploadState::Cancelled)
                | (UploadState::UploadingSmall, UploadState::Finalizing)
                | (UploadState::UploadingChunked, UploadState::Finalizing)
                | (UploadState::Finalizing, UploadState::Completed)
                | (UploadState::Retrying, UploadState::Starting)
        )
    }
}

// ============================================================================
// UploadSession
// ============================================================================

/// Durable state for a single upload.
///
/// Invariant (enforced by the upload manager): at most one session exists per
/// item id at any time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadSession {
    /// Item being uploaded (may still carry a `local-` id)
    pub id: ItemId,
    /// Parent id at enqueue time
    pub parent_id: ItemId,
    /// Name under the parent
    pub name: String,
    /// Chosen strategy (set at `Starting`)
    pub strategy: Option<UploadStrategy>,
    /// Chunk size for the chunked strategy
    pub chunk_size: u64,
    /// Active chunked endpoint, if any
    pub endpoint: Option<UploadEndpoint>,
    /// Next byte offset the server expects
    pub next_offset: u64,
    /// Total content length at enqueue time
    pub total_size: u64,
    /// QuickXorHash of the local content (streamed during upload)
    pub content_hash: Option<String>,
    /// ETag the local edit was based on, for precondition checks
    pub base_etag: Option<String>,
    /// Scheduling class
    pub priority: UploadPriority,
    /// Current state
    pub state: UploadState,
    /// Last error message, if any
    pub error: Option<String>,
    /// Attempts so far
    pub retry_count: u32,
    /// Earliest instant the next attempt may start
    pub not_before: Option<DateTime<Utc>>,
    /// Enqueue time
    pub created_at: DateTime<Utc>,
}

impl UploadSession {
    /// Creates a queued session for an item.
    #[must_use]
    pub fn new(
        id: ItemId,
        parent_id: ItemId,
        name: impl Into<String>,
        total_size: u64,
        priority: UploadPriority,
    ) -> Self {
        Self {
            id,
            parent_id,
            name: name.into(),
            strategy: None,
            chunk_size: UPLOAD_CHUNK_SIZE,
            endpoint: None,
            next_offset: 0,
            total_size,
            content_hash: None,
            base_etag: None,
            priority,
            state: UploadState::Queued,
            error: None,
            retry_count: 0,
            not_before: None,
            created_at: Utc::now(),
        }
    }

    /// Attempts a state transition, rejecting invalid edges.
    pub fn transition_to(&mut self, target: UploadState) -> Result<(), super::RemoteError> {
        if !self.state.can_transition_to(&target) {
            return Err(super::RemoteError::Internal(format!(
                "invalid upload transition {:?} -> {:?} for {}",
                self.state, target, self.id
            )));
        }
        if matches!(target, UploadState::Starting) && matches!(self.state, UploadState::Retrying) {
            self.not_before = None;
        }
        self.state = target;
        Ok(())
    }

    /// Records a failed attempt and schedules the next one with exponential
    /// backoff: base 1 s doubling to a 60 s cap, with a ±10% deterministic
    /// jitter derived from the session identity.
    ///
    /// A server-provided `retry_after` hint overrides the computed delay.
    pub fn schedule_retry(&mut self, error: impl Into<String>, retry_after: Option<Duration>) {
        self.retry_count += 1;
        self.error = Some(error.into());

        let delay = match retry_after {
            Some(hint) => hint,
            None => {
                let exp = BACKOFF_BASE_SECS.saturating_mul(
                    2i64.saturating_pow(self.retry_count.saturating_sub(1).min(16)),
                );
                let capped = exp.min(BACKOFF_CAP_SECS);
                let millis = capped * 1000;
                let jittered = millis + millis * self.jitter_permille() / 1000;
                Duration::milliseconds(jittered.max(0))
            }
        };

        self.not_before = Some(Utc::now() + delay);
        self.state = UploadState::Retrying;
    }

    /// Returns true once the retry budget is spent.
    #[must_use]
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= MAX_UPLOAD_RETRIES
    }

    /// Returns true if the session may be attempted now.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        match self.not_before {
            Some(t) => Utc::now() >= t,
            None => true,
        }
    }

    /// Per-session jitter in the range [-100, 100] permille.
    fn jitter_permille(&self) -> i64 {
        let mut hasher = DefaultHasher::new();
        self.id.as_str().hash(&mut hasher);
        self.retry_count.hash(&mut hasher);
        (hasher.finish() % 201) as i64 - 100
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> UploadSession {
        UploadSession::new(
            ItemId::local(),
            ItemId::root(),
            "hello.txt",
            5,
            UploadPriority::High,
        )
    }

    #[test]
    fn test_strategy_selection_boundary() {
        let t = SMALL_UPLOAD_THRESHOLD;
        assert_eq!(UploadStrategy::for_size(0, t), UploadStrategy::Small);
        assert_eq!(UploadStrategy::for_size(t, t), UploadStrategy::Small);
        assert_eq!(UploadStrategy::for_size(t + 1, t), UploadStrategy::Chunked);
    }

    #[test]
    fn test_chunk_size_is_320kib_aligned() {
        assert_eq!(UPLOAD_CHUNK_SIZE % (320 * 1024), 0);
    }

    #[test]
    fn test_happy_path_small() {
        let mut s = session();
        s.transition_to(UploadState::Starting).unwrap();
        s.transition_to(UploadState::UploadingSmall).unwrap();
        s.transition_to(UploadState::Finalizing).unwrap();
        s.transition_to(UploadState::Completed).unwrap();
        assert!(s.state.is_terminal());
    }

    #[test]
    fn test_happy_path_chunked() {
        let mut s = session();
        s.transition_to(UploadState::Starting).unwrap();
        s.transition_to(UploadState::UploadingChunked).unwrap();
        assert!(s.state.is_active());
        s.transition_to(UploadState::Finalizing).unwrap();
        s.transition_to(UploadState::Completed).unwrap();
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut s = session();
        s.transition_to(UploadState::Starting).unwrap();
        s.transition_to(UploadState::Cancelled).unwrap();
        assert!(s.transition_to(UploadState::Starting).is_err());
        assert!(s.transition_to(UploadState::Retrying).is_err());
    }

    #[test]
    fn test_cancel_only_from_starting() {
        let mut s = session();
        assert!(!s.state.can_transition_to(&UploadState::Cancelled));
        s.transition_to(UploadState::Starting).unwrap();
        assert!(s.state.can_transition_to(&UploadState::Cancelled));
        s.transition_to(UploadState::UploadingSmall).unwrap();
        assert!(!s.state.can_transition_to(&UploadState::Cancelled));
    }

    #[test]
    fn test_retry_cycle_returns_to_starting() {
        let mut s = session();
        s.transition_to(UploadState::Starting).unwrap();
        s.transition_to(UploadState::UploadingChunked).unwrap();
        s.schedule_retry("connection reset", None);
        assert_eq!(s.state, UploadState::Retrying);
        assert_eq!(s.retry_count, 1);
        assert!(s.not_before.is_some());

        s.transition_to(UploadState::Starting).unwrap();
        assert!(s.not_before.is_none());
    }

    #[test]
    fn test_backoff_honors_retry_after_hint() {
        let mut s = session();
        s.transition_to(UploadState::Starting).unwrap();
        s.schedule_retry("429", Some(Duration::seconds(42)));
        let delta = s.not_before.unwrap() - Utc::now();
        assert!(delta.num_seconds() >= 40 && delta.num_seconds() <= 42);
    }

    #[test]
    fn test_backoff_caps_at_sixty_seconds() {
        let mut s = session();
        s.transition_to(UploadState::Starting).unwrap();
        for _ in 0..8 {
            s.schedule_retry("boom", None);
            let delay = s.not_before.unwrap() - Utc::now();
            // never beyond the cap plus the 10% jitter headroom
            assert!(delay.num_milliseconds() <= 66_000);
            s.transition_to(UploadState::Starting).unwrap();
        }
        // deep into the retry series the delay sits at the cap
        s.schedule_retry("boom", None);
        let delay = s.not_before.unwrap() - Utc::now();
        assert!(delay.num_milliseconds() >= 53_000);
    }

    #[test]
    fn test_retry_budget() {
        let mut s = session();
        assert!(!s.retries_exhausted());
        for _ in 0..MAX_UPLOAD_RETRIES {
            s.schedule_retry("x", None);
        }
        assert!(s.retries_exhausted());
    }

    #[test]
    fn test_ready_gate() {
        let mut s = session();
        assert!(s.is_ready());
        s.schedule_retry("x", Some(Duration::seconds(3600)));
        assert!(!s.is_ready());
    }

    #[test]
    fn test_serde_roundtrip_preserves_offset() {
        let mut s = session();
        s.next_offset = 41_943_040;
        s.strategy = Some(UploadStrategy::Chunked);
        s.endpoint = Some(UploadEndpoint {
            url: "https://up.example/session/1".into(),
            expires_at: None,
        });
        let json = serde_json::to_string(&s).unwrap();
        let back: UploadSession = serde_json::from_str(&json).unwrap();
        assert_eq!(back.next_offset, 41_943_040);
        assert_eq!(back.strategy, Some(UploadStrategy::Chunked));
        assert_eq!(back, s);
    }
}
