//! Unified `Store` trait — single async interface for all persistence.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::store::types::{
    CoachingStyle, Commitment, MessageRecord, MessageRole, Mode, PatternRecord, Phase, UserProfile,
};

/// Backend-agnostic persistence trait covering profiles, messages, and
/// pattern records.
///
/// Nothing here enforces per-user serialization: counters and the
/// commitments list are plain read-modify-write columns, so callers must
/// hold the user's lock (see `coach::pipeline::UserLocks`) around any
/// mutating sequence.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Profiles ────────────────────────────────────────────────────

    /// Get a profile by external identity.
    async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>, StoreError>;

    /// Create a profile with default phase/mode/style. Idempotent: if the
    /// profile already exists it is returned unchanged.
    async fn create_profile(&self, user_id: &str, name: &str) -> Result<UserProfile, StoreError>;

    /// Set the coaching phase.
    async fn set_phase(&self, user_id: &str, phase: Phase) -> Result<(), StoreError>;

    /// Set phase and session count together (reset paths).
    async fn set_phase_and_sessions(
        &self,
        user_id: &str,
        phase: Phase,
        sessions: i64,
    ) -> Result<(), StoreError>;

    /// Increment the session counter by one.
    async fn increment_sessions(&self, user_id: &str) -> Result<(), StoreError>;

    /// Set the conversation mode.
    async fn set_mode(&self, user_id: &str, mode: Mode) -> Result<(), StoreError>;

    /// Set the coaching style preference.
    async fn set_style(&self, user_id: &str, style: CoachingStyle) -> Result<(), StoreError>;

    /// Replace the commitments list.
    async fn set_commitments(
        &self,
        user_id: &str,
        commitments: &[Commitment],
    ) -> Result<(), StoreError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Append a conversation message.
    async fn append_message(
        &self,
        user_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<(), StoreError>;

    /// Last `limit` messages for a user in chronological order.
    async fn recent_messages(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError>;

    // ── Patterns ────────────────────────────────────────────────────

    /// Upsert-increment a pattern record for (user, pattern type).
    async fn record_pattern(
        &self,
        user_id: &str,
        pattern_type: &str,
        label: &str,
    ) -> Result<(), StoreError>;

    /// All pattern records for a user, ordered by count descending.
    async fn patterns_for_user(&self, user_id: &str) -> Result<Vec<PatternRecord>, StoreError>;

    // ── Checkin fan-out ─────────────────────────────────────────────

    /// Users not in `Onboarding` who sent a message within the trailing
    /// `days` window.
    async fn active_users(&self, days: u32) -> Result<Vec<UserProfile>, StoreError>;
}
