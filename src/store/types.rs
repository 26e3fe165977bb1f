//! Core persisted types: user profiles, messages, patterns, commitments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coaching phase — ordered stages of the coaching relationship.
///
/// Progression is strictly forward one step at a time; `Daily` is the
/// terminal absorbing state. The only way back is an explicit reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Onboarding,
    Diagnosis,
    Goal,
    Planning,
    Daily,
}

impl Phase {
    /// The next phase in the progression. `Daily` maps to itself.
    pub fn next(self) -> Phase {
        match self {
            Phase::Onboarding => Phase::Diagnosis,
            Phase::Diagnosis => Phase::Goal,
            Phase::Goal => Phase::Planning,
            Phase::Planning => Phase::Daily,
            Phase::Daily => Phase::Daily,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Onboarding => "onboarding",
            Phase::Diagnosis => "diagnosis",
            Phase::Goal => "goal",
            Phase::Planning => "planning",
            Phase::Daily => "daily",
        }
    }

    /// Parse a DB string. Unknown values fall back to `Onboarding`.
    pub fn from_db(s: &str) -> Phase {
        match s {
            "diagnosis" => Phase::Diagnosis,
            "goal" => Phase::Goal,
            "planning" => Phase::Planning,
            "daily" => Phase::Daily,
            _ => Phase::Onboarding,
        }
    }

    /// Human-readable Russian label for status output.
    pub fn label(self) -> &'static str {
        match self {
            Phase::Onboarding => "Знакомство",
            Phase::Diagnosis => "Диагностика",
            Phase::Goal => "Постановка цели",
            Phase::Planning => "Составление плана",
            Phase::Daily => "Ежедневная работа",
        }
    }
}

/// Conversation mode, orthogonal to phase.
///
/// Toggled by explicit user action only; the pipeline never changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Coaching,
    Support,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Coaching => "coaching",
            Mode::Support => "support",
        }
    }

    pub fn from_db(s: &str) -> Mode {
        match s {
            "support" => Mode::Support,
            _ => Mode::Coaching,
        }
    }
}

/// Coaching style preference, chosen by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoachingStyle {
    Soft,
    Balanced,
    Direct,
}

impl CoachingStyle {
    pub fn as_i64(self) -> i64 {
        match self {
            CoachingStyle::Soft => 1,
            CoachingStyle::Balanced => 2,
            CoachingStyle::Direct => 3,
        }
    }

    pub fn from_db(n: i64) -> CoachingStyle {
        match n {
            1 => CoachingStyle::Soft,
            3 => CoachingStyle::Direct,
            _ => CoachingStyle::Balanced,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            CoachingStyle::Soft => "Мягкий",
            CoachingStyle::Balanced => "Сбалансированный",
            CoachingStyle::Direct => "Жёсткий",
        }
    }
}

/// A concrete action with a deadline, extracted from an assistant reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commitment {
    pub action: String,
    #[serde(default)]
    pub deadline: Option<String>,
}

/// One user's coaching profile.
///
/// Created lazily at first contact, mutated only through the pipeline
/// (phase, sessions, commitments) or explicit user commands (mode,
/// style, reset). Never deleted.
#[derive(Debug, Clone)]
pub struct UserProfile {
    /// Stable external identity (the transport's user id as text).
    pub user_id: String,
    pub name: String,
    pub phase: Phase,
    pub mode: Mode,
    pub style: CoachingStyle,
    pub goal: Option<String>,
    pub goal_deadline: Option<String>,
    pub sessions_count: i64,
    /// Bounded FIFO list, capacity 5.
    pub commitments: Vec<Commitment>,
    /// Denormalized cache of distinct pattern types seen for this user.
    /// Authoritative counts live in the patterns table.
    pub patterns_detected: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Maximum number of commitments kept per profile (FIFO eviction).
pub const MAX_COMMITMENTS: usize = 5;

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }

    pub fn from_db(s: &str) -> MessageRole {
        match s {
            "assistant" => MessageRole::Assistant,
            _ => MessageRole::User,
        }
    }
}

/// An immutable, append-only conversation message.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub id: String,
    pub user_id: String,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Occurrence counter for one (user, pattern type) pair.
#[derive(Debug, Clone)]
pub struct PatternRecord {
    pub user_id: String,
    pub pattern_type: String,
    /// Human-readable label describing the pattern.
    pub label: String,
    pub count: i64,
    pub detected_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_progression_is_forward_and_daily_absorbs() {
        assert_eq!(Phase::Onboarding.next(), Phase::Diagnosis);
        assert_eq!(Phase::Diagnosis.next(), Phase::Goal);
        assert_eq!(Phase::Goal.next(), Phase::Planning);
        assert_eq!(Phase::Planning.next(), Phase::Daily);
        assert_eq!(Phase::Daily.next(), Phase::Daily);
    }

    #[test]
    fn phase_roundtrip() {
        for phase in [
            Phase::Onboarding,
            Phase::Diagnosis,
            Phase::Goal,
            Phase::Planning,
            Phase::Daily,
        ] {
            assert_eq!(Phase::from_db(phase.as_str()), phase);
        }
        assert_eq!(Phase::from_db("garbage"), Phase::Onboarding);
    }

    #[test]
    fn mode_and_style_roundtrip() {
        assert_eq!(Mode::from_db("support"), Mode::Support);
        assert_eq!(Mode::from_db("anything"), Mode::Coaching);
        assert_eq!(CoachingStyle::from_db(1), CoachingStyle::Soft);
        assert_eq!(CoachingStyle::from_db(2), CoachingStyle::Balanced);
        assert_eq!(CoachingStyle::from_db(3), CoachingStyle::Direct);
        assert_eq!(CoachingStyle::from_db(99), CoachingStyle::Balanced);
    }

    #[test]
    fn commitment_json_shape() {
        let c: Commitment =
            serde_json::from_str(r#"{"action": "написать клиентам", "deadline": "завтра"}"#)
                .unwrap();
        assert_eq!(c.action, "написать клиентам");
        assert_eq!(c.deadline.as_deref(), Some("завтра"));

        let no_deadline: Commitment = serde_json::from_str(r#"{"action": "позвонить"}"#).unwrap();
        assert!(no_deadline.deadline.is_none());
    }
}
