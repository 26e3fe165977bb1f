//! Phase state machine — pure decision logic for coaching progression.
//!
//! Two independent gates must both pass for a transition:
//! a per-phase session-count floor, and keyword evidence of readiness in
//! the last 10 user messages. `Onboarding → Diagnosis` is exempt from the
//! content gate (onboarding carries no diagnostic content). A reset
//! phrase short-circuits everything and always wins over a normal
//! transition for that turn.

use crate::store::types::{MessageRecord, MessageRole, Phase};

/// Keywords signalling readiness for each target phase.
const DIAGNOSIS_KEYWORDS: &[&str] = &[
    "цель", "хочу", "стремлюсь", "мечтаю", "проблема", "область", "сфера",
];
const GOAL_KEYWORDS: &[&str] = &["конкретн", "измерим", "срок", "дедлайн", "результат"];
const PLANNING_KEYWORDS: &[&str] = &["план", "шаги", "действия", "с чего начать"];
const DAILY_KEYWORDS: &[&str] = &["сделал", "не сделал", "выполнил", "провалил"];

/// Phrases that request a fresh start mid-relationship.
const RESET_PHRASES: &[&str] = &[
    "хочу новую цель",
    "начать сначала",
    "сменить тему",
    "другая цель",
    "новая тема",
];

/// Phase the user is rewound to by a reset phrase, with the session floor
/// that puts them one turn short of the next threshold check.
const RESET_PHASE: Phase = Phase::Diagnosis;
const RESET_SESSIONS: i64 = 2;

/// What the state machine decided for this turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseAction {
    /// Advance one step to the contained phase.
    Advance(Phase),
    /// Reset phrase matched: force phase to `Diagnosis`, sessions to 2.
    Reset { phase: Phase, sessions: i64 },
    /// No change this turn.
    Stay,
}

/// Session-count floor for leaving each phase. `Daily` has none — it is
/// the absorbing state.
fn session_threshold(phase: Phase) -> Option<i64> {
    match phase {
        Phase::Onboarding => Some(1),
        Phase::Diagnosis => Some(4),
        Phase::Goal => Some(6),
        Phase::Planning => Some(8),
        Phase::Daily => None,
    }
}

fn keywords_for(target: Phase) -> &'static [&'static str] {
    match target {
        Phase::Diagnosis => DIAGNOSIS_KEYWORDS,
        Phase::Goal => GOAL_KEYWORDS,
        Phase::Planning => PLANNING_KEYWORDS,
        Phase::Daily => DAILY_KEYWORDS,
        Phase::Onboarding => &[],
    }
}

/// Does the current turn's text contain a reset phrase?
pub fn is_reset_phrase(text: &str) -> bool {
    let lower = text.to_lowercase();
    RESET_PHRASES.iter().any(|p| lower.contains(p))
}

/// Content-readiness gate: at least one target-phase keyword among the
/// user-authored entries of `recent`.
fn content_ready(target: Phase, recent: &[MessageRecord]) -> bool {
    let keywords = keywords_for(target);
    if keywords.is_empty() {
        return false;
    }
    recent
        .iter()
        .filter(|m| m.role == MessageRole::User)
        .any(|m| {
            let lower = m.content.to_lowercase();
            keywords.iter().any(|kw| lower.contains(kw))
        })
}

/// Evaluate the state machine for one completed coaching turn.
///
/// `sessions` is the count *after* this turn's increment; `user_text` is
/// the turn's raw inbound text; `recent` is the last-10 message window.
/// Never called in support mode — the pipeline skips phase evaluation
/// there entirely.
pub fn evaluate(
    current: Phase,
    sessions: i64,
    user_text: &str,
    recent: &[MessageRecord],
) -> PhaseAction {
    // Reset wins over any pending transition and suppresses the normal
    // check for this turn. Meaningless during onboarding.
    if current != Phase::Onboarding && is_reset_phrase(user_text) {
        return PhaseAction::Reset {
            phase: RESET_PHASE,
            sessions: RESET_SESSIONS,
        };
    }

    let Some(threshold) = session_threshold(current) else {
        return PhaseAction::Stay;
    };
    if sessions < threshold {
        return PhaseAction::Stay;
    }

    let target = current.next();
    if target == current {
        return PhaseAction::Stay;
    }

    // Onboarding → Diagnosis is exempt from the content gate.
    if current == Phase::Onboarding || content_ready(target, recent) {
        PhaseAction::Advance(target)
    } else {
        PhaseAction::Stay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn user_msg(content: &str) -> MessageRecord {
        MessageRecord {
            id: "m".to_string(),
            user_id: "1".to_string(),
            role: MessageRole::User,
            content: content.to_string(),
            created_at: Utc::now(),
        }
    }

    fn assistant_msg(content: &str) -> MessageRecord {
        MessageRecord {
            role: MessageRole::Assistant,
            ..user_msg(content)
        }
    }

    #[test]
    fn onboarding_advances_on_threshold_alone() {
        // First session, no diagnostic content anywhere
        let action = evaluate(Phase::Onboarding, 1, "привет", &[user_msg("привет")]);
        assert_eq!(action, PhaseAction::Advance(Phase::Diagnosis));
    }

    #[test]
    fn below_threshold_never_advances() {
        let recent = vec![user_msg("моя цель — свой бизнес, есть конкретный срок")];
        let action = evaluate(Phase::Diagnosis, 3, "срок — март", &recent);
        assert_eq!(action, PhaseAction::Stay);
    }

    #[test]
    fn threshold_without_content_stays() {
        // Sessions reached 4 but no goal-phase keywords in recent messages
        let recent = vec![user_msg("погода хорошая"), assistant_msg("да")];
        let action = evaluate(Phase::Diagnosis, 4, "погода хорошая", &recent);
        assert_eq!(action, PhaseAction::Stay);
    }

    #[test]
    fn threshold_with_content_advances_one_step() {
        let recent = vec![user_msg("хочу конкретный результат к сроку")];
        let action = evaluate(Phase::Diagnosis, 4, "ок", &recent);
        assert_eq!(action, PhaseAction::Advance(Phase::Goal));
    }

    #[test]
    fn never_skips_a_phase() {
        // Way past every threshold, with keywords for everything — still
        // one step at a time.
        let recent = vec![user_msg(
            "план есть, шаги ясны, сделал всё, конкретный срок, хочу",
        )];
        let action = evaluate(Phase::Diagnosis, 100, "сделал", &recent);
        assert_eq!(action, PhaseAction::Advance(Phase::Goal));
    }

    #[test]
    fn assistant_keywords_do_not_count() {
        let recent = vec![assistant_msg("какой конкретный результат и срок?")];
        let action = evaluate(Phase::Diagnosis, 4, "не знаю", &recent);
        assert_eq!(action, PhaseAction::Stay);
    }

    #[test]
    fn daily_is_absorbing() {
        let recent = vec![user_msg("сделал, выполнил, план, срок, хочу")];
        let action = evaluate(Phase::Daily, 500, "сделал", &recent);
        assert_eq!(action, PhaseAction::Stay);
    }

    #[test]
    fn reset_phrase_short_circuits() {
        let action = evaluate(Phase::Planning, 9, "хочу новую цель", &[]);
        assert_eq!(
            action,
            PhaseAction::Reset {
                phase: Phase::Diagnosis,
                sessions: 2
            }
        );
    }

    #[test]
    fn reset_wins_over_pending_transition() {
        // Both a reset phrase and planning-ready content: reset wins.
        let recent = vec![user_msg("есть план и шаги")];
        let action = evaluate(Phase::Goal, 6, "план есть, но хочу новую цель", &recent);
        assert!(matches!(action, PhaseAction::Reset { .. }));
    }

    #[test]
    fn reset_ignored_during_onboarding() {
        let action = evaluate(Phase::Onboarding, 1, "начать сначала", &[]);
        assert_eq!(action, PhaseAction::Advance(Phase::Diagnosis));
    }

    #[test]
    fn reset_phrase_matcher() {
        assert!(is_reset_phrase("Хочу новую цель"));
        assert!(is_reset_phrase("давай сменить тему"));
        assert!(!is_reset_phrase("цель прежняя"));
    }
}
