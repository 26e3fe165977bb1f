//! Self-defeating speech pattern detection.
//!
//! Two detection paths that intentionally use separate vocabularies:
//! a synchronous lexicon scan on every message (fixed trigger phrases),
//! and a periodic LLM classification pass over recent messages that can
//! catch patterns with no lexical footprint (avoidance, pity-seeking).
//! The deep pass is best-effort enrichment and never fails a turn.

use std::sync::Arc;

use serde::Deserialize;

use crate::coach::prompts;
use crate::error::StoreError;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::store::types::MessageRole;
use crate::store::Store;

/// Max tokens for the deep analysis call.
const DEEP_SCAN_MAX_TOKENS: u32 = 300;
/// Deep analysis runs every Nth session.
const DEEP_SCAN_EVERY: i64 = 5;
/// Message window fetched for deep analysis.
const DEEP_SCAN_WINDOW: usize = 10;
/// User-authored messages actually sent to the model.
const DEEP_SCAN_USER_MESSAGES: usize = 5;

/// One lexicon entry: pattern type, trigger phrases, human-readable label.
struct LexiconEntry {
    pattern_type: &'static str,
    triggers: &'static [&'static str],
    label: &'static str,
}

/// Fixed lexicon of self-defeating speech patterns.
static LEXICON: &[LexiconEntry] = &[
    LexiconEntry {
        pattern_type: "weak_commitment",
        triggers: &["попробую", "постараюсь", "наверное сделаю", "может сделаю"],
        label: "Слабое обязательство ('попробую' вместо 'сделаю')",
    },
    LexiconEntry {
        pattern_type: "no_time",
        triggers: &["нет времени", "нет время", "когда будет время", "не успеваю", "некогда"],
        label: "Отмазка 'нет времени'",
    },
    LexiconEntry {
        pattern_type: "vague",
        triggers: &["наверное", "возможно", "может быть", "когда-нибудь", "скоро"],
        label: "Размытые формулировки без конкретики",
    },
    LexiconEntry {
        pattern_type: "blame_external",
        triggers: &["из-за него", "из-за неё", "из-за них", "обстоятельства", "не дают", "мешают"],
        label: "Перекладывание ответственности на внешние факторы",
    },
    LexiconEntry {
        pattern_type: "not_ready",
        triggers: &["ещё не готов", "не готова", "нужно подготовиться", "не время"],
        label: "Паттерн 'ещё не готов'",
    },
    LexiconEntry {
        pattern_type: "low_self_worth",
        triggers: &["я не достойна", "я не заслуживаю", "кто я такая", "я никто", "я ничего не стою"],
        label: "Самообесценивание ('я не достойна')",
    },
    LexiconEntry {
        pattern_type: "too_late",
        triggers: &["мне поздно", "уже не в том возрасте", "время упущено", "поезд ушёл", "слишком поздно"],
        label: "Убеждение 'мне поздно что-то менять'",
    },
    LexiconEntry {
        pattern_type: "must_endure",
        triggers: &["нужно терпеть", "все так живут", "бывает и хуже", "надо смириться", "такова жизнь"],
        label: "Паттерн 'нужно терпеть'",
    },
    LexiconEntry {
        pattern_type: "guilt_pattern",
        triggers: &["я виновата", "это из-за меня", "я плохая мать", "я плохая жена", "всё из-за меня"],
        label: "Чувство вины ('я виновата во всём')",
    },
];

/// Pattern types the deep scan may return. Overlaps with the lexicon but
/// is not identical — kept separate on purpose.
const DEEP_PATTERN_TYPES: &[&str] = &[
    "weak_commitment",
    "blame_external",
    "low_self_worth",
    "avoidance",
    "seeking_pity",
    "vague",
    "not_ready",
];

/// A single lexicon match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
    pub pattern_type: &'static str,
    pub label: &'static str,
}

/// Scan one message against the lexicon. Case-insensitive substring
/// matching; at most one match per pattern type (first trigger wins).
pub fn scan(text: &str) -> Vec<PatternMatch> {
    let lower = text.to_lowercase();
    let mut matches = Vec::new();
    for entry in LEXICON {
        if entry.triggers.iter().any(|t| lower.contains(t)) {
            matches.push(PatternMatch {
                pattern_type: entry.pattern_type,
                label: entry.label,
            });
        }
    }
    matches
}

/// Outcome of a deep analysis pass.
///
/// Explicit so "skipped intentionally" is distinguishable from "failed
/// silently" — both are fine for the turn, but only one is a bug signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeepScanOutcome {
    /// Ran and recorded this many pattern entries (possibly zero).
    Recorded(usize),
    /// Did not run or produced nothing usable.
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Session count is not a multiple of the scan interval.
    NotDue,
    /// The window held no user-authored messages.
    NoUserMessages,
    /// The inference call failed.
    LlmUnavailable,
    /// The response held no parseable JSON array.
    Unparseable,
}

/// Shape of one entry in the deep-scan response array.
#[derive(Debug, Deserialize)]
struct DeepPattern {
    #[serde(rename = "type")]
    pattern_type: String,
    text: String,
}

/// Pattern detector — lexicon scan plus periodic deep analysis.
pub struct PatternDetector {
    store: Arc<dyn Store>,
    llm_fast: Arc<dyn LlmProvider>,
}

impl PatternDetector {
    pub fn new(store: Arc<dyn Store>, llm_fast: Arc<dyn LlmProvider>) -> Self {
        Self { store, llm_fast }
    }

    /// Scan `text` and persist every match. Synchronous with respect to
    /// the turn: the updated pattern set feeds the instruction payload.
    pub async fn scan_and_record(&self, user_id: &str, text: &str) -> Result<usize, StoreError> {
        let matches = scan(text);
        for m in &matches {
            self.store
                .record_pattern(user_id, m.pattern_type, m.label)
                .await?;
        }
        if !matches.is_empty() {
            tracing::debug!(user_id, count = matches.len(), "Lexicon patterns recorded");
        }
        Ok(matches.len())
    }

    /// Run the deep analysis pass if it is due for `sessions_count`.
    ///
    /// Best-effort: every failure maps to a `Skipped` outcome and is
    /// logged, never surfaced to the turn.
    pub async fn deep_scan(&self, user_id: &str, sessions_count: i64) -> DeepScanOutcome {
        if sessions_count == 0 || sessions_count % DEEP_SCAN_EVERY != 0 {
            return DeepScanOutcome::Skipped(SkipReason::NotDue);
        }

        let messages = match self.store.recent_messages(user_id, DEEP_SCAN_WINDOW).await {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Deep scan: message window read failed");
                return DeepScanOutcome::Skipped(SkipReason::NoUserMessages);
            }
        };

        let user_messages: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == MessageRole::User)
            .map(|m| m.content.as_str())
            .collect();
        if user_messages.is_empty() {
            return DeepScanOutcome::Skipped(SkipReason::NoUserMessages);
        }

        let tail_start = user_messages.len().saturating_sub(DEEP_SCAN_USER_MESSAGES);
        let text_block = user_messages[tail_start..].join("\n---\n");

        let request = CompletionRequest::new(vec![ChatMessage::user(
            prompts::deep_pattern_analysis(&text_block),
        )])
        .with_max_tokens(DEEP_SCAN_MAX_TOKENS);

        let response = match self.llm_fast.complete(request).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Deep scan: LLM call failed");
                return DeepScanOutcome::Skipped(SkipReason::LlmUnavailable);
            }
        };

        let Some(patterns) = parse_deep_response(&response.content) else {
            tracing::debug!(user_id, "Deep scan: response held no JSON array");
            return DeepScanOutcome::Skipped(SkipReason::Unparseable);
        };

        let mut recorded = 0;
        for p in patterns {
            if !DEEP_PATTERN_TYPES.contains(&p.pattern_type.as_str()) {
                continue;
            }
            match self
                .store
                .record_pattern(user_id, &p.pattern_type, &p.text)
                .await
            {
                Ok(()) => recorded += 1,
                Err(e) => {
                    tracing::warn!(user_id, error = %e, "Deep scan: pattern write failed");
                }
            }
        }

        tracing::debug!(user_id, recorded, "Deep scan complete");
        DeepScanOutcome::Recorded(recorded)
    }

}

/// Extract the first `[...]` JSON array from the model response and parse
/// its well-formed entries. Entries missing `type` or `text` are dropped.
fn parse_deep_response(raw: &str) -> Option<Vec<DeepPattern>> {
    let start = raw.find('[')?;
    let end = raw.rfind(']')?;
    if end < start {
        return None;
    }
    let entries: Vec<serde_json::Value> = serde_json::from_str(&raw[start..=end]).ok()?;
    Some(
        entries
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect(),
    )
}
