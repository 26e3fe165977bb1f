//! Crisis interception — safety-critical signal detection.
//!
//! Runs before any persistence or network call. A hard signal
//! short-circuits the pipeline entirely: the canned reply goes out, the
//! inbound text is never stored as a turn and the model is never called.
//! A soft signal only annotates the instruction payload.

/// Classification of a message's crisis content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrisisSignal {
    /// No safety-critical content.
    None,
    /// Despair/hopelessness wording — proceed, but flag the turn.
    Soft,
    /// Explicit self-harm intent — short-circuit with the canned reply.
    Hard,
}

/// Phrases that indicate explicit self-harm intent.
const HARD_TRIGGERS: &[&str] = &[
    "не хочу жить",
    "не хочется жить",
    "покончить с собой",
    "покончу с собой",
    "убить себя",
    "убью себя",
    "суицид",
    "самоубийств",
    "свести счёты с жизнью",
    "нет смысла жить",
];

/// Phrases that indicate despair without explicit intent.
const SOFT_TRIGGERS: &[&str] = &[
    "всё бесполезно",
    "все бесполезно",
    "ничего не помогает",
    "я в отчаянии",
    "сил больше нет",
    "больше не могу так",
    "не вижу выхода",
    "всё безнадёжно",
];

/// Canned reply for hard signals. Plain text, sent instead of a model reply.
pub const CRISIS_RESPONSE: &str = "Я слышу, что тебе сейчас очень тяжело. \
Я — инструмент коучинга и не могу помочь в таком состоянии, но помощь есть.\n\n\
Пожалуйста, позвони на линию психологической помощи: 8-800-2000-122 \
(бесплатно, круглосуточно). Если есть непосредственная опасность — звони 112.\n\n\
Ты не один. Поговори с живым человеком — прямо сейчас.";

/// Classify a message. Pure function: no side effects, no I/O.
pub fn classify(text: &str) -> CrisisSignal {
    let lower = text.to_lowercase();
    if HARD_TRIGGERS.iter().any(|t| lower.contains(t)) {
        return CrisisSignal::Hard;
    }
    if SOFT_TRIGGERS.iter().any(|t| lower.contains(t)) {
        return CrisisSignal::Soft;
    }
    CrisisSignal::None
}
