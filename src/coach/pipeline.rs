//! Message processing pipeline — the orchestrator.
//!
//! Sequences crisis interception, pattern detection, persistence, context
//! assembly, the retried inference call, and post-reply bookkeeping
//! (background commitment extraction, session accounting, deep pattern
//! analysis, phase evaluation). The public contract never raises: every
//! failure mode resolves to a returned reply string.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::coach::commitments::{ExtractionHandle, ExtractionJob};
use crate::coach::context::ContextAssembler;
use crate::coach::crisis::{self, CrisisSignal};
use crate::coach::patterns::PatternDetector;
use crate::coach::phase::{self, PhaseAction};
use crate::error::LlmError;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::store::types::{MessageRole, Mode, UserProfile};
use crate::store::Store;

/// Reply for blank/whitespace-only input.
pub const REPLY_EMPTY_INPUT: &str = "Напиши что-нибудь — я здесь.";
/// Reply when the inference service is unavailable after all retries.
pub const REPLY_SERVICE_FAILURE: &str = "Произошла ошибка, попробуй ещё раз.";

/// Message window used for phase content-gate evaluation.
const PHASE_WINDOW: usize = 10;

/// Retry schedule for the main inference call.
///
/// Delays are expressed in multiples of `unit` so tests can drive them
/// with paused time: rate limits back off 1,2,4,8,16 units, transient
/// errors wait a fixed 2 units, an empty-but-successful response waits 1.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            unit: Duration::from_secs(1),
        }
    }
}

/// Per-user execution locks.
///
/// The store's counters and list truncation are plain read-modify-write,
/// so at most one pipeline execution (or checkin send) may be in flight
/// per user. Different users proceed in parallel.
#[derive(Clone, Default)]
pub struct UserLocks {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `user_id`, creating it on first use.
    pub async fn acquire(&self, user_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            Arc::clone(
                map.entry(user_id.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }
}

/// The message processing pipeline.
pub struct MessagePipeline {
    store: Arc<dyn Store>,
    llm_main: Arc<dyn LlmProvider>,
    detector: PatternDetector,
    assembler: ContextAssembler,
    extraction: ExtractionHandle,
    retry: RetryPolicy,
    locks: UserLocks,
    max_reply_tokens: u32,
}

impl MessagePipeline {
    pub fn new(
        store: Arc<dyn Store>,
        llm_main: Arc<dyn LlmProvider>,
        llm_fast: Arc<dyn LlmProvider>,
        extraction: ExtractionHandle,
    ) -> Self {
        Self {
            detector: PatternDetector::new(Arc::clone(&store), llm_fast),
            assembler: ContextAssembler::new(Arc::clone(&store)),
            store,
            llm_main,
            extraction,
            retry: RetryPolicy::default(),
            locks: UserLocks::new(),
            max_reply_tokens: 700,
        }
    }

    /// Override the retry schedule (tests use a short unit).
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Override the reply token budget.
    pub fn with_max_reply_tokens(mut self, max_reply_tokens: u32) -> Self {
        self.max_reply_tokens = max_reply_tokens;
        self
    }

    /// The shared per-user lock map. The checkin runner uses the same
    /// locks so a scheduled send never interleaves with a live turn.
    pub fn locks(&self) -> UserLocks {
        self.locks.clone()
    }

    /// Process one inbound message and produce the reply text.
    ///
    /// Never raises to the caller; all failure modes degrade to a reply
    /// string.
    pub async fn process(&self, user_id: &str, display_name: &str, text: &str) -> String {
        if text.trim().is_empty() {
            return REPLY_EMPTY_INPUT.to_string();
        }

        let _guard = self.locks.acquire(user_id).await;
        self.process_locked(user_id, display_name, text).await
    }

    async fn process_locked(&self, user_id: &str, display_name: &str, text: &str) -> String {
        // Load or lazily create the profile.
        let profile = match self.ensure_profile(user_id, display_name).await {
            Ok(p) => p,
            Err(reply) => return reply,
        };

        // Crisis check runs before any persistence or network call.
        let soft_crisis = match crisis::classify(text) {
            CrisisSignal::Hard => {
                warn!(user_id, "Hard crisis signal — short-circuiting turn");
                return crisis::CRISIS_RESPONSE.to_string();
            }
            CrisisSignal::Soft => {
                info!(user_id, "Soft crisis signal — flagging turn");
                true
            }
            CrisisSignal::None => false,
        };

        // Lexicon scan feeds the instruction payload, so it must land
        // before context assembly.
        if let Err(e) = self.detector.scan_and_record(user_id, text).await {
            warn!(user_id, error = %e, "Pattern scan failed");
            return REPLY_SERVICE_FAILURE.to_string();
        }

        if let Err(e) = self
            .store
            .append_message(user_id, MessageRole::User, text)
            .await
        {
            warn!(user_id, error = %e, "Failed to persist user turn");
            return REPLY_SERVICE_FAILURE.to_string();
        }

        let (instructions, history) = match self.assembler.build(&profile, soft_crisis).await {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!(user_id, error = %e, "Context assembly failed");
                return REPLY_SERVICE_FAILURE.to_string();
            }
        };

        let Some(raw_reply) = self.request_with_retry(instructions, history).await else {
            warn!(user_id, "Inference attempts exhausted");
            return REPLY_SERVICE_FAILURE.to_string();
        };

        let reply = strip_markdown(&raw_reply);
        if let Err(e) = self
            .store
            .append_message(user_id, MessageRole::Assistant, &reply)
            .await
        {
            warn!(user_id, error = %e, "Failed to persist assistant turn");
        }

        // Support mode: open conversation only. No session accounting,
        // no extraction, no deep analysis, no phase evaluation.
        if profile.mode == Mode::Support {
            return reply;
        }

        // Fire-and-forget: queued before the reply is returned, never
        // awaited. A full queue drops the job rather than delaying the
        // reply.
        let job = ExtractionJob {
            user_id: user_id.to_string(),
            assistant_text: reply.clone(),
        };
        if let Err(e) = self.extraction.try_send(job) {
            warn!(user_id, error = %e, "Extraction queue full, dropping job");
        }

        if let Err(e) = self.store.increment_sessions(user_id).await {
            warn!(user_id, error = %e, "Session increment failed");
        }
        let new_sessions = profile.sessions_count + 1;

        self.detector.deep_scan(user_id, new_sessions).await;

        self.evaluate_phase(user_id, &profile, new_sessions, text)
            .await;

        reply
    }

    async fn ensure_profile(
        &self,
        user_id: &str,
        display_name: &str,
    ) -> Result<UserProfile, String> {
        match self.store.get_profile(user_id).await {
            Ok(Some(profile)) => Ok(profile),
            Ok(None) => {
                info!(user_id, "Creating profile on first contact");
                self.store
                    .create_profile(user_id, display_name)
                    .await
                    .map_err(|e| {
                        warn!(user_id, error = %e, "Profile creation failed");
                        REPLY_SERVICE_FAILURE.to_string()
                    })
            }
            Err(e) => {
                warn!(user_id, error = %e, "Profile load failed");
                Err(REPLY_SERVICE_FAILURE.to_string())
            }
        }
    }

    /// Call the main model under the retry policy. Returns `None` when
    /// the attempt budget is exhausted without a non-empty reply.
    async fn request_with_retry(
        &self,
        instructions: String,
        history: Vec<ChatMessage>,
    ) -> Option<String> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage::system(instructions));
        messages.extend(history);

        let request = CompletionRequest::new(messages).with_max_tokens(self.max_reply_tokens);

        for attempt in 0..self.retry.max_attempts {
            match self.llm_main.complete(request.clone()).await {
                Ok(response) => {
                    if !response.content.trim().is_empty() {
                        return Some(response.content);
                    }
                    debug!(attempt, "Empty completion, retrying");
                    if attempt + 1 < self.retry.max_attempts {
                        tokio::time::sleep(self.retry.unit).await;
                    }
                }
                Err(LlmError::RateLimited { .. }) => {
                    let delay = self.retry.unit * 2u32.pow(attempt);
                    debug!(attempt, ?delay, "Rate limited, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(e @ LlmError::RequestFailed { .. }) => {
                    debug!(attempt, error = %e, "Transient inference failure");
                    if attempt + 1 < self.retry.max_attempts {
                        tokio::time::sleep(self.retry.unit * 2).await;
                    }
                }
                Err(e) => {
                    debug!(attempt, error = %e, "Inference attempt failed");
                }
            }
        }
        None
    }

    /// Apply at most one phase mutation for this turn.
    async fn evaluate_phase(
        &self,
        user_id: &str,
        profile: &UserProfile,
        new_sessions: i64,
        user_text: &str,
    ) {
        let recent = match self.store.recent_messages(user_id, PHASE_WINDOW).await {
            Ok(m) => m,
            Err(e) => {
                warn!(user_id, error = %e, "Phase window read failed");
                return;
            }
        };

        match phase::evaluate(profile.phase, new_sessions, user_text, &recent) {
            PhaseAction::Advance(next) => {
                info!(user_id, from = profile.phase.as_str(), to = next.as_str(), "Phase advanced");
                if let Err(e) = self.store.set_phase(user_id, next).await {
                    warn!(user_id, error = %e, "Phase write failed");
                }
            }
            PhaseAction::Reset { phase, sessions } => {
                info!(user_id, to = phase.as_str(), "Phase reset by user request");
                if let Err(e) = self
                    .store
                    .set_phase_and_sessions(user_id, phase, sessions)
                    .await
                {
                    warn!(user_id, error = %e, "Phase reset write failed");
                }
            }
            PhaseAction::Stay => {}
        }
    }
}

// ── Markdown stripping ──────────────────────────────────────────────

static MD_BOLD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*\*(.+?)\*\*").unwrap());
static MD_EM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*(.+?)\*").unwrap());
static MD_UNDERLINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"__(.+?)__").unwrap());
static MD_ITALIC: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"_(.+?)_").unwrap());
static MD_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`(.+?)`").unwrap());
static MD_HEADER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^#{1,6}\s+").unwrap());
static MD_RULE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^---+\s*$").unwrap());

/// Strip presentational markdown from a model reply before it is
/// persisted and delivered as plain chat text.
pub fn strip_markdown(text: &str) -> String {
    let text = MD_BOLD.replace_all(text, "$1");
    let text = MD_EM.replace_all(&text, "$1");
    let text = MD_UNDERLINE.replace_all(&text, "$1");
    let text = MD_ITALIC.replace_all(&text, "$1");
    let text = MD_CODE.replace_all(&text, "$1");
    let text = MD_HEADER.replace_all(&text, "");
    let text = MD_RULE.replace_all(&text, "");
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_bold_and_italic() {
        assert_eq!(strip_markdown("**жирный** и *курсив*"), "жирный и курсив");
        assert_eq!(strip_markdown("__так__ и _сяк_"), "так и сяк");
    }

    #[test]
    fn strip_code_and_headers() {
        assert_eq!(strip_markdown("`код`"), "код");
        assert_eq!(strip_markdown("## Заголовок\nтекст"), "Заголовок\nтекст");
    }

    #[test]
    fn strip_horizontal_rule() {
        assert_eq!(strip_markdown("до\n---\nпосле"), "до\n\nпосле");
    }

    #[test]
    fn plain_text_untouched() {
        assert_eq!(strip_markdown("обычный текст"), "обычный текст");
    }

    #[tokio::test]
    async fn user_locks_serialize_per_user() {
        let locks = UserLocks::new();

        let first = locks.acquire("1").await;
        // Same user: second acquire must wait until the first is dropped.
        let locks2 = locks.clone();
        let blocked = tokio::spawn(async move {
            let _g = locks2.acquire("1").await;
        });
        tokio::task::yield_now().await;
        assert!(!blocked.is_finished());

        // Different user proceeds immediately.
        let _other = locks.acquire("2").await;

        drop(first);
        blocked.await.unwrap();
    }
}
