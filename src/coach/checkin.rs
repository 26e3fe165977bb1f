//! Scheduled checkins — morning, evening, and weekly review.
//!
//! The trigger mechanism is a thin cron spawn; the body reuses the
//! context assembler and makes one fast-tier call per user with no retry
//! loop. Per-user failures are logged and skipped — a bad user never
//! aborts the batch. This path mutates nothing on the profile.

use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channels::Notifier;
use crate::coach::context::ContextAssembler;
use crate::coach::pipeline::UserLocks;
use crate::coach::prompts;
use crate::config::CheckinConfig;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::store::types::MessageRole;
use crate::store::Store;

/// Max tokens for a checkin message.
const CHECKIN_MAX_TOKENS: u32 = 200;
/// History tail included in the checkin call.
const CHECKIN_HISTORY_TAIL: usize = 6;

/// Which scheduled checkin is firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckinKind {
    Morning,
    Evening,
    Weekly,
}

impl CheckinKind {
    /// Tag prepended to the persisted assistant record.
    pub fn tag(self) -> &'static str {
        match self {
            CheckinKind::Morning => "morning_checkin",
            CheckinKind::Evening => "evening_checkin",
            CheckinKind::Weekly => "weekly_review",
        }
    }

    fn system_prompt(self) -> &'static str {
        match self {
            CheckinKind::Morning => prompts::MORNING_CHECKIN,
            CheckinKind::Evening => prompts::EVENING_CHECKIN,
            CheckinKind::Weekly => prompts::WEEKLY_REVIEW,
        }
    }
}

/// Runs checkin batches over all eligible users.
pub struct CheckinRunner {
    store: Arc<dyn Store>,
    llm_fast: Arc<dyn LlmProvider>,
    assembler: ContextAssembler,
    notifier: Arc<dyn Notifier>,
    /// Shared with the pipeline: a checkin send and a live turn for the
    /// same user must not interleave.
    locks: UserLocks,
    active_window_days: u32,
}

impl CheckinRunner {
    pub fn new(
        store: Arc<dyn Store>,
        llm_fast: Arc<dyn LlmProvider>,
        notifier: Arc<dyn Notifier>,
        locks: UserLocks,
        active_window_days: u32,
    ) -> Self {
        Self {
            assembler: ContextAssembler::new(Arc::clone(&store)),
            store,
            llm_fast,
            notifier,
            locks,
            active_window_days,
        }
    }

    /// Run one checkin batch. Returns the number of users reached.
    pub async fn run(&self, kind: CheckinKind) -> usize {
        let users = match self.store.active_users(self.active_window_days).await {
            Ok(u) => u,
            Err(e) => {
                warn!(error = %e, kind = kind.tag(), "Checkin batch: active user query failed");
                return 0;
            }
        };

        info!(kind = kind.tag(), eligible = users.len(), "Checkin batch starting");

        let mut sent = 0;
        for user in users {
            match self.send_one(kind, &user.user_id).await {
                Ok(()) => sent += 1,
                Err(e) => {
                    // Isolated per user: log and move on.
                    warn!(user_id = %user.user_id, kind = kind.tag(), error = %e, "Checkin skipped");
                }
            }
        }

        info!(kind = kind.tag(), sent, "Checkin batch complete");
        sent
    }

    async fn send_one(&self, kind: CheckinKind, user_id: &str) -> anyhow::Result<()> {
        let _guard = self.locks.acquire(user_id).await;

        let Some(profile) = self.store.get_profile(user_id).await? else {
            anyhow::bail!("profile disappeared");
        };

        let (_, history) = self.assembler.build(&profile, false).await?;
        let tail_start = history.len().saturating_sub(CHECKIN_HISTORY_TAIL);
        let mut messages = Vec::with_capacity(CHECKIN_HISTORY_TAIL + 2);
        messages.push(ChatMessage::system(format!(
            "{}{}",
            kind.system_prompt(),
            prompts::checkin_profile_suffix(&profile)
        )));
        if history.is_empty() {
            messages.push(ChatMessage::user("начни чек-ин"));
        } else {
            messages.extend_from_slice(&history[tail_start..]);
        }

        let request = CompletionRequest::new(messages).with_max_tokens(CHECKIN_MAX_TOKENS);
        let response = self.llm_fast.complete(request).await?;
        let text = response.content.trim();
        if text.is_empty() {
            anyhow::bail!("empty checkin completion");
        }

        self.notifier.notify(user_id, text).await?;
        self.store
            .append_message(
                user_id,
                MessageRole::Assistant,
                &format!("[{}] {}", kind.tag(), text),
            )
            .await?;

        debug!(user_id, kind = kind.tag(), "Checkin sent");
        Ok(())
    }
}

/// Spawn one scheduler task per checkin kind.
///
/// Each task sleeps until the next cron fire time (UTC) and runs the
/// batch. Invalid expressions disable that kind with an error log.
pub fn spawn_checkin_schedulers(
    runner: Arc<CheckinRunner>,
    config: &CheckinConfig,
) -> Vec<JoinHandle<()>> {
    let kinds = [
        (CheckinKind::Morning, config.morning_cron.clone()),
        (CheckinKind::Evening, config.evening_cron.clone()),
        (CheckinKind::Weekly, config.weekly_cron.clone()),
    ];

    let mut handles = Vec::new();
    for (kind, expr) in kinds {
        let schedule = match cron::Schedule::from_str(&expr) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(kind = kind.tag(), %expr, "Invalid cron expression: {e}");
                continue;
            }
        };

        let runner = Arc::clone(&runner);
        handles.push(tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    tracing::warn!(kind = kind.tag(), "Cron schedule exhausted");
                    return;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;
                runner.run(kind).await;
            }
        }));
    }
    handles
}
