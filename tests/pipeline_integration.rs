//! End-to-end pipeline tests over an in-memory store and a scripted
//! inference provider.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;

use nastavnik::coach::pipeline::{REPLY_EMPTY_INPUT, REPLY_SERVICE_FAILURE};
use nastavnik::coach::{
    CommitmentExtractor, MessagePipeline, RetryPolicy, extraction_queue, spawn_extraction_worker,
};
use nastavnik::error::LlmError;
use nastavnik::llm::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
use nastavnik::store::types::{MessageRole, Mode, Phase};
use nastavnik::store::{LibSqlStore, Store};

/// One scripted provider outcome.
#[derive(Debug, Clone)]
enum Outcome {
    Text(String),
    Empty,
    RateLimited,
    Transient,
    Auth,
}

/// Provider that plays back a script, then falls through to a default
/// reply. Records call count and (paused-clock) call times.
struct ScriptedProvider {
    script: Mutex<VecDeque<Outcome>>,
    default_reply: String,
    calls: AtomicUsize,
    call_times: Mutex<Vec<tokio::time::Instant>>,
}

impl ScriptedProvider {
    fn new(script: Vec<Outcome>, default_reply: &str) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            default_reply: default_reply.to_string(),
            calls: AtomicUsize::new(0),
            call_times: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn call_times(&self) -> Vec<tokio::time::Instant> {
        self.call_times.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.call_times.lock().unwrap().push(tokio::time::Instant::now());

        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Outcome::Text(self.default_reply.clone()));

        let text = match outcome {
            Outcome::Text(text) => text,
            Outcome::Empty => String::new(),
            Outcome::RateLimited => {
                return Err(LlmError::RateLimited {
                    provider: "scripted".to_string(),
                    retry_after: None,
                });
            }
            Outcome::Transient => {
                return Err(LlmError::RequestFailed {
                    provider: "scripted".to_string(),
                    reason: "connection reset".to_string(),
                });
            }
            Outcome::Auth => {
                return Err(LlmError::AuthFailed {
                    provider: "scripted".to_string(),
                });
            }
        };

        Ok(CompletionResponse {
            content: text,
            input_tokens: 10,
            output_tokens: 10,
            finish_reason: FinishReason::Stop,
        })
    }
}

struct Harness {
    store: Arc<dyn Store>,
    pipeline: MessagePipeline,
    main: Arc<ScriptedProvider>,
    fast: Arc<ScriptedProvider>,
    worker: JoinHandle<()>,
}

impl Harness {
    /// Drop the pipeline (closing the extraction queue) and wait for the
    /// background worker to drain.
    async fn drain_background(self) -> (Arc<dyn Store>, Arc<ScriptedProvider>) {
        drop(self.pipeline);
        self.worker.await.unwrap();
        (self.store, self.fast)
    }
}

/// Build a harness with the given main-provider script. The fast tier
/// answers every call with `{"action": null}` (and `[]` works for deep
/// scans too, but they only fire on every 5th session).
async fn harness(main_script: Vec<Outcome>) -> Harness {
    harness_with_fast(main_script, r#"{"action": null}"#).await
}

async fn harness_with_fast(main_script: Vec<Outcome>, fast_reply: &str) -> Harness {
    let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_memory().await.unwrap());
    let main = ScriptedProvider::new(main_script, "Хорошо. Что сделаешь сегодня?");
    let fast = ScriptedProvider::new(vec![], fast_reply);

    let (tx, rx) = extraction_queue();
    let extractor = CommitmentExtractor::new(
        Arc::clone(&store),
        fast.clone() as Arc<dyn LlmProvider>,
    );
    let worker = spawn_extraction_worker(extractor, rx);

    let pipeline = MessagePipeline::new(
        Arc::clone(&store),
        main.clone() as Arc<dyn LlmProvider>,
        fast.clone() as Arc<dyn LlmProvider>,
        tx,
    )
    .with_retry_policy(RetryPolicy {
        max_attempts: 5,
        unit: std::time::Duration::from_secs(1),
    });

    Harness {
        store,
        pipeline,
        main,
        fast,
        worker,
    }
}

// ── Input handling ──────────────────────────────────────────────────

#[tokio::test]
async fn blank_input_gets_fixed_prompt_and_mutates_nothing() {
    let h = harness(vec![]).await;

    let reply = h.pipeline.process("1", "Аня", "   ").await;
    assert_eq!(reply, REPLY_EMPTY_INPUT);

    // No profile created, no inference call made
    assert!(h.store.get_profile("1").await.unwrap().is_none());
    assert_eq!(h.main.calls(), 0);
}

// ── Scenario 1: first contact ───────────────────────────────────────

#[tokio::test]
async fn first_message_creates_profile_and_advances_to_diagnosis() {
    let h = harness(vec![Outcome::Text("Привет! С чем пришла?".to_string())]).await;

    let reply = h.pipeline.process("100", "Аня", "привет").await;
    assert_eq!(reply, "Привет! С чем пришла?");

    let profile = h.store.get_profile("100").await.unwrap().unwrap();
    assert_eq!(profile.name, "Аня");
    assert_eq!(profile.sessions_count, 1);
    // Threshold met; onboarding→diagnosis is exempt from the content gate
    assert_eq!(profile.phase, Phase::Diagnosis);

    // Both turns persisted in order
    let messages = h.store.recent_messages("100", 10).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[0].content, "привет");
    assert_eq!(messages[1].role, MessageRole::Assistant);
}

// ── Scenario 2: threshold met, content gate fails ───────────────────

#[tokio::test]
async fn content_gate_blocks_transition_without_keywords() {
    let h = harness(vec![]).await;
    h.store.create_profile("1", "u").await.unwrap();
    h.store
        .set_phase_and_sessions("1", Phase::Diagnosis, 3)
        .await
        .unwrap();

    h.pipeline.process("1", "u", "сегодня было спокойно").await;

    let profile = h.store.get_profile("1").await.unwrap().unwrap();
    assert_eq!(profile.sessions_count, 4);
    assert_eq!(profile.phase, Phase::Diagnosis);
}

#[tokio::test]
async fn content_gate_passes_with_keywords() {
    let h = harness(vec![]).await;
    h.store.create_profile("1", "u").await.unwrap();
    h.store
        .set_phase_and_sessions("1", Phase::Diagnosis, 3)
        .await
        .unwrap();

    h.pipeline
        .process("1", "u", "хочу конкретный результат, срок — март")
        .await;

    let profile = h.store.get_profile("1").await.unwrap().unwrap();
    assert_eq!(profile.sessions_count, 4);
    assert_eq!(profile.phase, Phase::Goal);
}

// ── Scenario 3: lexicon pattern detection ───────────────────────────

#[tokio::test]
async fn weak_commitment_detected_once_without_cross_firing() {
    let h = harness(vec![]).await;

    h.pipeline
        .process("1", "u", "попробую написать клиентам")
        .await;

    let patterns = h.store.patterns_for_user("1").await.unwrap();
    assert_eq!(patterns.len(), 1);
    assert_eq!(patterns[0].pattern_type, "weak_commitment");
    assert_eq!(patterns[0].count, 1);
}

#[tokio::test]
async fn repeated_scans_increment_across_turns_not_within_one() {
    let h = harness(vec![]).await;

    // Two triggers of the same type in one message: one increment
    h.pipeline
        .process("1", "u", "попробую, постараюсь успеть")
        .await;
    // Next turn triggers again: second increment
    h.pipeline.process("1", "u", "попробую ещё раз").await;

    let patterns = h.store.patterns_for_user("1").await.unwrap();
    let weak = patterns
        .iter()
        .find(|p| p.pattern_type == "weak_commitment")
        .unwrap();
    assert_eq!(weak.count, 2);
}

// ── Scenario 4: retry timing ────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn rate_limits_back_off_exponentially_then_succeed() {
    let h = harness(vec![
        Outcome::RateLimited,
        Outcome::RateLimited,
        Outcome::Text("готово".to_string()),
    ])
    .await;

    let reply = h.pipeline.process("1", "u", "привет").await;
    assert_eq!(reply, "готово");
    assert_eq!(h.main.calls(), 3);

    // Delays of 1 then 2 time units between the three calls
    let times = h.main.call_times();
    assert_eq!(times[1] - times[0], std::time::Duration::from_secs(1));
    assert_eq!(times[2] - times[1], std::time::Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn transient_errors_use_fixed_backoff() {
    let h = harness(vec![
        Outcome::Transient,
        Outcome::Text("готово".to_string()),
    ])
    .await;

    let reply = h.pipeline.process("1", "u", "привет").await;
    assert_eq!(reply, "готово");

    let times = h.main.call_times();
    assert_eq!(times[1] - times[0], std::time::Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn empty_success_retries_with_unit_backoff() {
    let h = harness(vec![Outcome::Empty, Outcome::Text("готово".to_string())]).await;

    let reply = h.pipeline.process("1", "u", "привет").await;
    assert_eq!(reply, "готово");

    let times = h.main.call_times();
    assert_eq!(times[1] - times[0], std::time::Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn exhausted_attempts_degrade_to_failure_reply() {
    let h = harness(vec![
        Outcome::Transient,
        Outcome::Transient,
        Outcome::Transient,
        Outcome::Transient,
        Outcome::Transient,
    ])
    .await;

    let reply = h.pipeline.process("1", "u", "привет").await;
    assert_eq!(reply, REPLY_SERVICE_FAILURE);
    assert_eq!(h.main.calls(), 5);

    // User turn persisted, but no assistant turn
    let messages = h.store.recent_messages("1", 10).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, MessageRole::User);

    // A failed turn doesn't count as a session
    let profile = h.store.get_profile("1").await.unwrap().unwrap();
    assert_eq!(profile.sessions_count, 0);
}

#[tokio::test(start_paused = true)]
async fn other_errors_consume_attempts_without_backoff() {
    let h = harness(vec![Outcome::Auth, Outcome::Text("готово".to_string())]).await;

    let reply = h.pipeline.process("1", "u", "привет").await;
    assert_eq!(reply, "готово");

    let times = h.main.call_times();
    assert_eq!(times[1] - times[0], std::time::Duration::ZERO);
}

// ── Scenario 5: support mode ────────────────────────────────────────

#[tokio::test]
async fn support_mode_skips_all_coaching_bookkeeping() {
    let h = harness(vec![Outcome::Text("Понимаю тебя.".to_string())]).await;
    h.store.create_profile("1", "u").await.unwrap();
    h.store
        .set_phase_and_sessions("1", Phase::Goal, 6)
        .await
        .unwrap();
    h.store.set_mode("1", Mode::Support).await.unwrap();

    let reply = h
        .pipeline
        .process("1", "u", "хочу просто поговорить, результат не важен")
        .await;
    assert_eq!(reply, "Понимаю тебя.");

    let profile = h.store.get_profile("1").await.unwrap().unwrap();
    // No session increment, no phase evaluation
    assert_eq!(profile.sessions_count, 6);
    assert_eq!(profile.phase, Phase::Goal);

    // Both turns still persisted
    let messages = h.store.recent_messages("1", 10).await.unwrap();
    assert_eq!(messages.len(), 2);

    // No background extraction launched
    let (store, fast) = h.drain_background().await;
    assert_eq!(fast.calls(), 0);
    let profile = store.get_profile("1").await.unwrap().unwrap();
    assert!(profile.commitments.is_empty());
}

#[tokio::test]
async fn coaching_mode_launches_extraction() {
    let h = harness_with_fast(
        vec![Outcome::Text("Напиши трём клиентам до пятницы.".to_string())],
        r#"{"action": "написать трём клиентам", "deadline": "до пятницы"}"#,
    )
    .await;

    h.pipeline.process("1", "u", "что мне делать?").await;

    let (store, fast) = h.drain_background().await;
    assert_eq!(fast.calls(), 1);
    let profile = store.get_profile("1").await.unwrap().unwrap();
    assert_eq!(profile.commitments.len(), 1);
    assert_eq!(profile.commitments[0].action, "написать трём клиентам");
}

// ── Scenario 6: reset phrase ────────────────────────────────────────

#[tokio::test]
async fn reset_phrase_rewinds_to_diagnosis() {
    let h = harness(vec![]).await;
    h.store.create_profile("1", "u").await.unwrap();
    h.store
        .set_phase_and_sessions("1", Phase::Planning, 11)
        .await
        .unwrap();

    h.pipeline.process("1", "u", "хочу новую цель").await;

    let profile = h.store.get_profile("1").await.unwrap().unwrap();
    assert_eq!(profile.phase, Phase::Diagnosis);
    assert_eq!(profile.sessions_count, 2);
}

// ── Crisis interception ─────────────────────────────────────────────

#[tokio::test]
async fn hard_crisis_short_circuits_before_persistence_and_inference() {
    let h = harness(vec![]).await;

    let reply = h.pipeline.process("1", "Аня", "я больше не хочу жить").await;
    assert!(reply.contains("психологической помощи"));

    // No inference call, no message record, no session
    assert_eq!(h.main.calls(), 0);
    let messages = h.store.recent_messages("1", 10).await.unwrap();
    assert!(messages.is_empty());
    let profile = h.store.get_profile("1").await.unwrap().unwrap();
    assert_eq!(profile.sessions_count, 0);
}

#[tokio::test]
async fn soft_crisis_proceeds_normally() {
    let h = harness(vec![Outcome::Text("Я рядом. Расскажи.".to_string())]).await;

    let reply = h.pipeline.process("1", "u", "сил больше нет, всё навалилось").await;
    assert_eq!(reply, "Я рядом. Расскажи.");

    assert_eq!(h.main.calls(), 1);
    let profile = h.store.get_profile("1").await.unwrap().unwrap();
    assert_eq!(profile.sessions_count, 1);
}

// ── Markdown stripping on the reply path ────────────────────────────

#[tokio::test]
async fn assistant_reply_is_stripped_before_persistence() {
    let h = harness(vec![Outcome::Text(
        "**Главное**: сделай _первый_ шаг".to_string(),
    )])
    .await;

    let reply = h.pipeline.process("1", "u", "с чего начать?").await;
    assert_eq!(reply, "Главное: сделай первый шаг");

    let messages = h.store.recent_messages("1", 10).await.unwrap();
    assert_eq!(messages.last().unwrap().content, "Главное: сделай первый шаг");
}

// ── Phase never regresses, never skips ──────────────────────────────

#[tokio::test]
async fn phase_only_moves_forward_one_step_at_a_time() {
    let h = harness(vec![]).await;
    h.store.create_profile("1", "u").await.unwrap();
    h.store
        .set_phase_and_sessions("1", Phase::Goal, 5)
        .await
        .unwrap();

    // Session 6 with planning keywords: goal → planning, not further
    h.pipeline
        .process("1", "u", "давай план: какие шаги и с чего начать")
        .await;
    let profile = h.store.get_profile("1").await.unwrap().unwrap();
    assert_eq!(profile.phase, Phase::Planning);

    // A quiet turn afterwards must not regress anything
    h.pipeline.process("1", "u", "ладно").await;
    let profile = h.store.get_profile("1").await.unwrap().unwrap();
    assert_eq!(profile.phase, Phase::Planning);
}

// ── Per-user serialization ──────────────────────────────────────────

#[tokio::test]
async fn concurrent_turns_for_one_user_are_serialized() {
    let h = harness(vec![]).await;
    let pipeline = Arc::new(h.pipeline);

    let mut handles = Vec::new();
    for i in 0..8 {
        let p = Arc::clone(&pipeline);
        handles.push(tokio::spawn(async move {
            p.process("1", "u", &format!("сообщение {i}")).await
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // Serialized read-modify-write: every turn counted exactly once
    let profile = h.store.get_profile("1").await.unwrap().unwrap();
    assert_eq!(profile.sessions_count, 8);
}
