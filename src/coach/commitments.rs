//! Commitment extraction — background enrichment of the profile.
//!
//! After each coaching-mode reply, the pipeline queues the assistant text
//! here and returns immediately; a single spawned worker drains the queue
//! and makes one fast-tier LLM call per job. The queue is bounded so a
//! burst of turns cannot fan out into unbounded concurrent network calls.
//! Nothing on this path is ever surfaced to the user.

use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::coach::prompts;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::store::types::{Commitment, MAX_COMMITMENTS};
use crate::store::Store;

/// Max tokens for the extraction call.
const EXTRACTION_MAX_TOKENS: u32 = 200;
/// Queue capacity. Jobs past this are dropped with a warning.
pub const EXTRACTION_QUEUE_CAPACITY: usize = 64;

/// One unit of background work.
#[derive(Debug)]
pub struct ExtractionJob {
    pub user_id: String,
    pub assistant_text: String,
}

/// Handle the pipeline uses to submit jobs.
pub type ExtractionHandle = mpsc::Sender<ExtractionJob>;

/// Outcome of a single extraction call.
///
/// Explicit so tests can distinguish "the model said there is no
/// commitment" from "the response was garbage".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    /// A concrete commitment was found.
    Commitment(Commitment),
    /// The model answered `{"action": null}`.
    None,
    /// The call failed or the response was not valid JSON.
    Unparseable,
}

/// Raw shape of the extraction response.
#[derive(Debug, Deserialize)]
struct ExtractionResponse {
    action: Option<String>,
    #[serde(default)]
    deadline: Option<String>,
}

/// Commitment extractor — one auxiliary inference call per assistant reply.
pub struct CommitmentExtractor {
    store: Arc<dyn Store>,
    llm_fast: Arc<dyn LlmProvider>,
}

impl CommitmentExtractor {
    pub fn new(store: Arc<dyn Store>, llm_fast: Arc<dyn LlmProvider>) -> Self {
        Self { store, llm_fast }
    }

    /// Ask the model whether `assistant_text` contains a concrete
    /// commitment with a deadline.
    pub async fn extract(&self, assistant_text: &str) -> Extraction {
        let request = CompletionRequest::new(vec![ChatMessage::user(
            prompts::commitment_extraction(assistant_text),
        )])
        .with_max_tokens(EXTRACTION_MAX_TOKENS);

        let response = match self.llm_fast.complete(request).await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(error = %e, "Commitment extraction call failed");
                return Extraction::Unparseable;
            }
        };

        match serde_json::from_str::<ExtractionResponse>(response.content.trim()) {
            Ok(ExtractionResponse {
                action: Some(action),
                deadline,
            }) => Extraction::Commitment(Commitment { action, deadline }),
            Ok(ExtractionResponse { action: None, .. }) => Extraction::None,
            Err(e) => {
                tracing::debug!(error = %e, "Commitment extraction response unparseable");
                Extraction::Unparseable
            }
        }
    }

    /// Append a commitment to the profile, keeping the newest
    /// `MAX_COMMITMENTS` (FIFO eviction of the oldest).
    ///
    /// Re-reads the profile first so a turn processed while the
    /// extraction call was in flight is not clobbered. Best-effort, not
    /// transactional — the commitments list is eventually consistent.
    pub async fn apply(&self, user_id: &str, commitment: Commitment) {
        let profile = match self.store.get_profile(user_id).await {
            Ok(Some(p)) => p,
            Ok(None) => {
                tracing::warn!(user_id, "Commitment extracted for unknown profile");
                return;
            }
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Commitment apply: profile read failed");
                return;
            }
        };

        let mut commitments = profile.commitments;
        commitments.push(commitment);
        if commitments.len() > MAX_COMMITMENTS {
            let drop = commitments.len() - MAX_COMMITMENTS;
            commitments.drain(..drop);
        }

        if let Err(e) = self.store.set_commitments(user_id, &commitments).await {
            tracing::warn!(user_id, error = %e, "Commitment apply: write failed");
        }
    }

    /// Process one job end to end.
    async fn run_job(&self, job: ExtractionJob) {
        match self.extract(&job.assistant_text).await {
            Extraction::Commitment(commitment) => {
                tracing::info!(
                    user_id = %job.user_id,
                    action = %commitment.action,
                    "Commitment extracted"
                );
                self.apply(&job.user_id, commitment).await;
            }
            Extraction::None => {
                tracing::debug!(user_id = %job.user_id, "No commitment in reply");
            }
            Extraction::Unparseable => {
                tracing::debug!(user_id = %job.user_id, "Commitment extraction skipped");
            }
        }
    }
}

/// Create the bounded job queue.
pub fn extraction_queue() -> (ExtractionHandle, mpsc::Receiver<ExtractionJob>) {
    mpsc::channel(EXTRACTION_QUEUE_CAPACITY)
}

/// Spawn the extraction worker task.
///
/// A single consumer: jobs run sequentially, so concurrent background
/// network calls are bounded by construction. The worker exits when every
/// sender is dropped.
pub fn spawn_extraction_worker(
    extractor: CommitmentExtractor,
    mut rx: mpsc::Receiver<ExtractionJob>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            extractor.run_job(job).await;
        }
        tracing::debug!("Extraction worker stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::{CompletionResponse, FinishReason};
    use crate::store::LibSqlStore;
    use async_trait::async_trait;

    /// Provider that always returns the same canned text.
    struct CannedProvider(String);

    #[async_trait]
    impl LlmProvider for CannedProvider {
        fn model_name(&self) -> &str {
            "canned"
        }

        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            Ok(CompletionResponse {
                content: self.0.clone(),
                input_tokens: 1,
                output_tokens: 1,
                finish_reason: FinishReason::Stop,
            })
        }
    }

    async fn extractor_with(reply: &str) -> CommitmentExtractor {
        let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        CommitmentExtractor::new(store, Arc::new(CannedProvider(reply.to_string())))
    }

    #[tokio::test]
    async fn extracts_concrete_commitment() {
        let extractor =
            extractor_with(r#"{"action": "написать трём клиентам", "deadline": "до пятницы"}"#)
                .await;
        let result = extractor.extract("завтра напиши трём клиентам").await;
        assert_eq!(
            result,
            Extraction::Commitment(Commitment {
                action: "написать трём клиентам".to_string(),
                deadline: Some("до пятницы".to_string()),
            })
        );
    }

    #[tokio::test]
    async fn null_action_means_no_commitment() {
        let extractor = extractor_with(r#"{"action": null}"#).await;
        assert_eq!(extractor.extract("просто поговорили").await, Extraction::None);
    }

    #[tokio::test]
    async fn garbage_is_unparseable_not_an_error() {
        let extractor = extractor_with("извини, не могу ответить JSON").await;
        assert_eq!(
            extractor.extract("что-нибудь").await,
            Extraction::Unparseable
        );
    }

    #[tokio::test]
    async fn apply_keeps_newest_five() {
        let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        store.create_profile("1", "u").await.unwrap();
        let extractor = CommitmentExtractor::new(
            Arc::clone(&store),
            Arc::new(CannedProvider(String::new())),
        );

        for i in 0..7 {
            extractor
                .apply(
                    "1",
                    Commitment {
                        action: format!("дело {i}"),
                        deadline: None,
                    },
                )
                .await;
        }

        let profile = store.get_profile("1").await.unwrap().unwrap();
        assert_eq!(profile.commitments.len(), 5);
        // Oldest two evicted, newest five kept in order
        assert_eq!(profile.commitments[0].action, "дело 2");
        assert_eq!(profile.commitments[4].action, "дело 6");
    }

    #[tokio::test]
    async fn worker_processes_queued_job() {
        let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        store.create_profile("1", "u").await.unwrap();
        let extractor = CommitmentExtractor::new(
            Arc::clone(&store),
            Arc::new(CannedProvider(
                r#"{"action": "сделать звонок", "deadline": "сегодня"}"#.to_string(),
            )),
        );

        let (tx, rx) = extraction_queue();
        let handle = spawn_extraction_worker(extractor, rx);

        tx.send(ExtractionJob {
            user_id: "1".to_string(),
            assistant_text: "позвони сегодня".to_string(),
        })
        .await
        .unwrap();
        drop(tx);
        handle.await.unwrap();

        let profile = store.get_profile("1").await.unwrap().unwrap();
        assert_eq!(profile.commitments.len(), 1);
        assert_eq!(profile.commitments[0].action, "сделать звонок");
    }
}
