//! Context assembly — builds the LLM input from persisted state.

use std::sync::Arc;

use crate::coach::prompts;
use crate::error::StoreError;
use crate::llm::ChatMessage;
use crate::store::types::{MessageRole, UserProfile};
use crate::store::Store;

/// Sliding window of conversation history fed to the model.
const HISTORY_WINDOW: usize = 20;

/// Assembles `(instructions, history)` for an inference call.
///
/// Pure composition over already-persisted state: one store read for
/// patterns, one for messages. No mutation.
pub struct ContextAssembler {
    store: Arc<dyn Store>,
}

impl ContextAssembler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Build the instruction string and role-tagged history for `profile`.
    ///
    /// `soft_crisis` flags the turn for a gentler instruction payload
    /// (set by the crisis interceptor, never blocks the turn).
    pub async fn build(
        &self,
        profile: &UserProfile,
        soft_crisis: bool,
    ) -> Result<(String, Vec<ChatMessage>), StoreError> {
        let patterns = self.store.patterns_for_user(&profile.user_id).await?;
        let instructions = prompts::system_prompt(profile, &patterns, soft_crisis);

        let history = self
            .store
            .recent_messages(&profile.user_id, HISTORY_WINDOW)
            .await?
            .into_iter()
            .map(|m| match m.role {
                MessageRole::User => ChatMessage::user(m.content),
                MessageRole::Assistant => ChatMessage::assistant(m.content),
            })
            .collect();

        Ok((instructions, history))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Role;
    use crate::store::types::MessageRole;
    use crate::store::LibSqlStore;

    #[tokio::test]
    async fn build_maps_history_in_order() {
        let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let profile = store.create_profile("1", "Аня").await.unwrap();
        store
            .append_message("1", MessageRole::User, "привет")
            .await
            .unwrap();
        store
            .append_message("1", MessageRole::Assistant, "привет, с чем пришла?")
            .await
            .unwrap();

        let assembler = ContextAssembler::new(Arc::clone(&store));
        let (instructions, history) = assembler.build(&profile, false).await.unwrap();

        assert!(instructions.contains("AI-наставник"));
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[0].content, "привет");
        assert_eq!(history[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn build_surfaces_patterns_in_instructions() {
        let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let profile = store.create_profile("1", "Аня").await.unwrap();
        store
            .record_pattern("1", "no_time", "Отмазка 'нет времени'")
            .await
            .unwrap();

        let assembler = ContextAssembler::new(Arc::clone(&store));
        let (instructions, _) = assembler.build(&profile, false).await.unwrap();
        assert!(instructions.contains("Отмазка 'нет времени'"));
    }
}
