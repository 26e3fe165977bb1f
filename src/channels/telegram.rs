//! Telegram channel — long-polls the Bot API for updates.
//!
//! Text messages pass straight through; voice messages are downloaded
//! and transcribed before they enter the stream, so downstream consumers
//! only ever see text. Also implements `Notifier` for out-of-band
//! checkin delivery (private chats: chat id equals user id).

use std::sync::Arc;

use async_trait::async_trait;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::channels::{
    Channel, IncomingMessage, MessageStream, Notifier, OutgoingResponse, StatusUpdate,
};
use crate::error::ChannelError;
use crate::transcribe::Transcriber;

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Reply when a voice message cannot be transcribed.
const VOICE_FAILURE_REPLY: &str =
    "Не смогла распознать голосовое. Попробуй ещё раз или напиши текстом.";

/// Telegram channel — connects to the Bot API via long-polling.
pub struct TelegramChannel {
    bot_token: String,
    allowed_users: Vec<String>,
    client: reqwest::Client,
    transcriber: Option<Arc<Transcriber>>,
}

impl TelegramChannel {
    pub fn new(
        bot_token: String,
        allowed_users: Vec<String>,
        transcriber: Option<Arc<Transcriber>>,
    ) -> Self {
        Self {
            bot_token,
            allowed_users,
            client: reqwest::Client::new(),
            transcriber,
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{method}", self.bot_token)
    }

    /// Check if a username is in the allowed list.
    pub fn is_user_allowed(&self, username: &str) -> bool {
        self.allowed_users.iter().any(|u| u == "*" || u == username)
    }

    /// Send a text message, trying Markdown first with plain text fallback.
    /// Splits long messages that exceed Telegram's 4096 char limit.
    pub async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        for chunk in split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH) {
            self.send_message_chunk(chat_id, &chunk).await?;
        }
        Ok(())
    }

    /// Send a single message chunk (≤4096 chars), Markdown-first with fallback.
    async fn send_message_chunk(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        let markdown_body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown"
        });

        let markdown_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&markdown_body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        if markdown_resp.status().is_success() {
            return Ok(());
        }

        let markdown_status = markdown_resp.status();
        tracing::warn!(
            status = ?markdown_status,
            "Telegram sendMessage with Markdown failed; retrying without parse_mode"
        );

        let plain_body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });
        let plain_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&plain_body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        if !plain_resp.status().is_success() {
            let plain_err = plain_resp.text().await.unwrap_or_default();
            return Err(ChannelError::SendFailed {
                name: "telegram".into(),
                reason: format!(
                    "sendMessage failed (markdown: {}, plain: {})",
                    markdown_status, plain_err
                ),
            });
        }

        Ok(())
    }
}

/// Download a voice file and transcribe it. Errors bubble up so the
/// poller can reply with the canned voice-failure text.
async fn transcribe_voice(
    client: &reqwest::Client,
    bot_token: &str,
    transcriber: &Transcriber,
    file_id: &str,
) -> anyhow::Result<String> {
    // getFile resolves the file_id to a downloadable path.
    let resp: serde_json::Value = client
        .post(format!("https://api.telegram.org/bot{bot_token}/getFile"))
        .json(&serde_json::json!({"file_id": file_id}))
        .send()
        .await?
        .json()
        .await?;

    let file_path = resp
        .get("result")
        .and_then(|r| r.get("file_path"))
        .and_then(|p| p.as_str())
        .ok_or_else(|| anyhow::anyhow!("getFile returned no file_path"))?;

    let bytes = client
        .get(format!(
            "https://api.telegram.org/file/bot{bot_token}/{file_path}"
        ))
        .send()
        .await?
        .bytes()
        .await?;

    let text = transcriber.transcribe(bytes.to_vec(), "voice.ogg").await?;
    Ok(text)
}

// ── Channel trait implementation ────────────────────────────────────

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn start(&self) -> Result<MessageStream, ChannelError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let bot_token = self.bot_token.clone();
        let allowed_users = self.allowed_users.clone();
        let client = self.client.clone();
        let transcriber = self.transcriber.clone();

        tokio::spawn(async move {
            let mut offset: i64 = 0;

            tracing::info!("Telegram channel listening for messages...");

            loop {
                let url = format!("https://api.telegram.org/bot{}/getUpdates", bot_token);
                let body = serde_json::json!({
                    "offset": offset,
                    "timeout": 30,
                    "allowed_updates": ["message"]
                });

                let resp = match client.post(&url).json(&body).send().await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!("Telegram poll error: {e}");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        continue;
                    }
                };

                let data: serde_json::Value = match resp.json().await {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::warn!("Telegram parse error: {e}");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        continue;
                    }
                };

                let Some(results) = data.get("result").and_then(serde_json::Value::as_array)
                else {
                    continue;
                };

                for update in results {
                    if let Some(uid) = update.get("update_id").and_then(serde_json::Value::as_i64)
                    {
                        offset = uid + 1;
                    }

                    let Some(message) = update.get("message") else {
                        continue;
                    };

                    let username = message
                        .get("from")
                        .and_then(|f| f.get("username"))
                        .and_then(|u| u.as_str())
                        .unwrap_or("unknown");

                    let user_id_str = message
                        .get("from")
                        .and_then(|f| f.get("id"))
                        .and_then(serde_json::Value::as_i64)
                        .map(|id| id.to_string());

                    // Check allowlist against both username and numeric id
                    let is_allowed = {
                        let mut identities = vec![username];
                        if let Some(ref id) = user_id_str {
                            identities.push(id.as_str());
                        }
                        check_user_allowed(&allowed_users, identities.iter().copied())
                    };

                    if !is_allowed {
                        tracing::warn!(
                            "Telegram: ignoring message from unauthorized user: \
                             username={username}, user_id={}",
                            user_id_str.as_deref().unwrap_or("unknown")
                        );
                        continue;
                    }

                    let chat_id = message
                        .get("chat")
                        .and_then(|c| c.get("id"))
                        .and_then(serde_json::Value::as_i64)
                        .map(|id| id.to_string())
                        .unwrap_or_default();

                    let first_name = message
                        .get("from")
                        .and_then(|f| f.get("first_name"))
                        .and_then(|n| n.as_str())
                        .map(String::from);

                    // Voice messages go through the transcriber; failures
                    // get an apologetic reply and never reach the stream.
                    let mut is_voice = false;
                    let text = if let Some(text) =
                        message.get("text").and_then(serde_json::Value::as_str)
                    {
                        text.to_string()
                    } else if let Some(file_id) = message
                        .get("voice")
                        .and_then(|v| v.get("file_id"))
                        .and_then(|f| f.as_str())
                    {
                        let Some(ref transcriber) = transcriber else {
                            tracing::debug!("Voice message ignored: transcription disabled");
                            continue;
                        };
                        match transcribe_voice(&client, &bot_token, transcriber, file_id).await {
                            Ok(text) => {
                                is_voice = true;
                                text
                            }
                            Err(e) => {
                                tracing::warn!("Voice transcription failed: {e}");
                                let _ = client
                                    .post(format!(
                                        "https://api.telegram.org/bot{bot_token}/sendMessage"
                                    ))
                                    .json(&serde_json::json!({
                                        "chat_id": chat_id,
                                        "text": VOICE_FAILURE_REPLY,
                                    }))
                                    .send()
                                    .await;
                                continue;
                            }
                        }
                    } else {
                        continue;
                    };

                    let mut incoming = IncomingMessage::new(
                        "telegram",
                        user_id_str.as_deref().unwrap_or(username),
                        text,
                    )
                    .with_metadata(serde_json::json!({
                        "chat_id": chat_id,
                        "username": username,
                        "voice": is_voice,
                    }));
                    if let Some(name) = first_name.as_deref().or(Some(username)) {
                        incoming = incoming.with_user_name(name);
                    }

                    if tx.send(incoming).is_err() {
                        tracing::info!("Telegram listener channel closed");
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn respond(
        &self,
        msg: &IncomingMessage,
        response: OutgoingResponse,
    ) -> Result<(), ChannelError> {
        let chat_id = msg
            .metadata
            .get("chat_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ChannelError::SendFailed {
                name: "telegram".into(),
                reason: "No chat_id in message metadata".into(),
            })?;

        // Voice turns echo the transcript above the reply.
        let content = if msg.metadata.get("voice").and_then(|v| v.as_bool()) == Some(true) {
            format!("🎤 _{}_\n\n{}", msg.content, response.content)
        } else {
            response.content
        };

        self.send_message(chat_id, &content).await
    }

    async fn send_status(
        &self,
        status: StatusUpdate,
        metadata: &serde_json::Value,
    ) -> Result<(), ChannelError> {
        if let Some(chat_id) = metadata.get("chat_id").and_then(|v| v.as_str()) {
            match status {
                StatusUpdate::Thinking => {
                    let _ = self
                        .client
                        .post(self.api_url("sendChatAction"))
                        .json(&serde_json::json!({
                            "chat_id": chat_id,
                            "action": "typing"
                        }))
                        .send()
                        .await;
                }
                StatusUpdate::Status(ref msg) if !msg.is_empty() => {
                    let _ = self.send_message(chat_id, &format!("ℹ️ {msg}")).await;
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        tracing::info!("Telegram channel shutting down");
        Ok(())
    }
}

#[async_trait]
impl Notifier for TelegramChannel {
    async fn notify(&self, user_id: &str, text: &str) -> Result<(), ChannelError> {
        // Private chats: the chat id is the user id.
        self.send_message(user_id, text).await
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Check if any identity in the iterator matches the allowed users list.
fn check_user_allowed<'a>(
    allowed_users: &[String],
    identities: impl IntoIterator<Item = &'a str>,
) -> bool {
    let ids: Vec<&str> = identities.into_iter().collect();
    allowed_users
        .iter()
        .any(|u| u == "*" || ids.contains(&u.as_str()))
}

/// Split a message into chunks that fit Telegram's character limit.
/// Tries to split on newlines, then spaces, then hard-cuts.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        // Find a good split point at a char boundary
        let mut end = max_len;
        while end > 0 && !remaining.is_char_boundary(end) {
            end -= 1;
        }
        let chunk = &remaining[..end];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .unwrap_or(end);

        // Don't split at position 0 (infinite loop guard)
        let split_at = if split_at == 0 { end } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telegram_channel_name() {
        let ch = TelegramChannel::new("fake-token".into(), vec!["*".into()], None);
        assert_eq!(ch.name(), "telegram");
    }

    #[test]
    fn telegram_api_url() {
        let ch = TelegramChannel::new("123:ABC".into(), vec![], None);
        assert_eq!(
            ch.api_url("getMe"),
            "https://api.telegram.org/bot123:ABC/getMe"
        );
    }

    #[test]
    fn telegram_user_allowed_wildcard() {
        let ch = TelegramChannel::new("t".into(), vec!["*".into()], None);
        assert!(ch.is_user_allowed("anyone"));
    }

    #[test]
    fn telegram_user_allowed_specific() {
        let ch = TelegramChannel::new("t".into(), vec!["alice".into(), "bob".into()], None);
        assert!(ch.is_user_allowed("alice"));
        assert!(!ch.is_user_allowed("eve"));
    }

    #[test]
    fn telegram_user_denied_empty() {
        let ch = TelegramChannel::new("t".into(), vec![], None);
        assert!(!ch.is_user_allowed("anyone"));
    }

    #[test]
    fn telegram_user_exact_match_not_substring() {
        let ch = TelegramChannel::new("t".into(), vec!["alice".into()], None);
        assert!(!ch.is_user_allowed("alice_bot"));
        assert!(!ch.is_user_allowed("malice"));
    }

    #[test]
    fn allowlist_matches_numeric_id_identity() {
        assert!(check_user_allowed(
            &["123456789".to_string()],
            ["unknown", "123456789"]
        ));
        assert!(!check_user_allowed(
            &["alice".to_string(), "987654321".to_string()],
            ["unknown", "123456789"]
        ));
    }

    #[test]
    fn split_short_message_untouched() {
        let chunks = split_message("короткое сообщение", 4096);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn split_long_message_on_whitespace() {
        let text = "слово ".repeat(1000);
        let chunks = split_message(&text, 100);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.len() <= 100));
    }

    #[test]
    fn split_handles_multibyte_boundaries() {
        // Cyrillic is two bytes per char; naive slicing would panic.
        let text = "я".repeat(300);
        let chunks = split_message(&text, 100);
        assert!(chunks.iter().all(|c| c.len() <= 100));
        assert_eq!(chunks.concat().chars().count(), 300);
    }
}
