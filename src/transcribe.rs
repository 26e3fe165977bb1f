//! Speech-to-text boundary — OpenAI Whisper over HTTP.
//!
//! The pipeline never sees audio: the Telegram channel feeds voice bytes
//! through here and emits the transcript as a normal text turn.

use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::ChannelError;

const TRANSCRIPTION_URL: &str = "https://api.openai.com/v1/audio/transcriptions";
const WHISPER_MODEL: &str = "whisper-1";

/// Whisper transcription client.
pub struct Transcriber {
    client: reqwest::Client,
    api_key: SecretString,
    /// Language hint passed to the model.
    language: String,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

impl Transcriber {
    pub fn new(api_key: SecretString) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            language: "ru".to_string(),
        }
    }

    /// Transcribe raw audio bytes into text.
    pub async fn transcribe(
        &self,
        audio: Vec<u8>,
        file_name: &str,
    ) -> Result<String, ChannelError> {
        let part = Part::bytes(audio)
            .file_name(file_name.to_string())
            .mime_str("audio/ogg")
            .map_err(|e| ChannelError::Transcription(format!("bad audio part: {e}")))?;

        let form = Form::new()
            .text("model", WHISPER_MODEL)
            .text("language", self.language.clone())
            .part("file", part);

        let resp = self
            .client
            .post(TRANSCRIPTION_URL)
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .multipart(form)
            .send()
            .await
            .map_err(|e| ChannelError::Transcription(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ChannelError::Transcription(format!("HTTP {status}: {body}")));
        }

        let parsed: TranscriptionResponse = resp
            .json()
            .await
            .map_err(|e| ChannelError::Transcription(format!("bad response: {e}")))?;

        Ok(parsed.text)
    }
}
