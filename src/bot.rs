//! Main bot loop — merges channel streams and dispatches messages.
//!
//! Commands (`/start`, `/status`, ...) and mode-toggle phrases are
//! handled here against the store directly; everything else goes through
//! the message pipeline. Only explicit user actions ever change mode or
//! style — the pipeline never touches them.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tracing::{error, info};

use crate::channels::{Channel, IncomingMessage, OutgoingResponse, StatusUpdate};
use crate::coach::MessagePipeline;
use crate::error::Error;
use crate::store::types::{CoachingStyle, Mode, Phase};
use crate::store::Store;

const START_MESSAGE: &str = "Привет. Я — AI-наставник.\n\n\
Помогаю разобраться с тем, что реально мешает — в деньгах, отношениях, жизни в целом.\n\n\
⚠️ Важно: это инструмент коучинга, не психотерапия. \
При серьёзных психологических проблемах обратись к специалисту.\n\n\
Выбери стиль работы командой /style, а потом напиши, с чем хочешь разобраться.";

const HELP_MESSAGE: &str = "Команды:\n\
/start — начать заново\n\
/status — твой текущий прогресс\n\
/style — сменить стиль работы\n\
/patterns — паттерны, которые я заметил\n\
/reset — начать с чистого листа\n\
/help — эта справка\n\n\
Важно:\n\
• Отвечай честно — я замечаю уклонения\n\
• Каждый разговор заканчивается конкретным действием\n\
• Утром спрошу что планируешь, вечером — сделала ли";

const STYLE_OPTIONS: &str = "Выбери стиль работы:\n\
/style 1 — 🌿 Мягко, с поддержкой и теплом\n\
/style 2 — ⚖️ Сбалансировано, честно, но без давления\n\
/style 3 — 🔥 Жёстко, прямо, без сантиментов";

const NOT_STARTED: &str = "Напиши /start чтобы начать.";

/// Phrase on the reply keyboard that switches to support mode.
const SUPPORT_MODE_PHRASE: &str = "💬 Просто поболтать";
/// Phrase that switches back to coaching mode.
const COACHING_MODE_PHRASE: &str = "🎯 Вернуться к работе";

/// A parsed user command.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Start,
    Help,
    Status,
    Patterns,
    Reset,
    Style(Option<CoachingStyle>),
    SupportMode,
    CoachingMode,
}

/// Parse a command or mode-toggle phrase. Anything else is a
/// conversational turn.
fn parse_command(text: &str) -> Option<Command> {
    let trimmed = text.trim();
    match trimmed {
        "/start" => return Some(Command::Start),
        "/help" => return Some(Command::Help),
        "/status" => return Some(Command::Status),
        "/patterns" => return Some(Command::Patterns),
        "/reset" => return Some(Command::Reset),
        "/style" => return Some(Command::Style(None)),
        SUPPORT_MODE_PHRASE | "/chat" => return Some(Command::SupportMode),
        COACHING_MODE_PHRASE | "/work" => return Some(Command::CoachingMode),
        _ => {}
    }

    if let Some(arg) = trimmed.strip_prefix("/style ") {
        let style = match arg.trim() {
            "1" => Some(CoachingStyle::Soft),
            "2" => Some(CoachingStyle::Balanced),
            "3" => Some(CoachingStyle::Direct),
            _ => None,
        };
        return Some(Command::Style(style));
    }

    None
}

/// The coaching bot: channels in, pipeline or command handler, reply out.
pub struct CoachBot {
    store: Arc<dyn Store>,
    pipeline: Arc<MessagePipeline>,
    channels: HashMap<String, Arc<dyn Channel>>,
}

impl CoachBot {
    pub fn new(
        store: Arc<dyn Store>,
        pipeline: Arc<MessagePipeline>,
        channels: Vec<Arc<dyn Channel>>,
    ) -> Self {
        let channels = channels
            .into_iter()
            .map(|c| (c.name().to_string(), c))
            .collect();
        Self {
            store,
            pipeline,
            channels,
        }
    }

    /// Run the main loop until ctrl-c or all channel streams end.
    pub async fn run(self) -> Result<(), Error> {
        let mut streams = Vec::new();
        for channel in self.channels.values() {
            streams.push(channel.start().await?);
        }
        let mut merged = futures::stream::select_all(streams);

        info!("Coach bot ready and listening");

        loop {
            let message = tokio::select! {
                biased;
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl+C received, shutting down...");
                    break;
                }
                msg = merged.next() => {
                    match msg {
                        Some(m) => m,
                        None => {
                            info!("All channel streams ended, shutting down...");
                            break;
                        }
                    }
                }
            };

            let reply = self.handle_message(&message).await;
            if let Some(channel) = self.channels.get(&message.channel) {
                if let Err(e) = channel
                    .respond(&message, OutgoingResponse::text(reply))
                    .await
                {
                    error!(channel = %message.channel, "Failed to send reply: {e}");
                }
            }
        }

        for channel in self.channels.values() {
            let _ = channel.shutdown().await;
        }
        Ok(())
    }

    async fn handle_message(&self, message: &IncomingMessage) -> String {
        if let Some(command) = parse_command(&message.content) {
            return self.handle_command(command, message).await;
        }

        if let Some(channel) = self.channels.get(&message.channel) {
            let _ = channel
                .send_status(StatusUpdate::Thinking, &message.metadata)
                .await;
        }

        self.pipeline
            .process(&message.user_id, message.display_name(), &message.content)
            .await
    }

    async fn handle_command(&self, command: Command, message: &IncomingMessage) -> String {
        let user_id = &message.user_id;
        match command {
            Command::Start => {
                if let Err(e) = self
                    .store
                    .create_profile(user_id, message.display_name())
                    .await
                {
                    error!(%user_id, "Profile creation failed: {e}");
                }
                START_MESSAGE.to_string()
            }
            Command::Help => HELP_MESSAGE.to_string(),
            Command::Status => match self.store.get_profile(user_id).await {
                Ok(Some(profile)) => format!(
                    "Твой прогресс:\n\n\
                     Фаза: {}\n\
                     Цель: {}\n\
                     Дедлайн: {}\n\
                     Сессий: {}\n\
                     Стиль: {}",
                    profile.phase.label(),
                    profile.goal.as_deref().unwrap_or("не поставлена"),
                    profile.goal_deadline.as_deref().unwrap_or("не установлен"),
                    profile.sessions_count,
                    profile.style.label(),
                ),
                _ => NOT_STARTED.to_string(),
            },
            Command::Patterns => match self.store.patterns_for_user(user_id).await {
                Ok(patterns) if !patterns.is_empty() => {
                    let mut lines = vec!["Паттерны, которые я заметил:".to_string()];
                    for p in patterns.iter().take(5) {
                        lines.push(format!("• {} — встречалось {} раз", p.label, p.count));
                    }
                    lines.join("\n")
                }
                _ => "Паттерны ещё не выявлены. Продолжай работать.".to_string(),
            },
            Command::Reset => match self.store.get_profile(user_id).await {
                Ok(Some(_)) => {
                    if let Err(e) = self
                        .store
                        .set_phase_and_sessions(user_id, Phase::Onboarding, 0)
                        .await
                    {
                        error!(%user_id, "Reset failed: {e}");
                        return "Не получилось сбросить прогресс, попробуй ещё раз.".to_string();
                    }
                    "Начинаем с чистого листа. Расскажи, с чем хочешь разобраться.".to_string()
                }
                _ => NOT_STARTED.to_string(),
            },
            Command::Style(None) => STYLE_OPTIONS.to_string(),
            Command::Style(Some(style)) => {
                if let Err(e) = self
                    .store
                    .create_profile(user_id, message.display_name())
                    .await
                {
                    error!(%user_id, "Profile creation failed: {e}");
                }
                if let Err(e) = self.store.set_style(user_id, style).await {
                    error!(%user_id, "Style update failed: {e}");
                    return "Не получилось сменить стиль, попробуй ещё раз.".to_string();
                }
                let description = match style {
                    CoachingStyle::Soft => {
                        "Буду поддерживать, задавать мягкие вопросы и помогать тебе найти ответы самой."
                    }
                    CoachingStyle::Balanced => {
                        "Буду честным и прямым, но без давления. Поддержка и вызов в равных долях."
                    }
                    CoachingStyle::Direct => {
                        "Буду говорить прямо, называть вещи своими именами и не принимать отговорки."
                    }
                };
                format!(
                    "Выбран стиль: {}\n\n{}\n\nСтиль можно сменить в любой момент командой /style",
                    style.label(),
                    description
                )
            }
            Command::SupportMode => {
                if let Err(e) = self
                    .store
                    .create_profile(user_id, message.display_name())
                    .await
                {
                    error!(%user_id, "Profile creation failed: {e}");
                }
                if let Err(e) = self.store.set_mode(user_id, Mode::Support).await {
                    error!(%user_id, "Mode update failed: {e}");
                }
                "Переключила в режим поддержки. Расскажи, что у тебя на душе.".to_string()
            }
            Command::CoachingMode => {
                if let Err(e) = self.store.set_mode(user_id, Mode::Coaching).await {
                    error!(%user_id, "Mode update failed: {e}");
                }
                "Возвращаемся к работе. На чём остановились?".to_string()
            }
        }
    }
}
