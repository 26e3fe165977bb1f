use std::sync::Arc;

use nastavnik::bot::CoachBot;
use nastavnik::channels::{Channel, CliChannel, Notifier, TelegramChannel};
use nastavnik::coach::{
    CheckinRunner, CommitmentExtractor, MessagePipeline, extraction_queue,
    spawn_checkin_schedulers, spawn_extraction_worker,
};
use nastavnik::config::CoachConfig;
use nastavnik::error::ChannelError;
use nastavnik::llm::{LlmConfig, ModelTier, create_provider};
use nastavnik::store::{LibSqlStore, Store};
use nastavnik::transcribe::Transcriber;

/// Notifier used when Telegram is disabled: logs and drops.
struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, user_id: &str, text: &str) -> Result<(), ChannelError> {
        tracing::info!(user_id, text, "Checkin (no delivery channel)");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = CoachConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export ANTHROPIC_API_KEY=sk-ant-...");
        std::process::exit(1);
    });

    // Tracing: rolling files when a log dir is configured, stderr otherwise.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _log_guard = if let Some(ref dir) = config.log_dir {
        let appender = tracing_appender::rolling::daily(dir, "nastavnik.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(writer)
            .with_ansi(false)
            .with_target(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
        None
    };

    eprintln!("🧭 Nastavnik v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model (main): {}", config.model_main);
    eprintln!("   Model (fast): {}", config.model_fast);
    eprintln!("   Database: {}", config.db_path.display());

    // ── LLM providers ───────────────────────────────────────────────
    let llm_config = LlmConfig {
        api_key: config.anthropic_api_key.clone(),
        model_main: config.model_main.clone(),
        model_fast: config.model_fast.clone(),
    };
    let llm_main = create_provider(&llm_config, ModelTier::Main);
    let llm_fast = create_provider(&llm_config, ModelTier::Fast);

    // ── Store ───────────────────────────────────────────────────────
    let store: Arc<dyn Store> = Arc::new(
        LibSqlStore::new_local(&config.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {e}",
                    config.db_path.display()
                );
                std::process::exit(1);
            }),
    );

    // ── Background commitment extraction ────────────────────────────
    let (extraction_tx, extraction_rx) = extraction_queue();
    let extractor = CommitmentExtractor::new(Arc::clone(&store), llm_fast.clone());
    let _extraction_handle = spawn_extraction_worker(extractor, extraction_rx);

    // ── Pipeline ────────────────────────────────────────────────────
    let pipeline = Arc::new(
        MessagePipeline::new(
            Arc::clone(&store),
            llm_main,
            llm_fast.clone(),
            extraction_tx,
        )
        .with_max_reply_tokens(config.max_reply_tokens),
    );

    // ── Channels ────────────────────────────────────────────────────
    let transcriber = config
        .openai_api_key
        .clone()
        .map(|key| Arc::new(Transcriber::new(key)));

    let mut channels: Vec<Arc<dyn Channel>> = vec![Arc::new(CliChannel::new())];
    let mut active_channels = vec!["cli"];

    let telegram = config.telegram_token.clone().map(|token| {
        Arc::new(TelegramChannel::new(
            token,
            config.telegram_allowed_users.clone(),
            transcriber.clone(),
        ))
    });
    if let Some(ref tg) = telegram {
        eprintln!(
            "   Telegram: enabled (allowed: {}, voice: {})",
            if config.telegram_allowed_users.iter().any(|u| u == "*") {
                "everyone".to_string()
            } else {
                config.telegram_allowed_users.join(", ")
            },
            if transcriber.is_some() { "on" } else { "off" },
        );
        channels.push(Arc::clone(tg) as Arc<dyn Channel>);
        active_channels.push("telegram");
    }
    eprintln!("   Channels: {}\n", active_channels.join(", "));

    // ── Scheduled checkins ──────────────────────────────────────────
    let _checkin_handles = if config.checkins.enabled {
        let notifier: Arc<dyn Notifier> = match telegram {
            Some(ref tg) => Arc::clone(tg) as Arc<dyn Notifier>,
            None => Arc::new(LogNotifier),
        };
        let runner = Arc::new(CheckinRunner::new(
            Arc::clone(&store),
            llm_fast,
            notifier,
            pipeline.locks(),
            config.checkins.active_window_days,
        ));
        eprintln!(
            "   Checkins: enabled (morning '{}', evening '{}', weekly '{}')",
            config.checkins.morning_cron, config.checkins.evening_cron, config.checkins.weekly_cron,
        );
        spawn_checkin_schedulers(runner, &config.checkins)
    } else {
        eprintln!("   Checkins: disabled");
        Vec::new()
    };

    // ── Main loop ───────────────────────────────────────────────────
    let bot = CoachBot::new(store, pipeline, channels);
    bot.run().await?;

    Ok(())
}
