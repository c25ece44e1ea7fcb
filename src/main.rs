//! CallClaw — lets a coding assistant hold a real phone call (or a
//! Telegram chat) with a human operator.
//!
//! The assistant drives the process over stdio JSON-RPC tools; this
//! binary wires those tools to either the voice stack (carrier +
//! synthesis + recognition + media gateway) or the chat stack,
//! depending on configuration.

mod audio;
mod carrier;
mod chat;
mod config;
mod dispatcher;
mod error;
mod gateway;
mod session;
mod stt;
mod tts;

use std::sync::Arc;

use anyhow::Context;

use crate::chat::ChatEngine;
use crate::config::{Config, Mode, PhoneProvider};
use crate::dispatcher::VoiceToolBackend;
use crate::session::engine::EngineSettings;
use crate::session::SessionEngine;
use crate::stt::SttConfig;
use crate::tts::TtsClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout belongs to the JSON-RPC transport; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("callclaw=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env().context("startup configuration")?;

    match config.mode {
        Mode::Voice => run_voice(config).await,
        Mode::Chat => run_chat(config).await,
    }
}

async fn run_voice(config: Config) -> anyhow::Result<()> {
    let carrier = carrier::build_adapter(&config);
    tracing::info!(
        provider = carrier.name(),
        public_base_url = %config.public_base_url,
        "Starting in voice mode"
    );

    let settings = EngineSettings {
        to_number: config.phone_to_number.clone(),
        from_number: config.phone_from_number.clone(),
        public_base_url: config.public_base_url.clone(),
        media_stream_base: config.media_stream_base(),
        transcript_timeout: config.transcript_timeout,
        require_stream_sid: matches!(config.phone_provider, PhoneProvider::Telnyx),
    };
    let engine = Arc::new(SessionEngine::new(
        carrier,
        TtsClient::new(config.openai_api_key.clone(), config.tts_voice.clone()),
        SttConfig::new(
            config.deepgram_api_key.clone(),
            config.stt_model.clone(),
            config.eou_silence,
        ),
        settings,
    ));

    let state = gateway::AppState {
        engine: Arc::clone(&engine),
        public_base_url: config.public_base_url.clone(),
        allow_unsigned_webhooks: config.allow_unsigned_webhooks,
    };
    let port = config.port;
    tokio::spawn(async move {
        // Webhooks cannot land without the listener; losing it is fatal.
        if let Err(e) = gateway::serve(state, port).await {
            tracing::error!(error = %e, "Gateway failed");
            std::process::exit(1);
        }
    });

    let backend = VoiceToolBackend::new(engine);
    dispatcher::run(
        &backend,
        tokio::io::BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await
}

async fn run_chat(config: Config) -> anyhow::Result<()> {
    tracing::info!("Starting in chat mode");
    let engine = Arc::new(ChatEngine::new(
        &config.telegram_bot_token,
        config.transcript_timeout,
    ));
    engine.start_background_poll().await;

    dispatcher::run(
        &engine,
        tokio::io::BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await
}
