//! Environment configuration.
//!
//! Everything is read from the process environment exactly once at
//! startup. Rather than failing on the first missing variable, the
//! loader collects every problem and reports them in a single
//! `CallError::Config` so the operator fixes the whole set in one pass.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::CallError;

/// Which transport the tool dispatcher drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Real phone calls through a telephony carrier.
    Voice,
    /// Telegram text chat.
    Chat,
}

/// Telephony carrier selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhoneProvider {
    Twilio,
    Telnyx,
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,

    // ── Telephony ────────────────────────────────────────────────
    pub phone_provider: PhoneProvider,
    pub phone_account_id: String,
    pub phone_secret: String,
    pub phone_from_number: String,
    pub phone_to_number: String,
    /// Ed25519 public key (base64) for variant-B webhook verification.
    pub phone_webhook_public_key: Option<String>,

    // ── Speech services ──────────────────────────────────────────
    pub openai_api_key: String,
    pub deepgram_api_key: String,
    pub tts_voice: String,
    pub stt_model: String,
    pub eou_silence: Duration,
    pub transcript_timeout: Duration,

    // ── HTTP / tunnel ────────────────────────────────────────────
    pub port: u16,
    pub public_base_url: String,
    pub tunnel_provider: Option<String>,
    pub tunnel_auth_token: Option<String>,
    pub allow_unsigned_webhooks: bool,

    // ── Chat transport ───────────────────────────────────────────
    pub telegram_bot_token: String,
}

fn get(vars: &HashMap<String, String>, key: &str) -> Option<String> {
    vars.get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn require(vars: &HashMap<String, String>, missing: &mut Vec<String>, key: &str) -> String {
    match get(vars, key) {
        Some(v) => v,
        None => {
            missing.push(format!("{key} is not set"));
            String::new()
        }
    }
}

fn parse_u64(
    vars: &HashMap<String, String>,
    missing: &mut Vec<String>,
    key: &str,
    default: u64,
) -> u64 {
    match get(vars, key) {
        None => default,
        Some(raw) => match raw.parse::<u64>() {
            Ok(v) => v,
            Err(_) => {
                missing.push(format!("{key} must be an integer, got \"{raw}\""));
                default
            }
        },
    }
}

impl Config {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, CallError> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_map(&vars)
    }

    /// Load from an explicit map. Split out so tests can exercise the
    /// loader without touching the process environment.
    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self, CallError> {
        let mut missing: Vec<String> = Vec::new();

        let mode = match get(vars, "CALLCLAW_MODE").as_deref() {
            None | Some("voice") => Mode::Voice,
            Some("chat") => Mode::Chat,
            Some(other) => {
                missing.push(format!(
                    "CALLCLAW_MODE must be \"voice\" or \"chat\", got \"{other}\""
                ));
                Mode::Voice
            }
        };

        // Voice mode needs the whole telephony + speech stack; chat mode
        // only the bot token. Unused halves stay empty rather than failing.
        let mut phone_provider = PhoneProvider::Twilio;
        let mut phone_account_id = String::new();
        let mut phone_secret = String::new();
        let mut phone_from_number = String::new();
        let mut phone_to_number = String::new();
        let mut openai_api_key = String::new();
        let mut deepgram_api_key = String::new();
        let mut public_base_url = String::new();
        let mut telegram_bot_token = String::new();

        match mode {
            Mode::Voice => {
                phone_account_id = require(vars, &mut missing, "PHONE_ACCOUNT_ID");
                phone_secret = require(vars, &mut missing, "PHONE_SECRET");
                phone_from_number = require(vars, &mut missing, "PHONE_FROM_NUMBER");
                phone_to_number = require(vars, &mut missing, "PHONE_TO_NUMBER");
                openai_api_key = require(vars, &mut missing, "OPENAI_API_KEY");
                deepgram_api_key = require(vars, &mut missing, "DEEPGRAM_API_KEY");
                public_base_url = require(vars, &mut missing, "PUBLIC_BASE_URL")
                    .trim_end_matches('/')
                    .to_string();
                phone_provider = match get(vars, "PHONE_PROVIDER").as_deref() {
                    Some("twilio") | None => PhoneProvider::Twilio,
                    Some("telnyx") => PhoneProvider::Telnyx,
                    Some(other) => {
                        missing.push(format!(
                            "PHONE_PROVIDER must be \"twilio\" or \"telnyx\", got \"{other}\""
                        ));
                        PhoneProvider::Twilio
                    }
                };
                telegram_bot_token = get(vars, "TELEGRAM_BOT_TOKEN").unwrap_or_default();
            }
            Mode::Chat => {
                telegram_bot_token = require(vars, &mut missing, "TELEGRAM_BOT_TOKEN");
            }
        }

        let eou_silence =
            Duration::from_millis(parse_u64(vars, &mut missing, "EOU_SILENCE_MS", 800));
        let transcript_timeout =
            Duration::from_secs(parse_u64(vars, &mut missing, "TRANSCRIPT_TIMEOUT_SECS", 180));
        let port = parse_u64(vars, &mut missing, "PORT", 3333) as u16;

        let allow_unsigned_webhooks = matches!(
            get(vars, "ALLOW_UNSIGNED_WEBHOOKS").as_deref(),
            Some("1") | Some("true") | Some("yes")
        );

        if !missing.is_empty() {
            return Err(CallError::Config(missing));
        }

        Ok(Self {
            mode,
            phone_provider,
            phone_account_id,
            phone_secret,
            phone_from_number,
            phone_to_number,
            phone_webhook_public_key: get(vars, "PHONE_WEBHOOK_PUBLIC_KEY"),
            openai_api_key,
            deepgram_api_key,
            tts_voice: get(vars, "TTS_VOICE").unwrap_or_else(|| "alloy".to_string()),
            stt_model: get(vars, "STT_MODEL").unwrap_or_else(|| "nova-2".to_string()),
            eou_silence,
            transcript_timeout,
            port,
            public_base_url,
            tunnel_provider: get(vars, "TUNNEL_PROVIDER"),
            tunnel_auth_token: get(vars, "TUNNEL_AUTH_TOKEN"),
            allow_unsigned_webhooks,
            telegram_bot_token,
        })
    }

    /// Base URL of the media-stream WebSocket endpoint, with the
    /// scheme the carrier expects.
    pub fn media_stream_base(&self) -> String {
        let wss = self
            .public_base_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{wss}/media-stream")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voice_env() -> HashMap<String, String> {
        [
            ("PHONE_PROVIDER", "twilio"),
            ("PHONE_ACCOUNT_ID", "AC123"),
            ("PHONE_SECRET", "tok"),
            ("PHONE_FROM_NUMBER", "+15550001111"),
            ("PHONE_TO_NUMBER", "+15550002222"),
            ("OPENAI_API_KEY", "sk-test"),
            ("DEEPGRAM_API_KEY", "dg-test"),
            ("PUBLIC_BASE_URL", "https://example.ngrok.app"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn voice_config_loads_with_defaults() {
        let cfg = Config::from_map(&voice_env()).unwrap();
        assert_eq!(cfg.mode, Mode::Voice);
        assert_eq!(cfg.phone_provider, PhoneProvider::Twilio);
        assert_eq!(cfg.port, 3333);
        assert_eq!(cfg.tts_voice, "alloy");
        assert_eq!(cfg.stt_model, "nova-2");
        assert_eq!(cfg.eou_silence, Duration::from_millis(800));
        assert_eq!(cfg.transcript_timeout, Duration::from_secs(180));
        assert!(!cfg.allow_unsigned_webhooks);
    }

    #[test]
    fn missing_values_reported_together() {
        let mut env = voice_env();
        env.remove("PHONE_ACCOUNT_ID");
        env.remove("DEEPGRAM_API_KEY");
        let err = Config::from_map(&env).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("PHONE_ACCOUNT_ID"));
        assert!(msg.contains("DEEPGRAM_API_KEY"));
    }

    #[test]
    fn bad_numeric_value_is_a_config_error() {
        let mut env = voice_env();
        env.insert("TRANSCRIPT_TIMEOUT_SECS".into(), "soon".into());
        let err = Config::from_map(&env).unwrap_err();
        assert!(err.to_string().contains("TRANSCRIPT_TIMEOUT_SECS"));
    }

    #[test]
    fn chat_mode_only_needs_bot_token() {
        let env: HashMap<String, String> = [
            ("CALLCLAW_MODE", "chat"),
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let cfg = Config::from_map(&env).unwrap();
        assert_eq!(cfg.mode, Mode::Chat);
        assert_eq!(cfg.telegram_bot_token, "123:abc");
    }

    #[test]
    fn chat_mode_missing_token_fails() {
        let env: HashMap<String, String> =
            [("CALLCLAW_MODE".to_string(), "chat".to_string())].into();
        let err = Config::from_map(&env).unwrap_err();
        assert!(err.to_string().contains("TELEGRAM_BOT_TOKEN"));
    }

    #[test]
    fn media_stream_base_swaps_scheme() {
        let cfg = Config::from_map(&voice_env()).unwrap();
        assert_eq!(
            cfg.media_stream_base(),
            "wss://example.ngrok.app/media-stream"
        );
    }

    #[test]
    fn trailing_slash_stripped_from_base_url() {
        let mut env = voice_env();
        env.insert("PUBLIC_BASE_URL".into(), "https://x.example/".into());
        let cfg = Config::from_map(&env).unwrap();
        assert_eq!(cfg.public_base_url, "https://x.example");
    }

    #[test]
    fn telnyx_provider_selected() {
        let mut env = voice_env();
        env.insert("PHONE_PROVIDER".into(), "telnyx".into());
        let cfg = Config::from_map(&env).unwrap();
        assert_eq!(cfg.phone_provider, PhoneProvider::Telnyx);
    }

    #[test]
    fn unknown_provider_rejected() {
        let mut env = voice_env();
        env.insert("PHONE_PROVIDER".into(), "vonage".into());
        let err = Config::from_map(&env).unwrap_err();
        assert!(err.to_string().contains("PHONE_PROVIDER"));
    }
}
