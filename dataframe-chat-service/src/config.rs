use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, anyhow};
use chat_flow::{StreamGranularity, TurnSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAi,
    OpenRouter,
}

impl LlmProvider {
    pub fn default_model(self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "gpt-4o-mini",
            LlmProvider::OpenRouter => "openai/gpt-4o-mini",
        }
    }
}

impl FromStr for LlmProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(LlmProvider::OpenAi),
            "openrouter" => Ok(LlmProvider::OpenRouter),
            other => Err(anyhow!("unknown LLM provider {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            other => Err(anyhow!("unknown log format {other:?}")),
        }
    }
}

/// Configuration for the chat service, read once at start-up.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub port: u16,
    pub upload_dir: PathBuf,
    pub provider: LlmProvider,
    pub model: String,
    pub agent_max_turns: usize,
    pub agent_timeout: Option<Duration>,
    pub stream_delay: Duration,
    pub stream_granularity: StreamGranularity,
    pub event_capacity: usize,
    pub max_upload_bytes: usize,
    pub log_format: LogFormat,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            upload_dir: PathBuf::from("uploaded_files"),
            provider: LlmProvider::OpenAi,
            model: LlmProvider::OpenAi.default_model().to_string(),
            agent_max_turns: 8,
            agent_timeout: Some(Duration::from_secs(120)),
            stream_delay: Duration::ZERO,
            stream_granularity: StreamGranularity::Character,
            event_capacity: chat_flow::DEFAULT_EVENT_CAPACITY,
            max_upload_bytes: 10 * 1024 * 1024,
            log_format: LogFormat::Json,
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();

        let provider = match lookup("LLM_PROVIDER") {
            Some(value) => value.parse()?,
            None => defaults.provider,
        };
        let model = lookup("LLM_MODEL").unwrap_or_else(|| provider.default_model().to_string());

        let agent_timeout = match parse_var::<u64>(&lookup, "AGENT_TIMEOUT_SECS")? {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.agent_timeout,
        };

        let stream_granularity = match lookup("STREAM_GRANULARITY") {
            Some(value) => value.parse().map_err(|e: String| anyhow!(e))?,
            None => defaults.stream_granularity,
        };

        let log_format = match lookup("LOG_FORMAT") {
            Some(value) => value.parse()?,
            None => defaults.log_format,
        };

        Ok(Self {
            port: parse_var(&lookup, "PORT")?.unwrap_or(defaults.port),
            upload_dir: lookup("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.upload_dir),
            provider,
            model,
            agent_max_turns: parse_var(&lookup, "AGENT_MAX_TURNS")?
                .unwrap_or(defaults.agent_max_turns),
            agent_timeout,
            stream_delay: parse_var(&lookup, "STREAM_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.stream_delay),
            stream_granularity,
            event_capacity: parse_var(&lookup, "EVENT_CAPACITY")?
                .unwrap_or(defaults.event_capacity),
            max_upload_bytes: parse_var(&lookup, "MAX_UPLOAD_BYTES")?
                .unwrap_or(defaults.max_upload_bytes),
            log_format,
        })
    }

    pub fn turn_settings(&self) -> TurnSettings {
        TurnSettings {
            stream_delay: self.stream_delay,
            granularity: self.stream_granularity,
            agent_timeout: self.agent_timeout,
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .with_context(|| format!("invalid value {value:?} for {key}"))
        })
        .transpose()
}
