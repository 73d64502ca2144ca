use crate::models::ModelConfig;
use crate::reconciler::ReconcilerSettings;
use anyhow::{Context, Result};
use keyring::Entry;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// --- Application Settings ---

const ENV_PREFIX: &str = "STREAMCHAT_";

pub const PROVIDER_ECHO: &str = "echo";
pub const PROVIDER_OPENAI_COMPATIBLE: &str = "openai_compatible";

/// Runtime settings, read from `STREAMCHAT_*` environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_path: PathBuf,
    /// Identity every command runs as.
    pub owner: String,
    pub history_limit: usize,
    pub match_window: Duration,
    pub placeholder_window: Duration,
    pub broadcast_capacity: usize,
    /// Pause between words of the echo provider.
    pub echo_delay: Duration,
    pub model: ModelConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("streamchat.db"),
            owner: "local".to_string(),
            history_limit: 20,
            match_window: Duration::from_secs(10),
            placeholder_window: Duration::from_secs(10),
            broadcast_capacity: 256,
            echo_delay: Duration::from_millis(40),
            model: ModelConfig {
                name: "Echo".to_string(),
                provider: PROVIDER_ECHO.to_string(),
                api_url: "https://api.openai.com/v1".to_string(),
                api_key_ref: None,
                provider_options: None,
            },
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from any `NAME -> value` lookup; `NAME` excludes the prefix.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, name))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut settings = Settings::default();

        if let Some(path) = get("DATABASE_PATH") {
            settings.database_path = PathBuf::from(path);
        }
        if let Some(owner) = get("OWNER") {
            settings.owner = owner;
        }
        if let Some(v) = get("HISTORY_LIMIT") {
            settings.history_limit = parse_var("HISTORY_LIMIT", &v)?;
        }
        if let Some(v) = get("MATCH_WINDOW_SECS") {
            settings.match_window = Duration::from_secs(parse_var("MATCH_WINDOW_SECS", &v)?);
        }
        if let Some(v) = get("PLACEHOLDER_WINDOW_SECS") {
            settings.placeholder_window =
                Duration::from_secs(parse_var("PLACEHOLDER_WINDOW_SECS", &v)?);
        }
        if let Some(v) = get("BROADCAST_CAPACITY") {
            settings.broadcast_capacity = parse_var("BROADCAST_CAPACITY", &v)?;
        }
        if let Some(v) = get("ECHO_DELAY_MS") {
            settings.echo_delay = Duration::from_millis(parse_var("ECHO_DELAY_MS", &v)?);
        }

        if let Some(provider) = get("PROVIDER") {
            match provider.as_str() {
                PROVIDER_ECHO | PROVIDER_OPENAI_COMPATIBLE => settings.model.provider = provider,
                other => anyhow::bail!("Unsupported provider '{}'", other),
            }
        }
        if let Some(url) = get("API_URL") {
            settings.model.api_url = url;
        }
        if let Some(model) = get("MODEL") {
            settings.model.provider_options = Some(serde_json::json!({ "model": model }).to_string());
            if settings.model.provider != PROVIDER_ECHO {
                settings.model.name = model;
            }
        }
        settings.model.api_key_ref = get("API_KEY_REF");

        if settings.model.provider == PROVIDER_OPENAI_COMPATIBLE
            && settings.model.provider_options.is_none()
        {
            anyhow::bail!("{}MODEL must be set for the openai_compatible provider", ENV_PREFIX);
        }
        if settings.history_limit == 0 {
            anyhow::bail!("{}HISTORY_LIMIT must be at least 1", ENV_PREFIX);
        }
        Ok(settings)
    }

    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            match_window: to_chrono(self.match_window),
            placeholder_window: to_chrono(self.placeholder_window),
        }
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("Invalid value for {}{}: '{}'", ENV_PREFIX, name, value))
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

// --- API Key Retrieval ---

const KEYRING_SERVICE_PREFIX: &str = "streamchat_api_key";

/// Retrieves the API key for a given model configuration.
/// It checks the `api_key_ref` field to determine whether to read from
/// environment variables or the OS keyring.
pub fn get_api_key(config: &ModelConfig) -> Result<String> {
    match config.api_key_ref.as_deref() {
        Some(ref_str) if ref_str.starts_with("env:") => {
            let env_var_name = ref_str.trim_start_matches("env:");
            log::debug!("Retrieving API key from environment variable: {}", env_var_name);
            std::env::var(env_var_name).context(format!(
                "Failed to get API key from environment variable '{}'",
                env_var_name
            ))
        }
        Some(ref_str) if ref_str == "keyring" => {
            let service_name = format!("{}-{}", KEYRING_SERVICE_PREFIX, config.provider);
            let entry = Entry::new(&service_name, &config.name) // Use config name as "username"
                .context("Failed to create keyring entry")?;
            log::debug!("Retrieving API key from keyring for service: {}", service_name);
            entry.get_password().context(format!(
                "Failed to get API key from keyring for '{}'",
                config.name
            ))
        }
        Some(other) => Err(anyhow::anyhow!("Unsupported api_key_ref format: {}", other)),
        // Local providers need no key
        None if config.provider == PROVIDER_ECHO => Ok(String::new()),
        None => Err(anyhow::anyhow!(
            "API key reference not set for model config '{}'",
            config.name
        )),
    }
}
