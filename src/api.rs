use crate::history::ChatTurn;
use crate::models::{ModelConfig, Role};
use anyhow::{Context, Result};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{stream, Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;

// Alias for the fragment stream a provider returns
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

// Trait defining the interface for text generation backends
#[async_trait]
pub trait LLMApiProvider: Send + Sync {
    // Returns a stream of content deltas for the given alternating turns.
    async fn send_chat_stream_request(
        &self,
        config: &ModelConfig,
        api_key: &str,
        turns: &[ChatTurn],
    ) -> Result<DeltaStream>;
}

// --- OpenAI Compatible Provider Implementation ---

#[derive(Serialize, Debug)]
struct OpenAIRequestBody {
    model: String,
    messages: Vec<OpenAIMessage>,
    stream: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct OpenAIMessage {
    role: String,
    content: String,
}

// Response structure for STREAMING chunks
#[derive(Deserialize, Debug)]
struct OpenAIStreamChunk {
    choices: Vec<OpenAIStreamChoice>,
}

#[derive(Deserialize, Debug)]
struct OpenAIStreamChoice {
    delta: OpenAIStreamDelta,
}

#[derive(Deserialize, Debug, Clone)]
struct OpenAIStreamDelta {
    content: Option<String>,
}

pub struct OpenAICompatibleProvider {
    client: Client,
}

impl OpenAICompatibleProvider {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    fn get_model_name(&self, config: &ModelConfig) -> Result<String> {
        let options = provider_options(config)?;
        options["model"]
            .as_str()
            .map(|s| s.to_string())
            .context("Missing or invalid 'model' field in provider_options")
    }
}

impl Default for OpenAICompatibleProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn provider_options(config: &ModelConfig) -> Result<serde_json::Value> {
    let options_json = config.provider_options.as_deref().unwrap_or("{}");
    serde_json::from_str(options_json).context("Failed to parse provider_options JSON")
}

/// Decodes one SSE data payload. `Ok(None)` means "nothing to emit".
fn decode_event_data(event_data: &str) -> Result<Option<String>> {
    let event_data = event_data.trim();
    if event_data == "[DONE]" {
        log::info!("Stream finished with [DONE]");
        return Ok(None);
    }

    match serde_json::from_str::<OpenAIStreamChunk>(event_data) {
        Ok(chunk) => Ok(chunk
            .choices
            .first()
            .and_then(|choice| choice.delta.content.clone())
            .filter(|content| !content.is_empty())),
        Err(e) => match serde_json::from_str::<serde_json::Value>(event_data) {
            Ok(json_value) if json_value.get("type").and_then(|t| t.as_str()) == Some("ping") => {
                log::debug!("Received stream ping event, skipping.");
                Ok(None)
            }
            Ok(_) => {
                log::warn!("Valid JSON but not a stream chunk: {} - Data: {}", e, event_data);
                Err(anyhow::Error::from(e)
                    .context(format!("Parsed as JSON but not a valid OpenAIStreamChunk: {}", event_data)))
            }
            Err(_) => {
                log::warn!("Failed to parse stream chunk as JSON: {} - Data: {}", e, event_data);
                Err(anyhow::Error::from(e)
                    .context(format!("Failed to parse stream chunk as JSON: {}", event_data)))
            }
        },
    }
}

#[async_trait]
impl LLMApiProvider for OpenAICompatibleProvider {
    async fn send_chat_stream_request(
        &self,
        config: &ModelConfig,
        api_key: &str,
        turns: &[ChatTurn],
    ) -> Result<DeltaStream> {
        let model_name = self.get_model_name(config)?;
        log::info!(
            "Sending STREAM request to OpenAI compatible API: {} using model: {}",
            config.api_url,
            model_name
        );

        let mut api_messages = vec![OpenAIMessage {
            role: "system".to_string(),
            content: format!("You are {}.", config.name),
        }];
        api_messages.extend(turns.iter().map(|turn| OpenAIMessage {
            role: turn.role.as_str().to_string(),
            content: turn.content.clone(),
        }));

        let request_body = OpenAIRequestBody {
            model: model_name,
            messages: api_messages,
            stream: true,
        };

        let request_url = format!("{}/chat/completions", config.api_url.trim_end_matches('/'));

        let response = self
            .client
            .post(&request_url)
            .bearer_auth(api_key)
            .json(&request_body)
            .send()
            .await
            .context("Failed to send stream request to OpenAI API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "<Failed to read error body>".to_string());
            log::error!("OpenAI API stream request failed with status {}: {}", status, error_body);
            return Err(anyhow::anyhow!(
                "API stream request failed with status {}: {}",
                status,
                error_body
            ));
        }

        let delta_stream = response
            .bytes_stream()
            .eventsource()
            .map(|event_result| -> Result<Option<String>> {
                let event = event_result.context("Error reading stream event")?;
                decode_event_data(&event.data)
            })
            .filter_map(|result| async move {
                match result {
                    Ok(Some(content)) => Some(Ok(content)),
                    Ok(None) => None,
                    Err(e) => {
                        log::error!("Error processing stream chunk: {:?}", e);
                        Some(Err(e))
                    }
                }
            });

        Ok(Box::pin(delta_stream))
    }
}

// --- Echo Provider ---

/// Offline stand-in for a model: answers "You said: <prompt>" one word at a time.
pub struct EchoProvider {
    delay: Duration,
}

impl EchoProvider {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl LLMApiProvider for EchoProvider {
    async fn send_chat_stream_request(
        &self,
        _config: &ModelConfig,
        _api_key: &str,
        turns: &[ChatTurn],
    ) -> Result<DeltaStream> {
        let prompt = turns
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map(|t| t.content.trim())
            .filter(|c| !c.is_empty())
            .unwrap_or("(no content)");
        let reply = format!("You said: {}", prompt);

        let words: Vec<String> = reply
            .split_inclusive(' ')
            .map(|w| w.to_string())
            .collect();
        let delay = self.delay;
        let deltas = stream::iter(words).then(move |word| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok::<String, anyhow::Error>(word)
        });
        Ok(Box::pin(deltas))
    }
}
