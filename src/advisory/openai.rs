// =============================================================================
// OpenAI chat-completions annotator
// =============================================================================
//
// SECURITY: the key is sent only as a Bearer header and is redacted from
// `Debug`. Upstream error bodies are logged at debug level and never echoed
// to subscribers.
//
// The prompt carries only the most recent bars of each interval so that a
// year of daily data does not blow through the model's context.
// =============================================================================

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, instrument, warn};

use super::AdvisoryAnnotator;
use crate::error::FeedError;
use crate::market_data::Snapshot;
use crate::runtime_config::AdvisoryConfig;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

const SYSTEM_PROMPT: &str =
    "You are a trading assistant who helps traders analyze market data and provide trading signals.";

pub struct OpenAiAnnotator {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
    model: String,
    max_tokens: u32,
    temperature: f64,
    max_bars_per_interval: usize,
}

impl std::fmt::Debug for OpenAiAnnotator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiAnnotator")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f64,
}

impl OpenAiAnnotator {
    pub fn new(api_key: impl Into<String>, config: &AdvisoryConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build reqwest client for OpenAiAnnotator")?;

        debug!(model = %config.model, "OpenAiAnnotator initialised");

        Ok(Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            client,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            max_bars_per_interval: config.max_bars_per_interval,
        })
    }
}

#[async_trait]
impl AdvisoryAnnotator for OpenAiAnnotator {
    #[instrument(skip_all, name = "openai::annotate", fields(symbol = %snapshot.symbol))]
    async fn annotate(&self, snapshot: &Snapshot, context: &str) -> Result<String, FeedError> {
        let prompt = build_prompt(snapshot, context, self.max_bars_per_interval);
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FeedError::AnnotationUnavailable("openai: request timed out".into())
                } else {
                    FeedError::AnnotationUnavailable("openai: request failed".into())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(%status, "chat completion refused");
            debug!(body = %body, "chat completion error body");
            return Err(FeedError::AnnotationUnavailable(format!(
                "openai: HTTP {}",
                status.as_u16()
            )));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|_| FeedError::AnnotationUnavailable("openai: undecodable response".into()))?;

        extract_content(&body)
    }
}

/// Trim each interval to its most recent `max_bars` and render the user
/// prompt.
pub fn build_prompt(snapshot: &Snapshot, context: &str, max_bars: usize) -> String {
    let mut data = Map::new();
    for (interval, result) in snapshot.iter() {
        let bars = result.bars.bars();
        let recent = &bars[bars.len().saturating_sub(max_bars)..];
        data.insert(interval.as_str().to_string(), json!(recent));
    }
    let market_data =
        serde_json::to_string_pretty(&Value::Object(data)).unwrap_or_else(|_| "{}".to_string());

    format!(
        "Based on the following market data and additional information, provide a brief market \
signal (bullish, bearish, or neutral) with a short explanation with the entry or exit play.

Market Data for {symbol}:
{market_data}

Additional Information:
{context}

Please provide your analysis in the following format:
Pair: [Current Pair here]
Signal: [Your signal here (bullish/bearish/neutral)]
Explanation: [Your brief explanation here]
Entry Price: [Entry Price here]
",
        symbol = snapshot.symbol,
    )
}

/// Pull `choices[0].message.content` out of a completion body.
pub fn extract_content(body: &Value) -> Result<String, FeedError> {
    let text = body["choices"][0]["message"]["content"]
        .as_str()
        .map(str::trim)
        .unwrap_or_default();

    if text.is_empty() {
        return Err(FeedError::AnnotationUnavailable(
            "openai: completion carried no content".into(),
        ));
    }
    Ok(text.to_string())
}
