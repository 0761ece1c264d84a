//! Model client abstraction
//!
//! The engine never talks to a concrete provider. It drives whatever
//! implements [`ModelClient`], which may already embed retries, fallback
//! chains or rate limiting.

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A message in a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Request to generate a completion
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<usize>,
    pub stop: Vec<String>,
}

/// A streaming chunk from the model
#[derive(Debug, Clone)]
pub enum StreamChunk {
    Text(String),
    Done { usage: Option<Usage> },
    Error(String),
}

/// Token usage information
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl Usage {
    pub fn new(prompt_tokens: usize, completion_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Response from a completion request
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub usage: Usage,
    pub finish_reason: FinishReason,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Error,
}

/// Completion client consumed once per executor turn
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Client name, used in logs
    fn name(&self) -> &str;

    /// Generate a completion
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    /// Generate a streaming completion
    ///
    /// The default implementation performs a regular completion and yields
    /// it as a single text chunk.
    async fn complete_stream(
        &self,
        request: CompletionRequest,
    ) -> Result<BoxStream<'static, StreamChunk>> {
        let response = self.complete(request).await?;
        let chunks = vec![
            StreamChunk::Text(response.content),
            StreamChunk::Done {
                usage: Some(response.usage),
            },
        ];
        Ok(futures::stream::iter(chunks).boxed())
    }
}

/// Drain a completion stream into a single response
pub async fn collect_stream(
    mut stream: BoxStream<'static, StreamChunk>,
) -> Result<CompletionResponse> {
    let mut content = String::new();
    let mut usage = None;

    while let Some(chunk) = stream.next().await {
        match chunk {
            StreamChunk::Text(text) => content.push_str(&text),
            StreamChunk::Done { usage: u } => {
                usage = u;
                break;
            }
            StreamChunk::Error(e) => anyhow::bail!("stream error: {}", e),
        }
    }

    Ok(CompletionResponse {
        content,
        usage: usage.unwrap_or_default(),
        finish_reason: FinishReason::Stop,
    })
}

/// Per-token pricing for one model, in currency units per million tokens
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPricing {
    pub fn cost(&self, usage: &Usage) -> f64 {
        self.input_cost(usage.prompt_tokens)
            + usage.completion_tokens as f64 * self.output_per_million / 1_000_000.0
    }

    pub fn input_cost(&self, prompt_tokens: usize) -> f64 {
        prompt_tokens as f64 * self.input_per_million / 1_000_000.0
    }
}

/// Pricing data source used to compute estimated cost
pub trait PricingLookup: Send + Sync {
    fn pricing(&self, model: &str) -> Option<ModelPricing>;
}

/// Fixed pricing table
#[derive(Debug, Clone, Default)]
pub struct StaticPricing {
    models: HashMap<String, ModelPricing>,
}

impl StaticPricing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(
        mut self,
        model: impl Into<String>,
        input_per_million: f64,
        output_per_million: f64,
    ) -> Self {
        self.models.insert(
            model.into(),
            ModelPricing {
                input_per_million,
                output_per_million,
            },
        );
        self
    }
}

impl PricingLookup for StaticPricing {
    fn pricing(&self, model: &str) -> Option<ModelPricing> {
        if let Some(p) = self.models.get(model) {
            return Some(*p);
        }
        // provider/model references fall back to the bare model id
        model
            .rsplit_once('/')
            .and_then(|(_, bare)| self.models.get(bare).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl ModelClient for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
            let last = request.messages.last().map(|m| m.content.clone());
            Ok(CompletionResponse {
                content: last.unwrap_or_default(),
                usage: Usage::new(3, 4),
                finish_reason: FinishReason::Stop,
            })
        }
    }

    #[tokio::test]
    async fn default_stream_matches_completion() {
        let request = CompletionRequest {
            messages: vec![Message::user("hello")],
            model: "m".to_string(),
            temperature: None,
            max_tokens: None,
            stop: vec![],
        };
        let stream = Echo.complete_stream(request).await.unwrap();
        let response = collect_stream(stream).await.unwrap();
        assert_eq!(response.content, "hello");
        assert_eq!(response.usage.total_tokens, 7);
    }

    #[tokio::test]
    async fn stream_error_is_surfaced() {
        let stream = futures::stream::iter(vec![
            StreamChunk::Text("partial".to_string()),
            StreamChunk::Error("boom".to_string()),
        ])
        .boxed();
        let err = collect_stream(stream).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn static_pricing_resolves_provider_prefixed_models() {
        let pricing = StaticPricing::new().with_model("gpt-test", 2.0, 8.0);
        let p = pricing.pricing("openai/gpt-test").unwrap();
        let cost = p.cost(&Usage::new(1_000_000, 500_000));
        assert!((cost - 6.0).abs() < 1e-9);
        assert!(pricing.pricing("unknown").is_none());
    }
}
