//! Tiered LLM routing with SSE streaming.
//!
//! The router holds an ordered list of provider entries keyed by
//! [`Level`] and dispatches each request to the first entry matching the
//! query's tier. Providers stream server-sent events; every forwarded
//! frame is simultaneously accumulated into an [`LlmOutput`] so the
//! post-flight path has the full answer and usage counters without
//! re-reading the client stream.

mod gemini;
mod openai;
pub mod sse;

pub use sse::{LineBuffer, StreamSink};

use axum::http::StatusCode;
use tracing::{debug, info};

use crate::config::LlmConfig;
use crate::types::{Level, LlmOutput, Message};

/// Errors from LLM dispatch and streaming.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// No provider registered for the requested level; a configuration
    /// error, not a client error.
    #[error("no provider registered for level {0}")]
    NoProvider(Level),

    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream returned status {status}")]
    UpstreamStatus { status: StatusCode, body: String },

    /// The client side of the response stream went away.
    #[error("client stream closed")]
    StreamClosed,
}

/// Which wire protocol an entry speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Gemini,
}

/// One provider registration: a difficulty tier, the concrete model, and
/// the credentials to reach it.
#[derive(Debug, Clone)]
pub struct ProviderEntry {
    pub level: Level,
    pub model: String,
    pub api_key: String,
    pub kind: ProviderKind,
}

/// Level-keyed provider registry.
pub struct LlmRouter {
    client: reqwest::Client,
    entries: Vec<ProviderEntry>,
    openai_base_url: String,
    gemini_base_url: String,
}

impl LlmRouter {
    /// Build the default registry: a fast/cheap model for `easy` queries
    /// and a capable one for `high`.
    pub fn from_config(config: &LlmConfig) -> Self {
        let entries = vec![
            ProviderEntry {
                level: Level::Easy,
                model: config.easy_model.clone(),
                api_key: config.openai_api_key.clone(),
                kind: ProviderKind::OpenAi,
            },
            ProviderEntry {
                level: Level::High,
                model: config.high_model.clone(),
                api_key: config.gemini_api_key.clone(),
                kind: ProviderKind::Gemini,
            },
        ];
        info!(
            easy = %config.easy_model,
            high = %config.high_model,
            "llm router initialised"
        );

        Self {
            client: reqwest::Client::new(),
            entries,
            openai_base_url: config.openai_base_url.clone(),
            gemini_base_url: config.gemini_base_url.clone(),
        }
    }

    /// Stream a completion for `level` into `sink`, accumulating into
    /// `out`.
    ///
    /// On `Ok`, `out` carries the full answer text, any usage counters the
    /// provider reported, and the model/level that served the request. On
    /// `Err` the contents of `out` must not be used.
    pub async fn generate(
        &self,
        sink: &mut StreamSink,
        messages: &[Message],
        level: Level,
        out: &mut LlmOutput,
    ) -> Result<(), LlmError> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.level == level)
            .ok_or(LlmError::NoProvider(level))?;

        // No point opening an upstream stream nobody can read.
        if sink.is_closed() {
            return Err(LlmError::StreamClosed);
        }

        debug!(level = %level, model = %entry.model, "dispatching to provider");

        match entry.kind {
            ProviderKind::OpenAi => {
                openai::stream(&self.client, &self.openai_base_url, entry, messages, sink, out)
                    .await?
            }
            ProviderKind::Gemini => {
                gemini::stream(&self.client, &self.gemini_base_url, entry, messages, sink, out)
                    .await?
            }
        }

        out.model = entry.model.clone();
        out.level = entry.level;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;

    #[tokio::test]
    async fn test_unknown_level_is_a_config_error() {
        let router = LlmRouter::from_config(&GatewayConfig::default().llm);
        let (mut sink, _ready, _frames) = StreamSink::channel(4);
        let mut out = LlmOutput::default();

        let err = router
            .generate(&mut sink, &[], Level::Medium, &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::NoProvider(Level::Medium)));
    }

    #[test]
    fn test_registry_covers_both_tiers() {
        let router = LlmRouter::from_config(&GatewayConfig::default().llm);
        assert!(router.entries.iter().any(|e| e.level == Level::Easy));
        assert!(router.entries.iter().any(|e| e.level == Level::High));
    }
}
