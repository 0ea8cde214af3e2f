//! Streaming provider for the OpenAI Responses API.

use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use super::sse::{LineBuffer, StreamSink};
use super::{LlmError, ProviderEntry};
use crate::types::{LlmOutput, Message};

/// One event from the Responses streaming API. Only the fields the
/// gateway needs; everything else is ignored.
#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    delta: Option<String>,
    #[serde(default)]
    response: Option<ResponseEnvelope>,
}

#[derive(Debug, Deserialize)]
struct ResponseEnvelope {
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: i32,
    #[serde(default)]
    output_tokens: i32,
    #[serde(default)]
    total_tokens: i32,
}

fn request_body(model: &str, messages: &[Message]) -> serde_json::Value {
    let input: Vec<_> = messages
        .iter()
        .map(|m| json!({ "role": m.role, "content": m.content }))
        .collect();
    json!({ "model": model, "input": input, "stream": true })
}

/// Stream a completion, forwarding text-delta events to the sink and
/// accumulating the answer and usage counters into `out`.
pub(super) async fn stream(
    client: &reqwest::Client,
    base_url: &str,
    entry: &ProviderEntry,
    messages: &[Message],
    sink: &mut StreamSink,
    out: &mut LlmOutput,
) -> Result<(), LlmError> {
    let url = format!("{base_url}/v1/responses");
    let response = client
        .post(&url)
        .bearer_auth(&entry.api_key)
        .json(&request_body(&entry.model, messages))
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(LlmError::UpstreamStatus { status, body });
    }

    sink.open()?;

    let mut lines = LineBuffer::default();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        for line in lines.push(&chunk) {
            handle_line(&line, sink, out).await?;
        }
    }

    Ok(())
}

async fn handle_line(
    line: &str,
    sink: &mut StreamSink,
    out: &mut LlmOutput,
) -> Result<(), LlmError> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(());
    };

    let event: StreamEvent = match serde_json::from_str(data.trim()) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "skipping malformed upstream event");
            return Ok(());
        }
    };

    match event.kind.as_str() {
        "response.output_text.delta" => {
            sink.send(Bytes::from(format!("{line}\n\n"))).await?;
            if let Some(delta) = event.delta {
                out.text.push_str(&delta);
            }
        }
        "response.completed" => {
            // Usage arrives only on the final event; leave zeros otherwise.
            if let Some(usage) = event.response.and_then(|r| r.usage) {
                out.input_tokens = usage.input_tokens;
                out.output_tokens = usage.output_tokens;
                out.total_tokens = usage.total_tokens;
            }
        }
        _ => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Level, Role};

    fn entry() -> ProviderEntry {
        ProviderEntry {
            level: Level::Easy,
            model: "gpt-4o".into(),
            api_key: "test-key".into(),
            kind: super::super::ProviderKind::OpenAi,
        }
    }

    #[test]
    fn test_request_body_shape() {
        let messages = vec![Message { role: Role::User, content: "hi".into() }];
        let body = request_body(&entry().model, &messages);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream"], true);
        assert_eq!(body["input"][0]["role"], "user");
        assert_eq!(body["input"][0]["content"], "hi");
    }

    #[tokio::test]
    async fn test_delta_events_accumulate_and_forward() {
        let (mut sink, _ready, mut frames) = StreamSink::channel(8);
        let mut out = LlmOutput::default();

        let delta = r#"data: {"type":"response.output_text.delta","delta":"Par"}"#;
        handle_line(delta, &mut sink, &mut out).await.unwrap();
        let delta = r#"data: {"type":"response.output_text.delta","delta":"is."}"#;
        handle_line(delta, &mut sink, &mut out).await.unwrap();

        assert_eq!(out.text, "Paris.");
        let frame = frames.recv().await.unwrap();
        assert!(std::str::from_utf8(&frame).unwrap().contains("Par"));
    }

    #[tokio::test]
    async fn test_completed_event_records_usage() {
        let (mut sink, _ready, _frames) = StreamSink::channel(8);
        let mut out = LlmOutput::default();

        let completed = r#"data: {"type":"response.completed","response":{"usage":{"input_tokens":9,"output_tokens":3,"total_tokens":12}}}"#;
        handle_line(completed, &mut sink, &mut out).await.unwrap();

        assert_eq!(out.input_tokens, 9);
        assert_eq!(out.output_tokens, 3);
        assert_eq!(out.total_tokens, 12);
    }

    #[tokio::test]
    async fn test_malformed_event_is_skipped() {
        let (mut sink, _ready, _frames) = StreamSink::channel(8);
        let mut out = LlmOutput::default();

        handle_line("data: not-json", &mut sink, &mut out).await.unwrap();
        handle_line(": keep-alive comment", &mut sink, &mut out).await.unwrap();
        assert!(out.text.is_empty());
    }
}
