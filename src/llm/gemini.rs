//! Streaming provider for Gemini `streamGenerateContent`.

use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use super::sse::{LineBuffer, StreamSink};
use super::{LlmError, ProviderEntry};
use crate::types::{LlmOutput, Message, Role};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

/// Token counts, usually only present on the final chunk.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: i32,
    #[serde(default)]
    candidates_token_count: i32,
    #[serde(default)]
    total_token_count: i32,
}

/// Gemini uses `model` where the chat API says `assistant`.
fn gemini_role(role: Role) -> &'static str {
    match role {
        Role::Assistant => "model",
        Role::User => "user",
        Role::System => "system",
    }
}

fn request_body(messages: &[Message]) -> serde_json::Value {
    let contents: Vec<_> = messages
        .iter()
        .map(|m| {
            json!({
                "role": gemini_role(m.role),
                "parts": [{ "text": m.content }],
            })
        })
        .collect();
    json!({ "contents": contents })
}

/// Stream a completion. Every raw SSE line is forwarded verbatim; data
/// lines are additionally parsed for text parts and usage metadata.
pub(super) async fn stream(
    client: &reqwest::Client,
    base_url: &str,
    entry: &ProviderEntry,
    messages: &[Message],
    sink: &mut StreamSink,
    out: &mut LlmOutput,
) -> Result<(), LlmError> {
    let url = format!(
        "{base_url}/v1beta/models/{model}:streamGenerateContent?alt=sse",
        model = entry.model
    );
    let response = client
        .post(&url)
        .header("x-goog-api-key", &entry.api_key)
        .json(&request_body(messages))
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
            sink.send(Bytes::from(format!("{line}\n"))).await?;
            accumulate_line(&line, out);
        }
    }

    Ok(())
}

fn accumulate_line(line: &str, out: &mut LlmOutput) {
    let Some(data) = line.strip_prefix("data:") else {
        return;
    };

    let chunk: StreamChunk = match serde_json::from_str(data.trim()) {
        Ok(chunk) => chunk,
        Err(e) => {
            warn!(error = %e, "skipping malformed upstream event");
            return;
        }
    };

    if let Some(part) = chunk
        .candidates
        .first()
        .and_then(|c| c.content.as_ref())
        .and_then(|c| c.parts.first())
    {
        out.text.push_str(&part.text);
    }

    if let Some(usage) = chunk.usage_metadata {
        out.input_tokens = usage.prompt_token_count;
        out.output_tokens = usage.candidates_token_count;
        out.total_tokens = usage.total_token_count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_maps_assistant_to_model() {
        let messages = vec![
            Message { role: Role::User, content: "hi".into() },
            Message { role: Role::Assistant, content: "hello".into() },
            Message { role: Role::User, content: "again".into() },
        ];
        let body = request_body(&messages);
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["contents"][2]["parts"][0]["text"], "again");
    }

    #[test]
    fn test_accumulate_text_and_usage() {
        let mut out = LlmOutput::default();

        accumulate_line(
            r#"data: {"candidates":[{"content":{"parts":[{"text":"Par"}],"role":"model"}}]}"#,
            &mut out,
        );
        accumulate_line(
            r#"data: {"candidates":[{"content":{"parts":[{"text":"is."}],"role":"model"}}],"usageMetadata":{"promptTokenCount":8,"candidatesTokenCount":2,"totalTokenCount":10}}"#,
            &mut out,
        );

        assert_eq!(out.text, "Paris.");
        assert_eq!(out.input_tokens, 8);
        assert_eq!(out.output_tokens, 2);
        assert_eq!(out.total_tokens, 10);
    }

    #[test]
    fn test_accumulate_ignores_non_data_lines() {
        let mut out = LlmOutput::default();
        accumulate_line("", &mut out);
        accumulate_line(": comment", &mut out);
        accumulate_line("data: {broken", &mut out);
        assert!(out.text.is_empty());
        assert_eq!(out.total_tokens, 0);
    }
}
