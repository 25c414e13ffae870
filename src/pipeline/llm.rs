//! Chat-model interaction: one streamed completion per chunk.
//!
//! [`ChatModel`] is the seam between the run loop and the network. The
//! built-in [`OpenAiCompatibleModel`] posts to `{base_url}/chat/completions`
//! with `stream: true` and turns the server-sent events into a
//! [`DeltaStream`]: `reasoning_content` deltas become
//! [`Delta::Reasoning`], `content` deltas [`Delta::Answer`], and the final
//! usage block [`Delta::Usage`].
//!
//! There is no retry here. A failed chat call ends the run; re-sending a
//! half-streamed chunk would duplicate answer text.

use crate::config::GenerationConfig;
use crate::error::CaseGenError;
use crate::output::TokenUsage;
use crate::prompts::build_user_message;
use crate::stream::{Delta, DeltaStream};
use futures::future::BoxFuture;
use eventsource_stream::{EventStream, Eventsource};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;
use std::time::Duration;
use tokio_stream::Stream;
use tracing::{debug, warn};

/// Everything the model needs to answer one chunk.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// 1-indexed chunk number, for error messages.
    pub chunk_num: usize,
    pub industry: String,
    pub content: String,
    pub output_type: String,
    pub design_methods: Vec<String>,
    pub instruction: String,
}

impl ChatRequest {
    pub fn from_config(config: &GenerationConfig, chunk_num: usize, content: &str) -> Self {
        Self {
            chunk_num,
            industry: config.industry.clone(),
            content: content.to_string(),
            output_type: config.output_type.clone(),
            design_methods: config.design_methods.clone(),
            instruction: config.instruction_text().to_string(),
        }
    }

    /// The single user message sent for this chunk.
    pub fn user_message(&self) -> String {
        build_user_message(
            &self.industry,
            &self.content,
            &self.output_type,
            &self.design_methods,
            &self.instruction,
        )
    }
}

/// A language model that answers a [`ChatRequest`] with a delta stream.
pub trait ChatModel: Send + Sync {
    /// Model identifier for logs.
    fn name(&self) -> &str;

    /// Start a streamed completion. Errors before the first delta are
    /// returned here; errors mid-stream arrive as stream items.
    fn stream_chat<'a>(
        &'a self,
        request: &'a ChatRequest,
    ) -> BoxFuture<'a, Result<DeltaStream, CaseGenError>>;
}

// ── OpenAI-compatible SSE client ─────────────────────────────────────────

/// Streaming client for OpenAI-compatible `chat/completions` endpoints
/// (DeepSeek, OpenAI, vLLM, Ollama's OpenAI shim…).
pub struct OpenAiCompatibleModel {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    max_tokens: usize,
}

impl OpenAiCompatibleModel {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        model: impl Into<String>,
        max_tokens: usize,
        timeout_secs: u64,
    ) -> Result<Self, CaseGenError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| CaseGenError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: chat_endpoint(base_url),
            api_key: api_key.into(),
            model: model.into(),
            max_tokens,
        })
    }

    /// Build from config, resolving the API key from the environment if needed.
    pub fn from_config(config: &GenerationConfig) -> Result<Self, CaseGenError> {
        let api_key = config
            .resolved_api_key()
            .ok_or_else(|| CaseGenError::ProviderNotConfigured {
                provider: config.base_url.clone(),
                hint: "Set CASEGEN_API_KEY (or DEEPSEEK_API_KEY), or pass --api-key.".into(),
            })?;
        Self::new(
            &config.base_url,
            api_key,
            config.model.clone(),
            config.max_tokens,
            config.api_timeout_secs,
        )
    }

    fn request_body(&self, request: &ChatRequest) -> serde_json::Value {
        json!({
            "model": self.model,
            "messages": [ { "role": "user", "content": request.user_message() } ],
            "stream": true,
            "max_tokens": self.max_tokens,
            "stream_options": { "include_usage": true },
        })
    }
}

impl ChatModel for OpenAiCompatibleModel {
    fn name(&self) -> &str {
        &self.model
    }

    fn stream_chat<'a>(
        &'a self,
        request: &'a ChatRequest,
    ) -> BoxFuture<'a, Result<DeltaStream, CaseGenError>> {
        Box::pin(async move {
            debug!(
                "Chunk {}: POST {} (model={}, {} content chars)",
                request.chunk_num,
                self.endpoint,
                self.model,
                request.content.chars().count()
            );

            let response = self
                .client
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&self.request_body(request))
                .send()
                .await
                .map_err(|e| CaseGenError::LlmApiError {
                    status: e.status().map(|s| s.as_u16()),
                    message: e.to_string(),
                })?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(CaseGenError::LlmApiError {
                    status: Some(status.as_u16()),
                    message: truncate(&body, 500),
                });
            }

            Ok(sse_deltas(response.bytes_stream(), request.chunk_num))
        })
    }
}

/// `https://host` and `https://host/v1` both map to `…/chat/completions`.
fn chat_endpoint(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/chat/completions") {
        base.to_string()
    } else {
        format!("{base}/chat/completions")
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars).collect();
        format!("{head}…")
    }
}

// ── SSE decoding ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<UsagePayload>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<DeltaPayload>,
}

#[derive(Debug, Deserialize)]
struct DeltaPayload {
    reasoning_content: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsagePayload {
    #[serde(default)]
    prompt_tokens: usize,
    #[serde(default)]
    completion_tokens: usize,
    completion_tokens_details: Option<CompletionDetails>,
}

#[derive(Debug, Deserialize)]
struct CompletionDetails {
    #[serde(default)]
    reasoning_tokens: usize,
}

/// One decoded SSE event.
#[derive(Debug, PartialEq, Eq)]
pub enum SseEvent {
    Deltas(Vec<Delta>),
    Done,
    Ignore,
}

/// Decode the `data` field of one server-sent event.
pub fn parse_event_data(data: &str) -> Result<SseEvent, CaseGenError> {
    let payload = data.trim();
    if payload == "[DONE]" {
        return Ok(SseEvent::Done);
    }
    if payload.is_empty() {
        return Ok(SseEvent::Ignore);
    }

    let chunk: StreamChunk = match serde_json::from_str(payload) {
        Ok(c) => c,
        Err(e) => {
            warn!("Ignoring undecodable SSE payload ({}): {}", e, truncate(payload, 120));
            return Ok(SseEvent::Ignore);
        }
    };

    if let Some(err) = chunk.error {
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        return Err(CaseGenError::LlmApiError {
            status: None,
            message,
        });
    }

    let mut deltas = Vec::new();
    if let Some(delta) = chunk.choices.into_iter().next().and_then(|c| c.delta) {
        if let Some(r) = delta.reasoning_content {
            deltas.push(Delta::Reasoning(r));
        }
        if let Some(a) = delta.content {
            deltas.push(Delta::Answer(a));
        }
    }
    if let Some(u) = chunk.usage {
        deltas.push(Delta::Usage(TokenUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            reasoning_tokens: u
                .completion_tokens_details
                .map_or(0, |d| d.reasoning_tokens),
        }));
    }
    Ok(SseEvent::Deltas(deltas))
}

struct SseState<S> {
    events: Pin<Box<EventStream<S>>>,
    pending: VecDeque<Result<Delta, CaseGenError>>,
    done: bool,
}

/// Turn a byte stream of server-sent events into a [`DeltaStream`].
///
/// Event framing and UTF-8 reassembly come from `eventsource-stream`. The
/// stream ends at `data: [DONE]` or end of body; transport errors end it
/// with [`CaseGenError::StreamInterrupted`].
pub fn sse_deltas<S, B, E>(bytes: S, chunk_num: usize) -> DeltaStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = SseState {
        events: Box::pin(bytes.eventsource()),
        pending: VecDeque::new(),
        done: false,
    };

    let s = stream::unfold(state, move |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            if st.done {
                return None;
            }
            match st.events.next().await {
                Some(Ok(event)) => match parse_event_data(&event.data) {
                    Ok(SseEvent::Deltas(ds)) => st.pending.extend(ds.into_iter().map(Ok)),
                    Ok(SseEvent::Done) => st.done = true,
                    Ok(SseEvent::Ignore) => {}
                    Err(e) => {
                        st.pending.push_back(Err(e));
                        st.done = true;
                    }
                },
                Some(Err(e)) => {
                    st.done = true;
                    st.pending.push_back(Err(CaseGenError::StreamInterrupted {
                        chunk: chunk_num,
                        detail: e.to_string(),
                    }));
                }
                None => st.done = true,
            }
        }
    });
    Box::pin(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(chunks: Vec<Result<Vec<u8>, String>>) -> Vec<Result<Delta, String>> {
        let s = sse_deltas(stream::iter(chunks), 1);
        tokio_test::block_on(s.map(|r| r.map_err(|e| e.to_string())).collect())
    }

    #[test]
    fn endpoint_is_appended_once() {
        assert_eq!(
            chat_endpoint("https://api.deepseek.com"),
            "https://api.deepseek.com/chat/completions"
        );
        assert_eq!(
            chat_endpoint("https://host/v1/"),
            "https://host/v1/chat/completions"
        );
        assert_eq!(
            chat_endpoint("https://host/v1/chat/completions"),
            "https://host/v1/chat/completions"
        );
    }

    #[test]
    fn parse_reasoning_and_answer_deltas() {
        let ev = parse_event_data(
            r#"{"choices":[{"delta":{"reasoning_content":"想","content":null}}]}"#,
        )
        .unwrap();
        assert_eq!(ev, SseEvent::Deltas(vec![Delta::Reasoning("想".into())]));

        let ev = parse_event_data(r#"{"choices":[{"delta":{"content":"[{"}}]}"#).unwrap();
        assert_eq!(ev, SseEvent::Deltas(vec![Delta::Answer("[{".into())]));
    }

    #[test]
    fn parse_usage_with_empty_choices() {
        let ev = parse_event_data(
            r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":30,"completion_tokens_details":{"reasoning_tokens":20}}}"#,
        )
        .unwrap();
        assert_eq!(
            ev,
            SseEvent::Deltas(vec![Delta::Usage(TokenUsage {
                input_tokens: 12,
                output_tokens: 30,
                reasoning_tokens: 20
            })])
        );
    }

    #[test]
    fn parse_control_payloads() {
        assert_eq!(parse_event_data("[DONE]").unwrap(), SseEvent::Done);
        assert_eq!(parse_event_data("").unwrap(), SseEvent::Ignore);
        assert_eq!(parse_event_data("{not json").unwrap(), SseEvent::Ignore);
    }

    #[test]
    fn parse_error_payload() {
        let err = parse_event_data(r#"{"error":{"message":"quota exceeded"}}"#).unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
    }

    #[test]
    fn multibyte_char_split_across_reads_is_preserved() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"用例\"}}]}\n\n".as_bytes();
        // Split inside the first CJK character.
        let cut = line.iter().position(|b| *b >= 0x80).unwrap() + 1;
        let out = collect(vec![Ok(line[..cut].to_vec()), Ok(line[cut..].to_vec())]);
        assert_eq!(out, vec![Ok(Delta::Answer("用例".into()))]);
    }

    #[test]
    fn comments_and_event_fields_are_skipped() {
        let body = concat!(
            ": keep-alive\n\n",
            "event: message\nid: 7\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let out = collect(vec![Ok(body.as_bytes().to_vec())]);
        assert_eq!(out, vec![Ok(Delta::Answer("a".into()))]);
    }

    #[test]
    fn stream_stops_at_done_marker() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n",
            "data: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
        );
        let out = collect(vec![Ok(body.as_bytes().to_vec())]);
        assert_eq!(out, vec![Ok(Delta::Answer("a".into()))]);
    }

    #[test]
    fn crlf_framed_events_are_decoded() {
        let out = collect(vec![Ok(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"z\"}}]}\r\n\r\n".to_vec()
        )]);
        assert_eq!(out, vec![Ok(Delta::Answer("z".into()))]);
    }

    #[test]
    fn transport_error_interrupts_stream() {
        let out = collect(vec![
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n".to_vec()),
            Err("connection reset".into()),
        ]);
        assert_eq!(out.len(), 2);
        assert!(out[1].as_ref().unwrap_err().contains("connection reset"));
    }

    #[test]
    fn user_message_uses_request_fields() {
        let config = GenerationConfig::builder()
            .industry("电商")
            .instruction("只输出JSON")
            .build()
            .unwrap();
        let req = ChatRequest::from_config(&config, 1, "下单流程");
        let msg = req.user_message();
        assert!(msg.starts_with("所在行业:  电商；"));
        assert!(msg.contains("文档内容： 下单流程；"));
        assert!(msg.ends_with("提示词：只输出JSON；"));
    }

    #[test]
    fn missing_api_key_is_provider_not_configured() {
        if std::env::var("CASEGEN_API_KEY").is_ok() || std::env::var("DEEPSEEK_API_KEY").is_ok() {
            return;
        }
        let config = GenerationConfig::default();
        let err = OpenAiCompatibleModel::from_config(&config).err().unwrap();
        assert!(matches!(err, CaseGenError::ProviderNotConfigured { .. }));
    }
}
