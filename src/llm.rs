use std::fmt;
use std::io::{BufRead, BufReader, Write};
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{LlmError, env_optional};

const OPENAI_URL: &str = "https://api.openai.com/v1/chat/completions";
const ANTHROPIC_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const GOOGLE_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const LLM_TIMEOUT_SECS: u64 = 120;
const MAX_OUTPUT_TOKENS: u64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Provider {
    Openai,
    Google,
    Anthropic,
}

impl Provider {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Provider::Openai => "openai",
            Provider::Google => "google",
            Provider::Anthropic => "anthropic",
        }
    }

    pub(crate) fn default_model(self) -> &'static str {
        match self {
            Provider::Openai => "gpt-4o",
            Provider::Google => "gemini-2.0-flash",
            Provider::Anthropic => "claude-3-5-sonnet-latest",
        }
    }

    pub(crate) fn env_key(self) -> &'static str {
        match self {
            Provider::Openai => "OPENAI_API_KEY",
            Provider::Google => "GOOGLE_API_KEY",
            Provider::Anthropic => "ANTHROPIC_API_KEY",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// API keys, captured once at startup and handed to whoever needs them.
#[derive(Debug, Clone, Default)]
pub(crate) struct ProviderCredentials {
    pub(crate) openai: Option<String>,
    pub(crate) google: Option<String>,
    pub(crate) anthropic: Option<String>,
}

impl ProviderCredentials {
    pub(crate) fn from_env() -> Self {
        Self {
            openai: env_optional(Provider::Openai.env_key()),
            google: env_optional(Provider::Google.env_key()),
            anthropic: env_optional(Provider::Anthropic.env_key()),
        }
    }

    pub(crate) fn key_for(&self, provider: Provider) -> Option<&str> {
        match provider {
            Provider::Openai => self.openai.as_deref(),
            Provider::Google => self.google.as_deref(),
            Provider::Anthropic => self.anthropic.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ChatTurn {
    pub(crate) role: String,
    pub(crate) content: String,
}

impl ChatTurn {
    pub(crate) fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub(crate) fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Something that turns a system prompt plus history into a reply.
pub(crate) trait ChatBackend {
    fn describe(&self) -> String;

    /// When `stream` is set, text is written to `out` as it arrives.
    fn complete(
        &self,
        system: &str,
        turns: &[ChatTurn],
        stream: Option<&mut dyn Write>,
    ) -> Result<String, LlmError>;
}

pub(crate) struct LlmClient {
    provider: Provider,
    model: String,
    api_key: String,
    agent: ureq::Agent,
}

impl LlmClient {
    pub(crate) fn new(provider: Provider, model: Option<String>, api_key: String) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(LLM_TIMEOUT_SECS))
            .timeout_read(Duration::from_secs(LLM_TIMEOUT_SECS))
            .timeout_write(Duration::from_secs(LLM_TIMEOUT_SECS))
            .build();
        Self {
            provider,
            model: model.unwrap_or_else(|| provider.default_model().to_string()),
            api_key,
            agent,
        }
    }

    fn request(&self, streaming: bool) -> ureq::Request {
        match self.provider {
            Provider::Openai => self
                .agent
                .post(OPENAI_URL)
                .set("content-type", "application/json")
                .set("authorization", &format!("Bearer {}", self.api_key)),
            Provider::Anthropic => self
                .agent
                .post(ANTHROPIC_URL)
                .set("content-type", "application/json")
                .set("x-api-key", &self.api_key)
                .set("anthropic-version", ANTHROPIC_VERSION),
            Provider::Google => {
                let url = if streaming {
                    format!("{GOOGLE_BASE_URL}/{}:streamGenerateContent?alt=sse", self.model)
                } else {
                    format!("{GOOGLE_BASE_URL}/{}:generateContent", self.model)
                };
                self.agent
                    .post(&url)
                    .set("content-type", "application/json")
                    .set("x-goog-api-key", &self.api_key)
            }
        }
    }
}

impl ChatBackend for LlmClient {
    fn describe(&self) -> String {
        format!("{} ({})", self.provider, self.model)
    }

    fn complete(
        &self,
        system: &str,
        turns: &[ChatTurn],
        stream: Option<&mut dyn Write>,
    ) -> Result<String, LlmError> {
        let provider = self.provider.name();
        let payload = build_payload(self.provider, &self.model, system, turns, stream.is_some());
        debug!(provider, model = %self.model, turns = turns.len(), "llm request");

        let response = match self.request(stream.is_some()).send_json(payload) {
            Ok(resp) => resp,
            Err(ureq::Error::Status(status, resp)) => {
                let body = resp.into_string().unwrap_or_default();
                return Err(LlmError::Status {
                    provider,
                    status,
                    body,
                });
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(LlmError::Transport {
                    provider,
                    message: err.to_string(),
                });
            }
        };

        let text = match stream {
            Some(out) => {
                let reader = BufReader::new(response.into_reader());
                read_sse_stream(self.provider, reader, out)?
            }
            None => {
                let value: serde_json::Value =
                    response.into_json().map_err(|source| LlmError::Stream {
                        provider,
                        source,
                    })?;
                extract_full_text(self.provider, &value)
            }
        };
        if text.trim().is_empty() {
            return Err(LlmError::EmptyResponse(provider));
        }
        Ok(text)
    }
}

pub(crate) fn build_payload(
    provider: Provider,
    model: &str,
    system: &str,
    turns: &[ChatTurn],
    stream: bool,
) -> serde_json::Value {
    match provider {
        Provider::Openai => {
            let mut messages = vec![serde_json::json!({"role": "system", "content": system})];
            messages.extend(
                turns
                    .iter()
                    .map(|t| serde_json::json!({"role": t.role, "content": t.content})),
            );
            serde_json::json!({
                "model": model,
                "messages": messages,
                "stream": stream,
            })
        }
        Provider::Anthropic => {
            let messages: Vec<serde_json::Value> = turns
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "role": t.role,
                        "content": [{"type": "text", "text": t.content}]
                    })
                })
                .collect();
            serde_json::json!({
                "model": model,
                "max_tokens": MAX_OUTPUT_TOKENS,
                "system": system,
                "messages": messages,
                "stream": stream,
            })
        }
        Provider::Google => {
            let contents: Vec<serde_json::Value> = turns
                .iter()
                .map(|t| {
                    let role = if t.role == "assistant" { "model" } else { "user" };
                    serde_json::json!({"role": role, "parts": [{"text": t.content}]})
                })
                .collect();
            serde_json::json!({
                "systemInstruction": {"parts": [{"text": system}]},
                "contents": contents,
                "generationConfig": {"maxOutputTokens": MAX_OUTPUT_TOKENS},
            })
        }
    }
}

fn google_parts_text(value: &serde_json::Value) -> String {
    value
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<String>()
        })
        .unwrap_or_default()
}

pub(crate) fn extract_full_text(provider: Provider, value: &serde_json::Value) -> String {
    match provider {
        Provider::Openai => value
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string(),
        Provider::Anthropic => value
            .get("content")
            .and_then(|c| c.as_array())
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default(),
        Provider::Google => google_parts_text(value),
    }
}

/// Text carried by one streamed event, if any.
pub(crate) fn extract_stream_delta(provider: Provider, event: &serde_json::Value) -> Option<String> {
    let text = match provider {
        Provider::Openai => event
            .get("choices")?
            .get(0)?
            .get("delta")?
            .get("content")?
            .as_str()?
            .to_string(),
        Provider::Anthropic => {
            if event.get("type")?.as_str()? != "content_block_delta" {
                return None;
            }
            event.get("delta")?.get("text")?.as_str()?.to_string()
        }
        Provider::Google => google_parts_text(event),
    };
    if text.is_empty() { None } else { Some(text) }
}

/// Reads a server-sent-events body, echoing each text delta to `out`.
pub(crate) fn read_sse_stream<R: BufRead>(
    provider: Provider,
    reader: R,
    out: &mut dyn Write,
) -> Result<String, LlmError> {
    let name = provider.name();
    let mut full = String::new();
    for line in reader.lines() {
        let line = line.map_err(|source| LlmError::Stream {
            provider: name,
            source,
        })?;
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data == "[DONE]" {
            break;
        }
        let Ok(event) = serde_json::from_str::<serde_json::Value>(data) else {
            continue;
        };
        if let Some(delta) = extract_stream_delta(provider, &event) {
            out.write_all(delta.as_bytes())
                .and_then(|_| out.flush())
                .map_err(|source| LlmError::Stream {
                    provider: name,
                    source,
                })?;
            full.push_str(&delta);
        }
    }
    Ok(full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn credentials_pick_provider_key() {
        let creds = ProviderCredentials {
            openai: Some("sk-test".into()),
            ..Default::default()
        };
        assert_eq!(creds.key_for(Provider::Openai), Some("sk-test"));
        assert_eq!(creds.key_for(Provider::Anthropic), None);
    }

    #[test]
    fn payload_shapes() {
        let turns = vec![ChatTurn::user("hi"), ChatTurn::assistant("hello"), ChatTurn::user("who?")];
        let openai = build_payload(Provider::Openai, "gpt-4o", "sys", &turns, true);
        assert_eq!(openai["messages"][0]["role"], "system");
        assert_eq!(openai["messages"].as_array().unwrap().len(), 4);
        assert_eq!(openai["stream"], true);

        let anthropic = build_payload(Provider::Anthropic, "claude", "sys", &turns, false);
        assert_eq!(anthropic["system"], "sys");
        assert_eq!(anthropic["messages"][1]["content"][0]["text"], "hello");

        let google = build_payload(Provider::Google, "gemini", "sys", &turns, true);
        assert_eq!(google["contents"][1]["role"], "model");
        assert_eq!(google["systemInstruction"]["parts"][0]["text"], "sys");
    }

    #[test]
    fn full_text_extraction() {
        let openai = serde_json::json!({"choices": [{"message": {"content": "Answer"}}]});
        assert_eq!(extract_full_text(Provider::Openai, &openai), "Answer");
        let anthropic = serde_json::json!({"content": [
            {"type": "text", "text": "Part one"},
            {"type": "text", "text": "part two"}
        ]});
        assert_eq!(extract_full_text(Provider::Anthropic, &anthropic), "Part one\npart two");
        let google = serde_json::json!({"candidates": [{"content": {"parts": [{"text": "Gem"}, {"text": "ini"}]}}]});
        assert_eq!(extract_full_text(Provider::Google, &google), "Gemini");
    }

    #[test]
    fn openai_stream_is_echoed_and_collected() {
        let body = "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n\
                    data: {\"choices\":[{\"delta\":{\"content\":\"The \"}}]}\n\n\
                    data: {\"choices\":[{\"delta\":{\"content\":\"Tudors\"}}]}\n\n\
                    data: [DONE]\n";
        let mut out = Vec::new();
        let text = read_sse_stream(Provider::Openai, Cursor::new(body), &mut out).unwrap();
        assert_eq!(text, "The Tudors");
        assert_eq!(String::from_utf8(out).unwrap(), "The Tudors");
    }

    #[test]
    fn anthropic_stream_ignores_other_events() {
        let body = "event: message_start\ndata: {\"type\":\"message_start\"}\n\n\
                    event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n\
                    event: message_stop\ndata: {\"type\":\"message_stop\"}\n";
        let mut out = Vec::new();
        let text = read_sse_stream(Provider::Anthropic, Cursor::new(body), &mut out).unwrap();
        assert_eq!(text, "Hi");
    }

    struct ClosedPipe;

    impl Write for ClosedPipe {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn stream_write_failure_is_reported() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"lost\"}}]}\n";
        let err = read_sse_stream(Provider::Openai, Cursor::new(body), &mut ClosedPipe).unwrap_err();
        match err {
            LlmError::Stream { provider, source } => {
                assert_eq!(provider, "openai");
                assert_eq!(source.kind(), std::io::ErrorKind::BrokenPipe);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
