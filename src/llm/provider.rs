//! Minimal LLM client for the sampling broker (C9): exactly one configured
//! provider, reached over HTTP with a host-held API key. The sandboxed child
//! never sees the key — only this module does, mirroring the
//! privileged-credential-proxy pattern used elsewhere in this codebase.

use futures::Stream;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::UpstreamError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
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
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub stream: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: Usage,
}

/// One increment of a streamed completion: either a text delta or the
/// terminal `message_stop` carrying final usage.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Delta(String),
    Stop { usage: Usage, stop_reason: Option<String> },
}

#[derive(Debug, Deserialize)]
struct RawStreamEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    delta: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    stop_reason: Option<String>,
}

pub struct LlmProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl LlmProvider {
    pub fn new(base_url: impl Into<String>, api_key: Option<SecretString>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
        }
    }

    fn request(&self, req: &CompletionRequest) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(format!("{}/v1/messages", self.base_url)).json(req);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }
        builder
    }

    pub async fn complete(&self, req: &CompletionRequest) -> Result<CompletionResponse, UpstreamError> {
        let resp = self.request(req).send().await.map_err(|e| UpstreamError::BackendError {
            backend: "llm".into(),
            message: e.to_string(),
        })?;

        if !resp.status().is_success() {
            return Err(UpstreamError::BackendError {
                backend: "llm".into(),
                message: format!("provider returned {}", resp.status()),
            });
        }

        resp.json().await.map_err(|e| UpstreamError::BackendError {
            backend: "llm".into(),
            message: format!("malformed provider response: {e}"),
        })
    }

    /// Stream a completion, yielding text deltas followed by one terminal
    /// `Stop` event carrying final usage. The upstream wire format is
    /// newline-delimited SSE (`data: {...}\n\n`); parsed here without a
    /// dedicated SSE-client crate since the corpus carries none.
    pub async fn complete_stream(
        &self,
        req: &CompletionRequest,
    ) -> Result<impl Stream<Item = Result<StreamEvent, UpstreamError>>, UpstreamError> {
        let resp = self.request(req).send().await.map_err(|e| UpstreamError::BackendError {
            backend: "llm".into(),
            message: e.to_string(),
        })?;

        if !resp.status().is_success() {
            return Err(UpstreamError::BackendError {
                backend: "llm".into(),
                message: format!("provider returned {}", resp.status()),
            });
        }

        use futures::StreamExt;
        let initial = (
            resp.bytes_stream(),
            String::new(),
            std::collections::VecDeque::<StreamEvent>::new(),
            false,
        );

        Ok(futures::stream::unfold(initial, |(mut bytes, mut buf, mut pending, mut done)| async move {
            loop {
                if let Some(ev) = pending.pop_front() {
                    return Some((Ok(ev), (bytes, buf, pending, done)));
                }
                if done {
                    return None;
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => {
                        buf.push_str(&String::from_utf8_lossy(&chunk));
                        while let Some(pos) = buf.find("\n\n") {
                            let event_block = buf[..pos].to_string();
                            buf.drain(..pos + 2);
                            for line in event_block.lines() {
                                let Some(data) = line.strip_prefix("data: ") else { continue };
                                if data == "[DONE]" {
                                    continue;
                                }
                                let parsed: RawStreamEvent = match serde_json::from_str(data) {
                                    Ok(p) => p,
                                    Err(_) => continue,
                                };
                                match parsed.kind.as_str() {
                                    "content_block_delta" => {
                                        if let Some(delta) = parsed.delta {
                                            pending.push_back(StreamEvent::Delta(delta));
                                        }
                                    }
                                    "message_stop" => {
                                        pending.push_back(StreamEvent::Stop {
                                            usage: parsed.usage.unwrap_or_default(),
                                            stop_reason: parsed.stop_reason,
                                        });
                                        done = true;
                                    }
                                    _ => {}
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        done = true;
                        return Some((
                            Err(UpstreamError::BackendError {
                                backend: "llm".into(),
                                message: e.to_string(),
                            }),
                            (bytes, buf, pending, done),
                        ));
                    }
                    None => {
                        done = true;
                    }
                }
            }
        }))
    }
}
