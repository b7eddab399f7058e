use anyhow::{anyhow, Context as _};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backend::{Deadline, Embedder, GenerateRequest, Generator, Role};
use crate::config::OllamaConfig;
use crate::embeddings::{truncate_for_embedding, EmbeddingRequest, EmbeddingResponse};
use crate::error::{Error, Result};

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f32,
    num_ctx: usize,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    #[serde(default)]
    #[allow(dead_code)]
    model: String,
    message: ResponseMessage,
    #[serde(default)]
    #[allow(dead_code)]
    done: bool,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

/// Outcome of a single HTTP attempt.
enum Attempt<T> {
    Done(T),
    Retry(anyhow::Error),
    Fatal(anyhow::Error),
}

/// Ollama HTTP client implementing both backend contracts.
///
/// Every call is retried with exponential backoff on transport errors, 429
/// and 5xx responses, and never runs past the caller's [`Deadline`].
pub struct OllamaClient {
    base_url: String,
    model: String,
    embedding_model: String,
    client: reqwest::Client,
    max_retries: u32,
    initial_backoff: Duration,
    request_timeout: Duration,
    max_embed_chars: usize,
}

impl OllamaClient {
    pub fn with_config(config: &OllamaConfig) -> Self {
        OllamaClient {
            base_url: config.host.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            embedding_model: config.embedding_model.clone(),
            client: reqwest::Client::new(),
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            max_embed_chars: config.max_embed_chars,
        }
    }

    pub fn get_model(&self) -> &str {
        &self.model
    }

    pub fn set_model(&mut self, model: String) {
        self.model = model;
    }

    fn chat_body<'a>(&'a self, request: &'a GenerateRequest, stream: bool) -> OllamaChatRequest<'a> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if !request.system_prompt.is_empty() {
            messages.push(Message {
                role: Role::System.as_str(),
                content: &request.system_prompt,
            });
        }
        messages.extend(request.messages.iter().map(|m| Message {
            role: m.role.as_str(),
            content: &m.content,
        }));

        OllamaChatRequest {
            model: &self.model,
            messages,
            stream,
            options: ChatOptions {
                temperature: request.options.temperature,
                num_ctx: request.options.context_window,
            },
        }
    }

    /// Timeout for the next attempt, or `None` once the deadline has passed.
    fn attempt_timeout(&self, deadline: Deadline) -> Option<Duration> {
        match deadline.remaining() {
            Some(left) if left.is_zero() => None,
            Some(left) => Some(left.min(self.request_timeout)),
            None => Some(self.request_timeout),
        }
    }

    async fn post_json<B, T>(&self, path: &str, body: &B, deadline: Deadline) -> anyhow::Result<T>
    where
        B: Serialize + ?Sized,
        T: for<'de> Deserialize<'de>,
    {
        let url = format!("{}{}", self.base_url, path);
        let mut backoff = self.initial_backoff;
        let mut last_error = anyhow!("no attempt made");

        for attempt in 0..=self.max_retries {
            let Some(timeout) = self.attempt_timeout(deadline) else {
                return Err(last_error.context("deadline exceeded"));
            };

            match self.try_post::<B, T>(&url, body, timeout).await {
                Attempt::Done(value) => return Ok(value),
                Attempt::Fatal(e) => return Err(e),
                Attempt::Retry(e) => {
                    tracing::debug!("POST {} attempt {} failed: {:#}", url, attempt + 1, e);
                    last_error = e;
                }
            }

            if attempt == self.max_retries {
                break;
            }

            let pause = match deadline.remaining() {
                Some(left) if left <= backoff => {
                    return Err(last_error.context("deadline exceeded before retry"));
                }
                _ => backoff,
            };
            tokio::time::sleep(pause).await;
            backoff = backoff.saturating_mul(2);
        }

        Err(last_error.context(format!(
            "giving up on {} after {} attempts",
            url,
            self.max_retries + 1
        )))
    }

    async fn try_post<B, T>(&self, url: &str, body: &B, timeout: Duration) -> Attempt<T>
    where
        B: Serialize + ?Sized,
        T: for<'de> Deserialize<'de>,
    {
        let response = match self.client.post(url).json(body).timeout(timeout).send().await {
            Ok(r) => r,
            Err(e) => return Attempt::Retry(e.into()),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = anyhow!("Ollama API error ({}): {}", status, body);
            return if status.is_server_error() || status.as_u16() == 429 {
                Attempt::Retry(err)
            } else {
                Attempt::Fatal(err)
            };
        }

        match response.json::<T>().await {
            Ok(value) => Attempt::Done(value),
            Err(e) => Attempt::Fatal(anyhow::Error::new(e).context("undecodable Ollama response")),
        }
    }

    /// Stream a chat completion, calling `callback` with the accumulated text
    /// after every chunk. Streaming calls are not retried once bytes arrive.
    pub async fn generate_streaming<F>(
        &self,
        request: &GenerateRequest,
        deadline: Deadline,
        mut callback: F,
    ) -> Result<String>
    where
        F: FnMut(&str) + Send,
    {
        let timeout = self
            .attempt_timeout(deadline)
            .ok_or_else(|| Error::backend(anyhow!("deadline exceeded")))?;

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&self.chat_body(request, true))
            .timeout(timeout)
            .send()
            .await
            .map_err(Error::backend)?;

        if !response.status().is_success() {
            return Err(Error::backend(anyhow!("Ollama API error: {}", response.status())));
        }

        let mut response_text = String::new();
        // Raw bytes: a network chunk may end inside a multi-byte character.
        let mut pending: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();

        while let Some(item) = stream.next().await {
            let chunk = item.map_err(Error::backend)?;
            pending.extend_from_slice(&chunk);

            while let Some(newline) = pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = pending.drain(..=newline).collect();
                if let Some(content) = parse_stream_line(&line)? {
                    response_text.push_str(&content);
                    callback(&response_text);
                }
            }
        }

        if let Some(content) = parse_stream_line(&pending)? {
            response_text.push_str(&content);
            callback(&response_text);
        }

        Ok(response_text)
    }
}

/// Decode one newline-delimited stream record; blank lines yield `None`.
fn parse_stream_line(line: &[u8]) -> Result<Option<String>> {
    let line = std::str::from_utf8(line)
        .context("stream chunk is not valid UTF-8")
        .map_err(Error::backend)?
        .trim();
    if line.is_empty() {
        return Ok(None);
    }
    let part: OllamaChatResponse = serde_json::from_str(line)
        .context("malformed stream chunk")
        .map_err(Error::backend)?;
    Ok(Some(part.message.content))
}

#[async_trait]
impl Generator for OllamaClient {
    async fn generate(&self, request: &GenerateRequest, deadline: Deadline) -> Result<String> {
        let response: OllamaChatResponse = self
            .post_json("/api/chat", &self.chat_body(request, false), deadline)
            .await
            .map_err(Error::backend)?;
        Ok(response.message.content)
    }
}

#[async_trait]
impl Embedder for OllamaClient {
    async fn embed(&self, texts: &[String], deadline: Deadline) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = EmbeddingRequest {
            model: &self.embedding_model,
            input: texts
                .iter()
                .map(|t| truncate_for_embedding(t, self.max_embed_chars))
                .collect(),
            truncate: true,
        };

        let response: EmbeddingResponse = self
            .post_json("/api/embed", &request, deadline)
            .await
            .map_err(Error::backend)?;

        if response.embeddings.len() != texts.len() {
            return Err(Error::backend(anyhow!(
                "embedding count mismatch: sent {}, received {}",
                texts.len(),
                response.embeddings.len()
            )));
        }

        Ok(response.embeddings)
    }
}
