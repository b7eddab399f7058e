//! Contracts for the text-generation / embedding service.
//!
//! The core never talks HTTP itself; everything that reaches the model goes
//! through [`Embedder`] or [`Generator`], and every call carries a
//! [`Deadline`] so callers can bound latency without the core hard-coding
//! timeouts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
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

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub context_window: usize,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            context_window: 8192,
        }
    }
}

/// One synchronous generation call: a system prompt, a role-tagged message
/// history and sampling options.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub system_prompt: String,
    pub messages: Vec<ConversationTurn>,
    pub options: GenerationOptions,
}

impl GenerateRequest {
    pub fn new(system_prompt: impl Into<String>, options: GenerationOptions) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            messages: Vec::new(),
            options,
        }
    }

    pub fn with_history(mut self, history: &[ConversationTurn]) -> Self {
        self.messages.extend(history.iter().cloned());
        self
    }

    pub fn with_user(mut self, content: impl Into<String>) -> Self {
        self.messages.push(ConversationTurn::user(content));
        self
    }

    /// The final user message, which is where each phase puts its task.
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}

/// Point in time after which backend calls should give up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn none() -> Self {
        Deadline(None)
    }

    pub fn after(timeout: Duration) -> Self {
        Deadline(Some(Instant::now() + timeout))
    }

    pub fn at(instant: Instant) -> Self {
        Deadline(Some(instant))
    }

    pub fn instant(&self) -> Option<Instant> {
        self.0
    }

    /// Time left, `None` when unbounded. Saturates at zero.
    pub fn remaining(&self) -> Option<Duration> {
        self.0
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.remaining(), Some(d) if d.is_zero())
    }
}

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts. Output order matches input order.
    async fn embed(&self, texts: &[String], deadline: Deadline) -> Result<Vec<Vec<f32>>>;
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: &GenerateRequest, deadline: Deadline) -> Result<String>;
}
