//! Grounded, self-checking question answering over an Ollama backend.
//!
//! Indexed text is retrieved into a citation-labelled context, answered
//! through a draft / critique / refine pass or a persona ensemble, and every
//! answer is scored so that later queries can pick a better strategy.

pub mod backend;
pub mod chunker;
pub mod citations;
pub mod config;
pub mod context;
pub mod embeddings;
pub mod engine;
pub mod error;
pub mod injection;
pub mod insights;
pub mod logging;
pub mod metacognition;
pub mod ollama;
pub mod orchestrator;
pub mod reflector;
pub mod vector_store;

pub use backend::{ConversationTurn, Deadline, Embedder, GenerateRequest, GenerationOptions, Generator, Role};
pub use config::Config;
pub use context::{Citation, ContextBuilder, ContextPacket};
pub use engine::{EngineAnswer, ReasoningEngine};
pub use error::{Error, Result};
pub use insights::{Insight, InsightLog};
pub use metacognition::{Assessment, Recommendation, Strategy, StrategySelector};
pub use ollama::OllamaClient;
pub use orchestrator::{AgentOrchestrator, AgentPersona, AgentResponse, EnsembleProgress};
pub use reflector::{Reflection, Reflector};
pub use vector_store::{Chunk, SearchHit, VectorStore};
