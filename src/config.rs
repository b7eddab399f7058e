use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::error::Result;
use crate::orchestrator::AgentPersona;

fn default_host() -> String {
    "http://localhost:11434".to_string()
}

fn default_model() -> String {
    "llama3".to_string()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_context_window() -> usize {
    8192
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_max_embed_chars() -> usize {
    8000
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub reflection: ReflectionConfig,
    #[serde(default)]
    pub ensemble: EnsembleConfig,
    #[serde(default)]
    pub metacognition: MetacognitionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OllamaConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Longest input, in characters, sent to the embedding endpoint.
    #[serde(default = "default_max_embed_chars")]
    pub max_embed_chars: usize,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        OllamaConfig {
            host: default_host(),
            model: default_model(),
            embedding_model: default_embedding_model(),
            context_window: default_context_window(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            max_embed_chars: default_max_embed_chars(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub limit: usize,
    pub max_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            limit: 5,
            max_chars: 6000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IndexingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1200,
            chunk_overlap: 200,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReflectionConfig {
    pub draft_temperature: f32,
    pub critique_temperature: f32,
    pub refine_temperature: f32,
    /// Critiques shorter than this with no list items are treated as empty.
    pub min_critique_chars: usize,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            draft_temperature: 0.3,
            critique_temperature: 0.0,
            refine_temperature: 0.4,
            min_critique_chars: 8,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EnsembleConfig {
    pub personas: Vec<AgentPersona>,
    pub synthesis_temperature: f32,
    pub synthesis_context_window: usize,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            personas: AgentPersona::defaults(),
            synthesis_temperature: 0.3,
            synthesis_context_window: 12288,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetacognitionConfig {
    /// An assessment scoring strictly above this counts as a success.
    pub success_threshold: f64,
    /// A matching insight must beat this success rate to override heuristics.
    pub recommend_threshold: f64,
    /// Insights above this success rate are relevant to every query.
    pub relevance_success_rate: f64,
    pub max_relevant: usize,
    pub fast_query_chars: usize,
    pub ensemble_context_chars: usize,
    pub ensemble_citations: usize,
}

impl Default for MetacognitionConfig {
    fn default() -> Self {
        Self {
            success_threshold: 0.7,
            recommend_threshold: 0.75,
            relevance_success_rate: 0.8,
            max_relevant: 3,
            fast_query_chars: 30,
            ensemble_context_chars: 5000,
            ensemble_citations: 3,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl Config {
    pub fn load() -> Self {
        let config_path = Self::get_config_path();

        let mut config = if config_path.exists() {
            match fs::read_to_string(&config_path) {
                Ok(contents) => match Self::from_toml_str(&contents) {
                    Ok(config) => config,
                    Err(e) => {
                        tracing::warn!("Error parsing {}: {}. Using defaults.", config_path.display(), e);
                        Config::default()
                    }
                },
                Err(e) => {
                    tracing::warn!("Error reading {}: {}. Using defaults.", config_path.display(), e);
                    Config::default()
                }
            }
        } else {
            if let Some(parent) = config_path.parent() {
                let _ = fs::create_dir_all(parent);
            }
            Config::default()
        };

        config.apply_env_overrides();
        config
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("OLLAMA_HOST") {
            self.ollama.host = host;
        }
        if let Ok(model) = std::env::var("OLLAMA_MODEL") {
            self.ollama.model = model;
        }
    }

    /// Directory holding the vector store and insight log databases.
    pub fn data_dir(&self) -> PathBuf {
        self.storage
            .data_dir
            .clone()
            .unwrap_or_else(Self::get_config_dir)
    }

    pub fn get_config_path() -> PathBuf {
        Self::get_config_dir().join("config.toml")
    }

    pub fn get_config_dir() -> PathBuf {
        if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home).join(".config/bob-reason")
        } else {
            PathBuf::from(".")
        }
    }
}
