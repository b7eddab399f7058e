//! End-to-end question answering.
//!
//! query -> context -> strategy -> (fast | reflective | ensemble) -> answer
//! -> quality assessment -> insight log.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::backend::{ConversationTurn, Deadline, Embedder, Generator};
use crate::chunker;
use crate::citations;
use crate::config::Config;
use crate::context::{Citation, ContextBuilder, ContextPacket};
use crate::error::Result;
use crate::insights::InsightLog;
use crate::metacognition::{Assessment, PerformanceReport, Recommendation, RecommendationSource, Strategy, StrategySelector};
use crate::ollama::OllamaClient;
use crate::orchestrator::{AgentOrchestrator, AgentResponse, EnsembleProgress};
use crate::reflector::Reflector;
use crate::vector_store::VectorStore;

pub const NOT_FOUND_NOTE: &str =
    "[Note: This answer is based on general knowledge, not from indexed documents]";

const NOT_FOUND_MARKERS: [&str; 6] = [
    "not found",
    "no information",
    "don't have",
    "cannot find",
    "not in",
    "not supported",
];

/// Prefix a disclaimer when nothing was retrieved and a substantive answer
/// doesn't say so itself.
pub fn enforce_not_found(answer: &str, packet: &ContextPacket) -> String {
    if !packet.is_empty() || answer.chars().count() <= 50 {
        return answer.to_string();
    }
    let lower = answer.to_lowercase();
    if NOT_FOUND_MARKERS.iter().any(|m| lower.contains(m)) {
        return answer.to_string();
    }
    format!("{}\n\n{}", NOT_FOUND_NOTE, answer)
}

#[derive(Debug, Clone)]
pub struct EngineAnswer {
    pub text: String,
    pub strategy: Strategy,
    pub recommendation: Recommendation,
    pub assessment: Assessment,
    pub context: ContextPacket,
    pub latency: Duration,
    /// Persona responses, only for the ensemble strategy.
    pub agent_responses: Vec<AgentResponse>,
}

impl EngineAnswer {
    pub fn citations(&self) -> &[Citation] {
        self.context.citations()
    }

    /// The answer followed by a list of the sources it cites.
    pub fn with_references(&self) -> String {
        citations::references_section(&self.text, &self.context)
    }
}

pub struct ReasoningEngine {
    embedder: Arc<dyn Embedder>,
    store: Arc<VectorStore>,
    context: ContextBuilder,
    reflector: Reflector,
    orchestrator: AgentOrchestrator,
    selector: StrategySelector,
    config: Config,
}

impl ReasoningEngine {
    pub async fn new(
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        store: Arc<VectorStore>,
        log: Arc<InsightLog>,
        config: Config,
    ) -> Result<Self> {
        let context_window = config.ollama.context_window;
        let selector = StrategySelector::open(
            generator.clone(),
            log,
            config.metacognition.clone(),
            context_window,
        )
        .await?;

        Ok(Self {
            context: ContextBuilder::new(embedder.clone(), store.clone()),
            reflector: Reflector::new(generator.clone(), config.reflection.clone(), context_window),
            orchestrator: AgentOrchestrator::new(generator, config.ensemble.clone(), context_window),
            embedder,
            store,
            selector,
            config,
        })
    }

    /// Engine backed by Ollama, with both databases under the data dir.
    pub async fn with_ollama(config: Config) -> Result<Self> {
        let data_dir = config.data_dir();
        let client = Arc::new(OllamaClient::with_config(&config.ollama));
        let store = Arc::new(VectorStore::open(&data_dir.join("vectors.sqlite"))?);
        let log = Arc::new(InsightLog::open(&data_dir.join("metacognition.sqlite"))?);

        tracing::info!(
            "Using model {} with data in {}",
            client.get_model(),
            data_dir.display()
        );

        Self::new(client.clone(), client, store, log, config).await
    }

    pub fn set_progress_channel(&mut self, tx: mpsc::UnboundedSender<EnsembleProgress>) {
        self.orchestrator.set_progress_channel(tx);
    }

    pub fn store(&self) -> &VectorStore {
        &self.store
    }

    /// Cleanse, chunk, embed (one batched call) and store `text`.
    pub async fn index_text(&self, source_id: &str, text: &str, deadline: Deadline) -> Result<usize> {
        let cleaned = chunker::cleanse(text);
        let chunks = chunker::chunk(
            &cleaned,
            self.config.indexing.chunk_size,
            self.config.indexing.chunk_overlap,
        );
        if chunks.is_empty() {
            tracing::debug!("Nothing to index for {}", source_id);
            return Ok(0);
        }

        let vectors = self.embedder.embed(&chunks, deadline).await?;
        let stored = self.store.append(source_id, &chunks, &vectors).await?;
        tracing::info!("Indexed {} chunks from {}", stored, source_id);
        Ok(stored)
    }

    /// Answer with the recommended strategy.
    pub async fn answer(
        &self,
        query: &str,
        history: &[ConversationTurn],
        deadline: Deadline,
    ) -> Result<EngineAnswer> {
        let packet = self.build_context(query, deadline).await?;
        let recommendation = self.selector.recommend_strategy(query, &packet).await;
        self.run(query, history, packet, recommendation, deadline).await
    }

    /// Answer with a caller-chosen strategy, bypassing recommendation.
    pub async fn answer_with(
        &self,
        query: &str,
        history: &[ConversationTurn],
        strategy: Strategy,
        deadline: Deadline,
    ) -> Result<EngineAnswer> {
        let packet = self.build_context(query, deadline).await?;
        let recommendation = Recommendation {
            strategy,
            source: RecommendationSource::Requested,
        };
        self.run(query, history, packet, recommendation, deadline).await
    }

    pub async fn performance_report(&self) -> PerformanceReport {
        self.selector.performance_report().await
    }

    async fn build_context(&self, query: &str, deadline: Deadline) -> Result<ContextPacket> {
        self.context
            .build_context(
                query,
                self.config.retrieval.limit,
                self.config.retrieval.max_chars,
                deadline,
            )
            .await
    }

    async fn run(
        &self,
        query: &str,
        history: &[ConversationTurn],
        packet: ContextPacket,
        recommendation: Recommendation,
        deadline: Deadline,
    ) -> Result<EngineAnswer> {
        let strategy = recommendation.strategy;
        let start = Instant::now();

        let (text, agent_responses) = match strategy {
            Strategy::Fast => (
                self.reflector
                    .quick_answer(query, &packet, history, deadline)
                    .await?,
                Vec::new(),
            ),
            Strategy::Reflective => (
                self.reflector
                    .reflect(query, &packet, history, deadline)
                    .await?
                    .answer,
                Vec::new(),
            ),
            Strategy::Ensemble => {
                let outcome = self
                    .orchestrator
                    .orchestrate(query, &packet, history, deadline)
                    .await?;
                (outcome.answer, outcome.responses)
            }
        };

        let latency = start.elapsed();
        let text = enforce_not_found(&text, &packet);
        let assessment = self
            .selector
            .assess_quality(query, &packet, &text, strategy, latency, deadline)
            .await;

        Ok(EngineAnswer {
            text,
            strategy,
            recommendation,
            assessment,
            context: packet,
            latency,
            agent_responses,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;
    use crate::backend::GenerateRequest;

    const ASSESSOR: &str = "You are a rigorous quality assessor.";

    fn respond(req: &GenerateRequest) -> Result<String> {
        let user = req.last_user_message().unwrap_or_default();
        if req.system_prompt == ASSESSOR {
            return Ok(r#"{"overall": 0.9, "reasoning": "fine"}"#.into());
        }
        if req.system_prompt.starts_with("You are a meta-learning") {
            return Ok(r#"{"pattern": "capital cities"}"#.into());
        }
        if req.system_prompt.starts_with("You are a rigorous fact-checker") {
            return Ok("LGTM".into());
        }
        if req.system_prompt.starts_with("You are a master synthesizer") {
            return Ok("Synthesized: Paris [S1].".into());
        }
        if req.system_prompt.contains("Paris is the capital of France.") {
            return Ok(format!("The capital of France is Paris [S1]. ({})", user.len()));
        }
        Ok("That was not found in the indexed documents, but generally speaking the answer depends on context.".into())
    }

    async fn engine(backend: Arc<MockBackend>, config: Config) -> ReasoningEngine {
        ReasoningEngine::new(
            backend.clone(),
            backend,
            Arc::new(VectorStore::open_in_memory().unwrap()),
            Arc::new(InsightLog::open_in_memory().unwrap()),
            config,
        )
        .await
        .unwrap()
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.retrieval.limit = 1;
        config
    }

    #[test]
    fn test_enforce_not_found() {
        let empty = ContextPacket::empty();
        let long = "Generally the mitochondria is described as the powerhouse of the cell in textbooks.";
        let noted = enforce_not_found(long, &empty);
        assert!(noted.starts_with(NOT_FOUND_NOTE));
        assert!(noted.ends_with(long));

        assert_eq!(enforce_not_found("Short answer.", &empty), "Short answer.");
        let ack = "That information was not found in the documents I have access to, sorry.";
        assert_eq!(enforce_not_found(ack, &empty), ack);
    }

    #[tokio::test]
    async fn test_index_and_answer_reflectively() {
        let backend = MockBackend::new(respond);
        let engine = engine(backend.clone(), config()).await;

        let stored = engine
            .index_text("geo.txt", "  Paris is the capital\n of France.  ", Deadline::none())
            .await
            .unwrap();
        assert_eq!(stored, 1);
        engine
            .index_text("fruit.txt", "Bananas are yellow.", Deadline::none())
            .await
            .unwrap();
        assert_eq!(engine.store().len(), 2);

        let answer = engine
            .answer("What is the capital of France?", &[], Deadline::none())
            .await
            .unwrap();

        assert_eq!(answer.strategy, Strategy::Reflective);
        assert_eq!(answer.citations().len(), 1);
        assert_eq!(answer.citations()[0].label(), "S1");
        assert_eq!(answer.citations()[0].text(), "Paris is the capital of France.");
        assert!(answer.text.contains("Paris"));
        assert!(answer.text.contains("[S1]"));
        assert!(answer.assessment.success);

        let with_refs = answer.with_references();
        assert!(with_refs.contains("## References"));
        assert!(with_refs.contains("- [S1] geo.txt (chunk 0)"));

        let report = engine.performance_report().await;
        assert_eq!(report.insights, 1);
    }

    #[tokio::test]
    async fn test_short_query_without_context_uses_fast_path() {
        let backend = MockBackend::new(respond);
        let engine = engine(backend.clone(), config()).await;

        let answer = engine
            .answer("Tell me a fact", &[], Deadline::none())
            .await
            .unwrap();

        assert_eq!(answer.strategy, Strategy::Fast);
        assert!(answer.citations().is_empty());
        // draft + assessment + extraction
        assert_eq!(backend.call_count(), 3);
        assert!(!answer.text.starts_with(NOT_FOUND_NOTE));
    }

    #[tokio::test]
    async fn test_general_knowledge_answer_gets_disclaimer() {
        let backend = MockBackend::new(|req| {
            if req.system_prompt == ASSESSOR {
                Ok(r#"{"overall": 0.5}"#.into())
            } else {
                Ok("The Treaty of Westphalia was signed in 1648 and ended the Thirty Years' War.".into())
            }
        });
        let engine = engine(backend, config()).await;

        let answer = engine
            .answer_with("When was Westphalia signed?", &[], Strategy::Fast, Deadline::none())
            .await
            .unwrap();
        assert!(answer.text.starts_with(NOT_FOUND_NOTE));
    }

    #[tokio::test]
    async fn test_forced_ensemble() {
        let backend = MockBackend::new(respond);
        let mut engine = engine(backend.clone(), config()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.set_progress_channel(tx);

        engine
            .index_text("geo.txt", "Paris is the capital of France.", Deadline::none())
            .await
            .unwrap();

        let answer = engine
            .answer_with(
                "What is the capital of France?",
                &[],
                Strategy::Ensemble,
                Deadline::none(),
            )
            .await
            .unwrap();

        assert_eq!(answer.text, "Synthesized: Paris [S1].");
        assert_eq!(answer.recommendation.source, RecommendationSource::Requested);
        assert_eq!(answer.agent_responses.len(), 3);
        assert!(matches!(rx.try_recv(), Ok(EnsembleProgress::Started(3))));
    }

    #[tokio::test]
    async fn test_embedding_outage_is_a_request_failure() {
        let backend = MockBackend::failing_embedder();
        let engine = engine(backend, config()).await;

        let err = engine
            .answer("anything at all", &[], Deadline::none())
            .await
            .unwrap_err();
        assert!(err.is_backend());
    }
}
