//! Strategy selection and self-assessment.
//!
//! The selector picks `fast`, `reflective` or `ensemble` for each query from
//! learned insights first and fixed heuristics second, then scores the answer
//! it got back and feeds that outcome into the insight log.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;

use crate::backend::{Deadline, GenerateRequest, GenerationOptions, Generator};
use crate::citations;
use crate::config::MetacognitionConfig;
use crate::context::ContextPacket;
use crate::error::{Error, Result};
use crate::insights::{normalize_pattern, Insight, InsightLog};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Strategy {
    Fast,
    Reflective,
    Ensemble,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Fast => "fast",
            Strategy::Reflective => "reflective",
            Strategy::Ensemble => "ensemble",
        }
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fast" => Ok(Strategy::Fast),
            "reflective" | "reflection" => Ok(Strategy::Reflective),
            "ensemble" | "multi-agent" | "multi_agent" => Ok(Strategy::Ensemble),
            other => Err(format!("unknown strategy: {}", other)),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecommendationSource {
    /// A learned insight with a high enough success rate matched the query.
    Insight { pattern: String, success_rate: f64 },
    Heuristic,
    /// The caller picked the strategy.
    Requested,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Recommendation {
    pub strategy: Strategy,
    pub source: RecommendationSource,
}

/// Per-dimension scores returned by the assessment call.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QualityScores {
    #[serde(default)]
    pub accuracy: Option<f64>,
    #[serde(default)]
    pub completeness: Option<f64>,
    #[serde(default)]
    pub clarity: Option<f64>,
    #[serde(default)]
    pub uncertainty_handling: Option<f64>,
    pub overall: f64,
    #[serde(default)]
    pub reasoning: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssessmentSource {
    Model,
    Heuristic,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub overall: f64,
    pub success: bool,
    pub source: AssessmentSource,
    pub scores: Option<QualityScores>,
}

#[derive(Debug, Deserialize)]
struct ExtractedInsight {
    pattern: String,
    #[serde(default)]
    #[allow(dead_code)]
    strategy: String,
    #[serde(default)]
    #[allow(dead_code)]
    generalization: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StrategyPerformance {
    pub strategy: String,
    pub successes: u32,
    pub failures: u32,
    pub total_latency: Duration,
}

impl StrategyPerformance {
    fn new(strategy: &str) -> Self {
        Self {
            strategy: strategy.to_string(),
            successes: 0,
            failures: 0,
            total_latency: Duration::ZERO,
        }
    }

    fn record(&mut self, success: bool, latency: Duration) {
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.total_latency += latency;
    }

    pub fn total(&self) -> u32 {
        self.successes + self.failures
    }

    /// Share of successful runs; 0.5 before anything was recorded.
    pub fn success_rate(&self) -> f64 {
        match self.total() {
            0 => 0.5,
            n => self.successes as f64 / n as f64,
        }
    }

    pub fn avg_latency(&self) -> Duration {
        match self.total() {
            0 => Duration::ZERO,
            n => self.total_latency / n,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceReport {
    pub strategies: Vec<StrategyPerformance>,
    pub insights: usize,
}

impl fmt::Display for PerformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== META-COGNITION PERFORMANCE ===")?;
        writeln!(f)?;
        writeln!(f, "Strategy Performance:")?;
        if self.strategies.is_empty() {
            writeln!(f, "  (no outcomes recorded)")?;
        }
        for perf in &self.strategies {
            writeln!(
                f,
                "  {}: {:.1}% success ({}/{}), avg {:.1}s",
                perf.strategy,
                perf.success_rate() * 100.0,
                perf.successes,
                perf.total(),
                perf.avg_latency().as_secs_f64()
            )?;
        }
        writeln!(f)?;
        writeln!(f, "Insights Learned: {}", self.insights)
    }
}

/// Slice the first balanced JSON object out of a model reply. Braces inside
/// strings are skipped, and anything after the object is ignored.
fn extract_json_object(text: &str) -> Result<&str> {
    if let Some(start) = text.find('{') {
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escape = false;

        for (i, ch) in text[start..].char_indices() {
            if escape {
                escape = false;
                continue;
            }
            match ch {
                '\\' if in_string => escape = true,
                '"' => in_string = !in_string,
                '{' if !in_string => depth += 1,
                '}' if !in_string => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(&text[start..start + i + 1]);
                    }
                }
                _ => {}
            }
        }
    }
    Err(Error::MalformedAssessment(format!(
        "no JSON object in response: {:?}",
        text.chars().take(80).collect::<String>()
    )))
}

pub fn parse_assessment(text: &str) -> Result<QualityScores> {
    let scores: QualityScores = serde_json::from_str(extract_json_object(text)?)
        .map_err(|e| Error::MalformedAssessment(e.to_string()))?;
    if !(0.0..=1.0).contains(&scores.overall) {
        return Err(Error::MalformedAssessment(format!(
            "overall score {} outside [0, 1]",
            scores.overall
        )));
    }
    Ok(scores)
}

fn parse_extraction(text: &str) -> Result<ExtractedInsight> {
    let extracted: ExtractedInsight = serde_json::from_str(extract_json_object(text)?)
        .map_err(|e| Error::MalformedAssessment(e.to_string()))?;
    if extracted.pattern.trim().is_empty() {
        return Err(Error::MalformedAssessment("empty insight pattern".to_string()));
    }
    Ok(extracted)
}

/// Deterministic quality score used when the assessment call fails.
pub fn heuristic_quality(answer: &str) -> f64 {
    if answer.trim().is_empty() {
        return 0.0;
    }

    let mut score: f64 = 0.5;

    if citations::has_citations(answer) {
        score += 0.15;
    }

    let len = answer.chars().count();
    if len > 100 && len < 3000 {
        score += 0.15;
    }

    let lower = answer.to_lowercase();
    if lower.contains("because") || lower.contains("therefore") {
        score += 0.1;
    }

    if lower.contains("not found") || lower.contains("unclear") {
        score += 0.1;
    }

    score.min(1.0)
}

fn is_small_talk(query: &str) -> bool {
    let q = query.trim().to_lowercase();
    let first = q
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .find(|w| !w.is_empty())
        .unwrap_or_default();

    matches!(
        first,
        "hi" | "hello" | "hey" | "greetings" | "thanks" | "thank" | "thx" | "ok" | "okay"
    ) || q.starts_with("good morning")
        || q.starts_with("good afternoon")
        || q.starts_with("good evening")
        || q.starts_with("how are you")
        || q.starts_with("what's up")
        || q.starts_with("got it")
}

fn significant_words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 3)
        .map(|w| w.to_lowercase())
        .collect()
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

pub struct StrategySelector {
    generator: Arc<dyn Generator>,
    log: Arc<InsightLog>,
    config: MetacognitionConfig,
    context_window: usize,
    insights: RwLock<Vec<Insight>>,
    performance: Mutex<BTreeMap<String, StrategyPerformance>>,
}

impl StrategySelector {
    /// Build a selector and rebuild its in-memory state from `log`.
    pub async fn open(
        generator: Arc<dyn Generator>,
        log: Arc<InsightLog>,
        config: MetacognitionConfig,
        context_window: usize,
    ) -> Result<Self> {
        let insights = log.load_insights().await?;
        let mut performance = BTreeMap::new();
        for outcome in log.load_outcomes().await? {
            performance
                .entry(outcome.strategy.clone())
                .or_insert_with(|| StrategyPerformance::new(&outcome.strategy))
                .record(outcome.success, outcome.latency);
        }

        tracing::info!(
            "[Metacognition] Loaded {} insights and {} strategy records",
            insights.len(),
            performance.len()
        );

        Ok(Self {
            generator,
            log,
            config,
            context_window,
            insights: RwLock::new(insights),
            performance: Mutex::new(performance),
        })
    }

    fn options(&self, temperature: f32) -> GenerationOptions {
        GenerationOptions {
            temperature,
            context_window: self.context_window,
        }
    }

    fn is_relevant(&self, query_words: &[String], insight: &Insight) -> bool {
        let pattern_words = significant_words(&insight.pattern);
        let overlap = query_words
            .iter()
            .map(|qw| pattern_words.iter().filter(|pw| pw.contains(qw.as_str())).count())
            .sum::<usize>();
        overlap > 1 || insight.success_rate > self.config.relevance_success_rate
    }

    /// Insights that match `query`, best success rate first.
    pub async fn relevant_insights(&self, query: &str) -> Vec<Insight> {
        let query_words = significant_words(query);
        let insights = self.insights.read().await;
        let mut relevant: Vec<Insight> = insights
            .iter()
            .filter(|i| self.is_relevant(&query_words, i))
            .cloned()
            .collect();
        relevant.sort_by(|a, b| b.success_rate.total_cmp(&a.success_rate));
        relevant.truncate(self.config.max_relevant);
        relevant
    }

    pub async fn recommend_strategy(&self, query: &str, packet: &ContextPacket) -> Recommendation {
        if let Some(best) = self.relevant_insights(query).await.into_iter().next() {
            if best.success_rate > self.config.recommend_threshold {
                match best.strategy.parse::<Strategy>() {
                    Ok(strategy) => {
                        tracing::info!(
                            "Recommending {} from insight {:?} ({:.2})",
                            strategy,
                            best.pattern,
                            best.success_rate
                        );
                        return Recommendation {
                            strategy,
                            source: RecommendationSource::Insight {
                                pattern: best.pattern,
                                success_rate: best.success_rate,
                            },
                        };
                    }
                    Err(e) => tracing::warn!("Ignoring insight {:?}: {}", best.pattern, e),
                }
            }
        }

        let strategy = self.heuristic_strategy(query, packet);
        tracing::info!("Recommending {} by heuristic", strategy);
        Recommendation {
            strategy,
            source: RecommendationSource::Heuristic,
        }
    }

    fn heuristic_strategy(&self, query: &str, packet: &ContextPacket) -> Strategy {
        if is_small_talk(query)
            || (query.chars().count() < self.config.fast_query_chars && packet.is_empty())
        {
            return Strategy::Fast;
        }
        if packet.char_len() > self.config.ensemble_context_chars
            || packet.len() >= self.config.ensemble_citations
        {
            return Strategy::Ensemble;
        }
        Strategy::Reflective
    }

    /// Score `answer`, record the outcome and update insights. Never fails:
    /// backend or parse problems fall back to [`heuristic_quality`].
    pub async fn assess_quality(
        &self,
        query: &str,
        packet: &ContextPacket,
        answer: &str,
        strategy: Strategy,
        latency: Duration,
        deadline: Deadline,
    ) -> Assessment {
        let (overall, source, scores) = match self.score(query, packet, answer, deadline).await {
            Ok(scores) => (scores.overall, AssessmentSource::Model, Some(scores)),
            Err(e) => {
                tracing::warn!("Quality assessment fell back to heuristic: {}", e);
                (heuristic_quality(answer), AssessmentSource::Heuristic, None)
            }
        };
        let success = overall > self.config.success_threshold;

        self.record_performance(strategy, success, latency).await;

        if success {
            match self.extract_pattern(query, answer, overall, deadline).await {
                Ok(pattern) => self.reinforce(&pattern, strategy, query, true).await,
                Err(e) => tracing::warn!("Insight extraction skipped: {}", e),
            }
        } else {
            self.penalize_relevant(query, strategy).await;
        }

        tracing::info!(
            "Assessed {} answer: {:.2} ({:?}, success: {})",
            strategy,
            overall,
            source,
            success
        );

        Assessment {
            overall,
            success,
            source,
            scores,
        }
    }

    async fn score(
        &self,
        query: &str,
        packet: &ContextPacket,
        answer: &str,
        deadline: Deadline,
    ) -> Result<QualityScores> {
        let context = if packet.is_empty() {
            "(none)".to_string()
        } else {
            truncate_chars(packet.as_str(), 500)
        };
        let prompt = format!(
            "Assess the quality of this reasoning.\n\n\
             QUERY: {}\n\n\
             CONTEXT AVAILABLE:\n{}\n\n\
             ANSWER PRODUCED:\n{}\n\n\
             Rate the answer on these dimensions (0-1 scale):\n\
             1. Accuracy: are facts correct and properly cited?\n\
             2. Completeness: does it fully address the query?\n\
             3. Clarity: is it well structured and understandable?\n\
             4. Uncertainty handling: does it acknowledge what it doesn't know?\n\n\
             Return ONLY a JSON object:\n\
             {{\"accuracy\": 0.0, \"completeness\": 0.0, \"clarity\": 0.0, \"uncertainty_handling\": 0.0, \"overall\": 0.0, \"reasoning\": \"brief explanation\"}}",
            query, context, answer
        );

        let request = GenerateRequest::new("You are a rigorous quality assessor.", self.options(0.1))
            .with_user(prompt);
        let reply = self.generator.generate(&request, deadline).await?;
        parse_assessment(&reply)
    }

    async fn extract_pattern(
        &self,
        query: &str,
        answer: &str,
        quality: f64,
        deadline: Deadline,
    ) -> Result<String> {
        let prompt = format!(
            "Analyze this successful interaction and extract a generalizable insight.\n\n\
             QUERY: {}\n\
             ANSWER (quality: {:.2}): {}\n\n\
             What kind of query is this, and what made the answer work?\n\n\
             Return ONLY a JSON object:\n\
             {{\"pattern\": \"short description of the query type\", \"strategy\": \"what approach worked\", \"generalization\": \"how to apply this broadly\"}}",
            query,
            quality,
            truncate_chars(answer, 500)
        );

        let request = GenerateRequest::new(
            "You are a meta-learning system extracting insights.",
            self.options(0.2),
        )
        .with_user(prompt);
        let reply = self.generator.generate(&request, deadline).await?;
        Ok(parse_extraction(&reply)?.pattern.trim().to_string())
    }

    async fn record_performance(&self, strategy: Strategy, success: bool, latency: Duration) {
        {
            let mut performance = self
                .performance
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            performance
                .entry(strategy.as_str().to_string())
                .or_insert_with(|| StrategyPerformance::new(strategy.as_str()))
                .record(success, latency);
        }

        if let Err(e) = self.log.record_outcome(strategy.as_str(), success, latency).await {
            tracing::warn!("Failed to persist strategy outcome: {}", e);
        }
    }

    /// Add one outcome to the insight keyed by `(pattern, strategy)`,
    /// creating it if it doesn't exist yet, and append the new version.
    async fn reinforce(&self, pattern: &str, strategy: Strategy, example: &str, success: bool) {
        let key = (normalize_pattern(pattern), strategy.as_str().to_string());
        let mut insights = self.insights.write().await;

        let updated = match insights.iter_mut().find(|i| i.key() == key) {
            Some(existing) => {
                existing.record(success);
                existing.clone()
            }
            None => {
                let insight = Insight::new(pattern, strategy.as_str(), example);
                insights.push(insight.clone());
                insight
            }
        };

        if let Err(e) = self.log.append_insight(&updated).await {
            tracing::warn!("Failed to persist insight {:?}: {}", updated.pattern, e);
        }
    }

    /// A failed answer counts against every relevant insight that advised
    /// the strategy which was used.
    async fn penalize_relevant(&self, query: &str, strategy: Strategy) {
        let relevant = self.relevant_insights(query).await;
        for insight in relevant
            .into_iter()
            .filter(|i| i.strategy.parse::<Strategy>().ok() == Some(strategy))
        {
            tracing::debug!("Penalizing insight {:?}", insight.pattern);
            self.reinforce(&insight.pattern, strategy, &insight.example, false)
                .await;
        }
    }

    pub async fn insights(&self) -> Vec<Insight> {
        self.insights.read().await.clone()
    }

    pub async fn performance_report(&self) -> PerformanceReport {
        let insights = self.insights.read().await.len();
        let performance = self
            .performance
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        PerformanceReport {
            strategies: performance.values().cloned().collect(),
            insights,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;
    use crate::vector_store::Chunk;

    const ASSESSOR: &str = "You are a rigorous quality assessor.";

    fn good_backend() -> Arc<MockBackend> {
        MockBackend::new(|req| {
            if req.system_prompt == ASSESSOR {
                Ok(r#"Here you go: {"accuracy": 0.9, "completeness": 0.9, "clarity": 0.8, "uncertainty_handling": 0.7, "overall": 0.9, "reasoning": "cited"}"#.into())
            } else {
                Ok(r#"{"pattern": "definitional questions", "strategy": "reflect", "generalization": "define then cite"}"#.into())
            }
        })
    }

    async fn selector(backend: Arc<MockBackend>, log: Arc<InsightLog>) -> StrategySelector {
        StrategySelector::open(backend, log, MetacognitionConfig::default(), 8192)
            .await
            .unwrap()
    }

    fn packet(n: usize) -> ContextPacket {
        let hits = (0..n)
            .map(|i| {
                (
                    Arc::new(Chunk {
                        source_id: format!("doc{}", i),
                        chunk_index: 0,
                        text: "Some reference text.".into(),
                        vector: vec![1.0],
                    }),
                    1.0,
                )
            })
            .collect();
        ContextPacket::assemble(hits, 100_000)
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!("fast".parse::<Strategy>(), Ok(Strategy::Fast));
        assert_eq!("Reflection".parse::<Strategy>(), Ok(Strategy::Reflective));
        assert_eq!("multi-agent".parse::<Strategy>(), Ok(Strategy::Ensemble));
        assert!("slow".parse::<Strategy>().is_err());
        assert_eq!(Strategy::Ensemble.to_string(), "ensemble");
    }

    #[test]
    fn test_parse_assessment() {
        let s = parse_assessment("```json\n{\"overall\": 0.82, \"reasoning\": \"ok\"}\n```").unwrap();
        assert!((s.overall - 0.82).abs() < 1e-9);
        assert_eq!(s.accuracy, None);

        assert!(matches!(
            parse_assessment("no json here"),
            Err(Error::MalformedAssessment(_))
        ));
        assert!(parse_assessment("{\"accuracy\": 0.5}").is_err());
        assert!(parse_assessment("{\"overall\": 7}").is_err());
    }

    #[test]
    fn test_assessment_followed_by_prose_braces() {
        let reply = "{\"overall\": 0.8, \"reasoning\": \"uses {braces} and \\\"quotes\\\"\"}\n\
                     Note: the {placeholder} above is literal.";
        let s = parse_assessment(reply).unwrap();
        assert!((s.overall - 0.8).abs() < 1e-9);
        assert_eq!(s.reasoning, "uses {braces} and \"quotes\"");

        assert!(parse_assessment("{\"overall\": 0.8").is_err());
    }

    #[test]
    fn test_heuristic_quality() {
        assert_eq!(heuristic_quality("  "), 0.0);
        assert!((heuristic_quality("Paris.") - 0.5).abs() < 1e-9);
        let answer = format!("Paris [S1] because {}", "detail ".repeat(20));
        assert!((heuristic_quality(&answer) - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_heuristic_recommendations() {
        let sel = selector(good_backend(), Arc::new(InsightLog::open_in_memory().unwrap())).await;

        let fast = sel.recommend_strategy("What is 2+2?", &ContextPacket::empty()).await;
        assert_eq!(fast.strategy, Strategy::Fast);
        assert_eq!(fast.source, RecommendationSource::Heuristic);

        let greeting = sel
            .recommend_strategy("Hello there, how is the project going today?", &packet(1))
            .await;
        assert_eq!(greeting.strategy, Strategy::Fast);

        let rich = sel
            .recommend_strategy("Compare the three approaches described here", &packet(3))
            .await;
        assert_eq!(rich.strategy, Strategy::Ensemble);

        let default = sel
            .recommend_strategy("Explain how the indexing pipeline handles overlap", &packet(1))
            .await;
        assert_eq!(default.strategy, Strategy::Reflective);
    }

    #[tokio::test]
    async fn test_learned_insight_overrides_heuristic() {
        let log = Arc::new(InsightLog::open_in_memory().unwrap());
        let sel = selector(good_backend(), log.clone()).await;
        let query = "definitional questions?";

        let before = sel.recommend_strategy(query, &ContextPacket::empty()).await;
        assert_eq!(before.strategy, Strategy::Fast);

        for _ in 0..5 {
            let a = sel
                .assess_quality(
                    "What is a monad, in definitional terms?",
                    &ContextPacket::empty(),
                    "A monad is ... [S1]",
                    Strategy::Reflective,
                    Duration::from_millis(900),
                    Deadline::none(),
                )
                .await;
            assert!(a.success);
            assert_eq!(a.source, AssessmentSource::Model);
        }

        let insights = sel.insights().await;
        assert_eq!(insights.len(), 1);
        assert_eq!(insights[0].occurrences, 5);
        assert_eq!(insights[0].strategy, "reflective");
        assert!((insights[0].success_rate - 0.9).abs() < 1e-9);

        let after = sel.recommend_strategy(query, &ContextPacket::empty()).await;
        assert_eq!(after.strategy, Strategy::Reflective);
        assert!(matches!(after.source, RecommendationSource::Insight { .. }));

        // Same answer after a restart from the durable log.
        let reopened = selector(good_backend(), log).await;
        let again = reopened.recommend_strategy(query, &ContextPacket::empty()).await;
        assert_eq!(again.strategy, Strategy::Reflective);
        let report = reopened.performance_report().await;
        assert_eq!(report.insights, 1);
        assert_eq!(report.strategies[0].successes, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_assessments_lose_no_records() {
        const RUNS: usize = 8;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.sqlite");

        {
            let log = Arc::new(InsightLog::open(&path).unwrap());
            let sel = Arc::new(selector(good_backend(), log).await);

            let handles: Vec<_> = (0..RUNS)
                .map(|i| {
                    let sel = sel.clone();
                    tokio::spawn(async move {
                        sel.assess_quality(
                            &format!("What is a monad, definitional question {}?", i),
                            &ContextPacket::empty(),
                            "A monad is ... [S1]",
                            Strategy::Reflective,
                            Duration::from_millis(100),
                            Deadline::none(),
                        )
                        .await
                    })
                })
                .collect();
            for handle in handles {
                assert!(handle.await.unwrap().success);
            }

            let insights = sel.insights().await;
            assert_eq!(insights.len(), 1);
            assert_eq!(insights[0].occurrences as usize, RUNS);
            assert_eq!(sel.performance_report().await.strategies[0].successes as usize, RUNS);
        }

        let log = InsightLog::open(&path).unwrap();
        assert_eq!(log.load_outcomes().await.unwrap().len(), RUNS);
        let reloaded = log.load_insights().await.unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded[0].occurrences as usize, RUNS);

        let rows: i64 = rusqlite::Connection::open(&path)
            .unwrap()
            .query_row("SELECT COUNT(*) FROM insights", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows as usize, RUNS);
    }

    #[tokio::test]
    async fn test_backend_failure_uses_heuristic() {
        let backend = MockBackend::new(|_| Err(Error::backend(anyhow::anyhow!("offline"))));
        let sel = selector(backend, Arc::new(InsightLog::open_in_memory().unwrap())).await;

        let a = sel
            .assess_quality(
                "q",
                &ContextPacket::empty(),
                "short",
                Strategy::Fast,
                Duration::from_millis(10),
                Deadline::none(),
            )
            .await;

        assert_eq!(a.source, AssessmentSource::Heuristic);
        assert!((a.overall - 0.5).abs() < 1e-9);
        assert!(!a.success);
        let report = sel.performance_report().await;
        assert_eq!(report.strategies[0].failures, 1);
    }

    #[tokio::test]
    async fn test_malformed_assessment_uses_heuristic() {
        let backend = MockBackend::new(|_| Ok("I think it's pretty good!".into()));
        let sel = selector(backend, Arc::new(InsightLog::open_in_memory().unwrap())).await;

        let a = sel
            .assess_quality(
                "q",
                &ContextPacket::empty(),
                "answer",
                Strategy::Reflective,
                Duration::ZERO,
                Deadline::none(),
            )
            .await;
        assert_eq!(a.source, AssessmentSource::Heuristic);
        assert!(a.scores.is_none());
    }

    #[tokio::test]
    async fn test_failures_decay_relevant_insight() {
        let log = Arc::new(InsightLog::open_in_memory().unwrap());
        let mut seeded = Insight::new("definitional questions", "reflective", "What is X?");
        seeded.success_rate = 0.9;
        seeded.occurrences = 5;
        log.append_insight(&seeded).await.unwrap();

        let backend = MockBackend::new(|_| Ok(r#"{"overall": 0.2}"#.into()));
        let sel = selector(backend, log).await;

        sel.assess_quality(
            "definitional questions again",
            &ContextPacket::empty(),
            "bad",
            Strategy::Reflective,
            Duration::ZERO,
            Deadline::none(),
        )
        .await;

        let insights = sel.insights().await;
        assert_eq!(insights[0].occurrences, 6);
        assert!((insights[0].success_rate - 0.75).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_performance_report_format() {
        let sel = selector(good_backend(), Arc::new(InsightLog::open_in_memory().unwrap())).await;
        sel.record_performance(Strategy::Fast, true, Duration::from_millis(1000))
            .await;
        sel.record_performance(Strategy::Fast, false, Duration::from_millis(3000))
            .await;

        let text = sel.performance_report().await.to_string();
        assert!(text.contains("fast: 50.0% success (1/2), avg 2.0s"));
        assert!(text.contains("Insights Learned: 0"));
    }
}
