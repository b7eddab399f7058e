use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::Result;

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Lowercase, strip punctuation and collapse whitespace so that the same
/// pattern phrased with different spacing or casing maps to one insight.
pub fn normalize_pattern(pattern: &str) -> String {
    pattern
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// A learned (pattern, strategy, success-rate) record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub pattern: String,
    pub strategy: String,
    pub success_rate: f64,
    pub occurrences: u32,
    pub example: String,
    /// Milliseconds since the Unix epoch of the latest update.
    pub timestamp: i64,
}

impl Insight {
    pub fn new(pattern: impl Into<String>, strategy: impl Into<String>, example: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            strategy: strategy.into(),
            success_rate: 0.5,
            occurrences: 1,
            example: example.into(),
            timestamp: now_millis(),
        }
    }

    pub fn key(&self) -> (String, String) {
        (normalize_pattern(&self.pattern), self.strategy.clone())
    }

    /// Fold one more outcome into the running success rate.
    pub fn record(&mut self, success: bool) {
        let outcome = if success { 1.0 } else { 0.0 };
        let n = self.occurrences as f64;
        self.success_rate = (self.success_rate * n + outcome) / (n + 1.0);
        self.occurrences += 1;
        self.timestamp = now_millis();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeRecord {
    pub strategy: String,
    pub success: bool,
    pub latency: Duration,
}

/// Durable, append-only log of insight versions and strategy outcomes.
///
/// Rows are only ever inserted. An updated insight is a new row; readers
/// keep the latest row per `(normalized pattern, strategy)`.
pub struct InsightLog {
    db: Mutex<Connection>,
}

impl InsightLog {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::from_connection(Connection::open(db_path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(db: Connection) -> Result<Self> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS insights (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pattern TEXT NOT NULL,
                strategy TEXT NOT NULL,
                success_rate REAL NOT NULL,
                occurrences INTEGER NOT NULL,
                example TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            )",
            [],
        )?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS outcomes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                strategy TEXT NOT NULL,
                success INTEGER NOT NULL,
                latency_ms INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(Self { db: Mutex::new(db) })
    }

    pub async fn append_insight(&self, insight: &Insight) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO insights (pattern, strategy, success_rate, occurrences, example, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                insight.pattern,
                insight.strategy,
                insight.success_rate,
                insight.occurrences as i64,
                insight.example,
                insight.timestamp
            ],
        )?;
        tracing::debug!(
            "[Insights] Persisted {:?} -> {} ({:.2} over {})",
            insight.pattern,
            insight.strategy,
            insight.success_rate,
            insight.occurrences
        );
        Ok(())
    }

    pub async fn record_outcome(&self, strategy: &str, success: bool, latency: Duration) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO outcomes (strategy, success, latency_ms, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![strategy, success, latency.as_millis() as i64, now_millis()],
        )?;
        Ok(())
    }

    /// Current insights: the latest version of each, in first-seen order.
    pub async fn load_insights(&self) -> Result<Vec<Insight>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT pattern, strategy, success_rate, occurrences, example, timestamp
             FROM insights
             ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Insight {
                pattern: row.get(0)?,
                strategy: row.get(1)?,
                success_rate: row.get(2)?,
                occurrences: row.get::<_, i64>(3)?.max(0) as u32,
                example: row.get(4)?,
                timestamp: row.get(5)?,
            })
        })?;

        let mut insights: Vec<Insight> = Vec::new();
        let mut positions: HashMap<(String, String), usize> = HashMap::new();
        for row in rows {
            let insight = row?;
            match positions.get(&insight.key()) {
                Some(&i) => insights[i] = insight,
                None => {
                    positions.insert(insight.key(), insights.len());
                    insights.push(insight);
                }
            }
        }
        Ok(insights)
    }

    pub async fn load_outcomes(&self) -> Result<Vec<OutcomeRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare("SELECT strategy, success, latency_ms FROM outcomes ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(OutcomeRecord {
                strategy: row.get(0)?,
                success: row.get(1)?,
                latency: Duration::from_millis(row.get::<_, i64>(2)?.max(0) as u64),
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_pattern() {
        assert_eq!(
            normalize_pattern("  Definitional   Questions! "),
            "definitional questions"
        );
    }

    #[test]
    fn test_record_updates_running_rate() {
        let mut insight = Insight::new("definitional questions", "reflective", "What is X?");
        assert_eq!(insight.occurrences, 1);
        assert!((insight.success_rate - 0.5).abs() < 1e-9);

        insight.record(true);
        assert_eq!(insight.occurrences, 2);
        assert!((insight.success_rate - 0.75).abs() < 1e-9);

        insight.record(false);
        assert_eq!(insight.occurrences, 3);
        assert!((insight.success_rate - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_latest_version_wins() {
        let log = InsightLog::open_in_memory().unwrap();
        let mut insight = Insight::new("Definitional questions", "reflective", "What is Rust?");
        log.append_insight(&insight).await.unwrap();
        insight.record(true);
        log.append_insight(&insight).await.unwrap();
        log.append_insight(&Insight::new("comparisons", "ensemble", "A vs B"))
            .await
            .unwrap();

        let mut respelled = insight.clone();
        respelled.pattern = "definitional  QUESTIONS".into();
        respelled.record(true);
        log.append_insight(&respelled).await.unwrap();

        let loaded = log.load_insights().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].occurrences, 3);
        assert_eq!(loaded[1].strategy, "ensemble");
    }

    #[tokio::test]
    async fn test_same_pattern_different_strategy_kept_apart() {
        let log = InsightLog::open_in_memory().unwrap();
        log.append_insight(&Insight::new("math", "fast", "2+2")).await.unwrap();
        log.append_insight(&Insight::new("math", "reflective", "prove it"))
            .await
            .unwrap();
        assert_eq!(log.load_insights().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_log_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.sqlite");
        {
            let log = InsightLog::open(&path).unwrap();
            log.append_insight(&Insight::new("dates", "fast", "when?"))
                .await
                .unwrap();
            log.record_outcome("fast", true, Duration::from_millis(120))
                .await
                .unwrap();
            log.record_outcome("fast", false, Duration::from_millis(80))
                .await
                .unwrap();
        }

        let log = InsightLog::open(&path).unwrap();
        assert_eq!(log.load_insights().await.unwrap()[0].pattern, "dates");
        let outcomes = log.load_outcomes().await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].success);
        assert_eq!(outcomes[1].latency, Duration::from_millis(80));
    }
}
