//! The Insights Engine (C9): canned compositions of C6 tools that gather
//! numbers, hand them to the LLM Adapter for narrative generation, and cache
//! the result by `(insight_type, normalized_parameters)`.

use crate::error::{CoreError, Result};
use crate::llm::{LlmAdapter, Message};
use crate::store::Store;
use crate::tools::ToolRegistry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InsightKind {
    RevenueTrends,
    ExpenseAnalysis,
    CashFlow,
    SeasonalPatterns,
    QuarterlyPerformance,
    ComprehensiveSummary,
}

impl InsightKind {
    fn as_str(&self) -> &'static str {
        match self {
            InsightKind::RevenueTrends => "revenue-trends",
            InsightKind::ExpenseAnalysis => "expense-analysis",
            InsightKind::CashFlow => "cash-flow",
            InsightKind::SeasonalPatterns => "seasonal-patterns",
            InsightKind::QuarterlyPerformance => "quarterly-performance",
            InsightKind::ComprehensiveSummary => "comprehensive-summary",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsightParams {
    pub start: String,
    pub end: String,
    pub year: Option<i32>,
}

impl InsightParams {
    /// A stable string key used for cache lookups; field order is fixed so
    /// equivalent parameter sets always normalize to the same key.
    fn normalized(&self) -> String {
        format!("start={}|end={}|year={}", self.start, self.end, self.year.map(|y| y.to_string()).unwrap_or_default())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    pub insight_type: String,
    pub period: String,
    pub narrative: String,
    pub key_findings: Vec<String>,
    pub recommendations: Vec<String>,
    pub data_points: Value,
    pub generated_at: DateTime<Utc>,
}

#[derive(Clone)]
struct CachedInsight {
    insight: Insight,
    cached_at: Instant,
}

/// Generates the canned narrative compositions. Each composition reads raw
/// numbers through the tool registry (never touching the Store directly),
/// assembles a `data_points` dict, and asks the LLM Adapter for prose.
pub struct InsightsEngine {
    store: std::sync::Arc<dyn Store>,
    tools: std::sync::Arc<ToolRegistry>,
    llm: std::sync::Arc<LlmAdapter>,
    cache: Mutex<HashMap<(InsightKind, String), CachedInsight>>,
    ttl: Duration,
}

impl InsightsEngine {
    pub fn new(
        store: std::sync::Arc<dyn Store>,
        tools: std::sync::Arc<ToolRegistry>,
        llm: std::sync::Arc<LlmAdapter>,
        cache_ttl: Duration,
    ) -> Self {
        InsightsEngine { store, tools, llm, cache: Mutex::new(HashMap::new()), ttl: cache_ttl }
    }

    pub fn clear_cache(&self) {
        self.cache.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    fn cached(&self, kind: InsightKind, key: &str) -> Option<Insight> {
        let cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        cache.get(&(kind, key.to_string())).and_then(|entry| {
            if entry.cached_at.elapsed() < self.ttl {
                Some(entry.insight.clone())
            } else {
                None
            }
        })
    }

    fn store_cache(&self, kind: InsightKind, key: String, insight: Insight) {
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        cache.insert((kind, key), CachedInsight { insight, cached_at: Instant::now() });
    }

    pub async fn generate(&self, kind: InsightKind, params: InsightParams) -> Result<Insight> {
        let cache_key = params.normalized();
        if let Some(hit) = self.cached(kind, &cache_key) {
            log::debug!("insight cache hit for {} / {}", kind.as_str(), cache_key);
            return Ok(hit);
        }

        let data_points = self.collect_data_points(kind, &params).await?;
        let narrative_prompt = self.prompt_for(kind, &params, &data_points);

        let reply = self
            .llm
            .chat(
                &[
                    Message::system("You write concise, numbers-grounded financial narratives from structured data. Never invent figures not present in the data."),
                    Message::user(narrative_prompt),
                ],
                &[],
            )
            .await;

        let narrative = match reply {
            Ok(r) => r.assistant_text.unwrap_or_default(),
            Err(CoreError::LLMUnavailable(reason)) => {
                log::warn!("insight narrative unavailable, falling back to data-only summary: {reason}");
                format!("Narrative unavailable; see data_points for the underlying figures ({reason}).")
            }
            Err(e) => return Err(e),
        };

        let insight = Insight {
            insight_type: kind.as_str().to_string(),
            period: format!("{}..{}", params.start, params.end),
            narrative,
            key_findings: extract_bullets(&data_points, "key_findings"),
            recommendations: extract_bullets(&data_points, "recommendations"),
            data_points,
            generated_at: Utc::now(),
        };

        self.store_cache(kind, cache_key, insight.clone());
        Ok(insight)
    }

    async fn collect_data_points(&self, kind: InsightKind, params: &InsightParams) -> Result<Value> {
        match kind {
            InsightKind::RevenueTrends => {
                let revenue = self
                    .tools
                    .execute(self.store.as_ref(), "get_revenue_by_period", json!({ "start_date": params.start, "end_date": params.end }))
                    .await?;
                let growth = self
                    .tools
                    .execute(
                        self.store.as_ref(),
                        "calculate_growth_rate",
                        json!({ "metric": "revenue", "periods": [period_year(&params.start), period_year(&params.end)] }),
                    )
                    .await
                    .unwrap_or(json!({}));
                Ok(json!({ "revenue": revenue, "growth": growth }))
            }
            InsightKind::ExpenseAnalysis => {
                let expenses = self
                    .tools
                    .execute(self.store.as_ref(), "get_expenses_by_period", json!({ "start_date": params.start, "end_date": params.end }))
                    .await?;
                let trends = self
                    .tools
                    .execute(self.store.as_ref(), "analyze_expense_trends", json!({ "start": params.start, "end": params.end }))
                    .await?;
                let categories = self
                    .tools
                    .execute(self.store.as_ref(), "get_expense_categories", json!({ "start": params.start, "end": params.end }))
                    .await?;
                Ok(json!({ "expenses": expenses, "trends": trends, "categories": categories }))
            }
            InsightKind::CashFlow => {
                let revenue = self
                    .tools
                    .execute(self.store.as_ref(), "get_revenue_by_period", json!({ "start_date": params.start, "end_date": params.end }))
                    .await?;
                let expenses = self
                    .tools
                    .execute(self.store.as_ref(), "get_expenses_by_period", json!({ "start_date": params.start, "end_date": params.end }))
                    .await?;
                Ok(json!({ "revenue": revenue, "expenses": expenses }))
            }
            InsightKind::SeasonalPatterns => {
                let start_year = period_year(&params.start).parse::<i32>().unwrap_or(Utc::now().date_naive().format("%Y").to_string().parse().unwrap_or(0));
                let end_year = period_year(&params.end).parse::<i32>().unwrap_or(start_year);
                let years: Vec<i32> = (start_year..=end_year).collect();
                let patterns = self
                    .tools
                    .execute(self.store.as_ref(), "analyze_seasonal_patterns", json!({ "metric": "revenue", "years": years }))
                    .await?;
                Ok(json!({ "seasonal_patterns": patterns }))
            }
            InsightKind::QuarterlyPerformance => {
                let year = params.year.unwrap_or_else(|| period_year(&params.start).parse().unwrap_or(0));
                let performance = self
                    .tools
                    .execute(self.store.as_ref(), "get_quarterly_performance", json!({ "year": year, "metric": "revenue" }))
                    .await?;
                Ok(json!({ "quarterly_performance": performance }))
            }
            InsightKind::ComprehensiveSummary => {
                let revenue = self
                    .tools
                    .execute(self.store.as_ref(), "get_revenue_by_period", json!({ "start_date": params.start, "end_date": params.end }))
                    .await?;
                let expenses = self
                    .tools
                    .execute(self.store.as_ref(), "get_expenses_by_period", json!({ "start_date": params.start, "end_date": params.end }))
                    .await?;
                let anomalies = self
                    .tools
                    .execute(
                        self.store.as_ref(),
                        "detect_anomalies",
                        json!({ "metric": "revenue", "threshold": 0.2, "lookback_months": 12 }),
                    )
                    .await
                    .unwrap_or(json!({}));
                Ok(json!({ "revenue": revenue, "expenses": expenses, "anomalies": anomalies }))
            }
        }
    }

    fn prompt_for(&self, kind: InsightKind, params: &InsightParams, data_points: &Value) -> String {
        format!(
            "Write a {} report for the period {} to {}. Base every claim strictly on this data:\n{}",
            kind.as_str(),
            params.start,
            params.end,
            data_points
        )
    }
}

fn period_year(date: &str) -> String {
    date.split('-').next().unwrap_or(date).to_string()
}

fn extract_bullets(data_points: &Value, field: &str) -> Vec<String> {
    data_points
        .get(field)
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatReply, LlmProvider, StopReason, ToolDeclaration, Usage};
    use crate::model::{FinancialRecord, RecordId, Source};
    use crate::money::Money;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::Arc;

    struct StaticNarrative;

    #[async_trait]
    impl LlmProvider for StaticNarrative {
        async fn chat(&self, _messages: &[Message], _tools: &[ToolDeclaration]) -> Result<ChatReply> {
            Ok(ChatReply {
                assistant_text: Some("Revenue held steady across the period.".into()),
                tool_calls: vec![],
                usage: Usage::default(),
                stop_reason: StopReason::EndTurn,
            })
        }
    }

    async fn seeded_engine() -> InsightsEngine {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        store
            .upsert_record(
                FinancialRecord {
                    id: RecordId("r1".into()),
                    source: Source::DialectA,
                    period_start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                    period_end: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
                    currency: "USD".into(),
                    revenue: Money::from_f64(10000.0),
                    expenses: Money::from_f64(6000.0),
                    net_profit: Money::from_f64(4000.0),
                    raw_data: json!({}),
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                },
                vec![],
                vec![],
            )
            .await
            .unwrap();

        let llm = Arc::new(LlmAdapter::with_provider(Arc::new(StaticNarrative), Duration::from_secs(5)));
        InsightsEngine::new(store, Arc::new(ToolRegistry::new()), llm, Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn generates_and_caches_an_insight() {
        let engine = seeded_engine().await;
        let params = InsightParams { start: "2024-01-01".into(), end: "2024-01-31".into(), year: None };
        let first = engine.generate(InsightKind::RevenueTrends, params.clone()).await.unwrap();
        assert!(first.narrative.contains("Revenue"));

        let second = engine.generate(InsightKind::RevenueTrends, params).await.unwrap();
        assert_eq!(first.generated_at, second.generated_at, "second call should be served from cache");
    }

    #[tokio::test]
    async fn clear_cache_forces_regeneration() {
        let engine = seeded_engine().await;
        let params = InsightParams { start: "2024-01-01".into(), end: "2024-01-31".into(), year: None };
        let first = engine.generate(InsightKind::RevenueTrends, params.clone()).await.unwrap();
        engine.clear_cache();
        let second = engine.generate(InsightKind::RevenueTrends, params).await.unwrap();
        assert!(second.generated_at >= first.generated_at);
    }
}
