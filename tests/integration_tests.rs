use async_trait::async_trait;
use chrono::NaiveDate;
use finunify::agent::AgentController;
use finunify::config::Config;
use finunify::dates::PeriodSpec;
use finunify::error::{CoreError, Result};
use finunify::ingestion::{FileStatus, Orchestrator};
use finunify::llm::{ChatReply, LlmAdapter, LlmProvider, Message, StopReason, ToolCall, ToolDeclaration, Usage};
use finunify::model::Source;
use finunify::parsers::ParsedInput;
use finunify::store::{InMemoryStore, RecordFilter, Store};
use finunify::validator::validate;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn write_json(dir: &tempfile::TempDir, name: &str, body: &serde_json::Value) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, body.to_string()).unwrap();
    path
}

fn dialect_a_year(revenue: f64, expenses: f64) -> serde_json::Value {
    let columns: Vec<serde_json::Value> = (1..=12u32)
        .map(|m| {
            let start = NaiveDate::from_ymd_opt(2024, m, 1).unwrap();
            let end = finunify::dates::last_day_of_month(2024, m);
            json!({
                "title": format!("{:04}-{:02}", 2024, m),
                "start_date": start,
                "end_date": end,
            })
        })
        .collect();
    let revenue_values: Vec<f64> = vec![revenue; 12];
    let expense_values: Vec<f64> = vec![expenses; 12];
    json!({
        "header": { "currency": "USD" },
        "columns": columns,
        "rows": [
            { "name": "Revenue", "group": "revenue", "values": revenue_values },
            { "name": "Expenses", "group": "expense", "values": expense_values }
        ]
    })
}

fn dialect_a_single_month(revenue: f64, expenses: f64) -> serde_json::Value {
    json!({
        "header": { "currency": "USD" },
        "columns": [
            { "title": "2024-01", "start_date": "2024-01-01", "end_date": "2024-01-31" }
        ],
        "rows": [
            { "name": "Revenue", "group": "revenue", "values": [revenue] },
            { "name": "Expenses", "group": "expense", "values": [expenses] }
        ]
    })
}

fn dialect_b_single_month(revenue: f64, expenses: f64) -> serde_json::Value {
    json!({
        "data": [
            {
                "period_start": "2024-01-01",
                "period_end": "2024-01-31",
                "currency_id": "USD",
                "revenue": [{ "name": "Sales", "value": revenue }],
                "operating-expenses": [{ "name": "Opex", "value": expenses }]
            }
        ]
    })
}

/// Scenario 1: perfect Dialect-A ingestion — one file, 12 monthly periods in
/// 2024, each with revenue 10000.00 and expenses 6000.00.
#[tokio::test]
async fn scenario_1_perfect_dialect_a_ingestion() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_json(&dir, "year.json", &dialect_a_year(10000.0, 6000.0));

    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let orchestrator = Orchestrator::new(Arc::clone(&store), Config::default());
    let result = orchestrator.ingest_file(&path, None).await;

    assert_eq!(result.status, FileStatus::Completed);
    assert_eq!(result.records_created, 12);
    assert!(result.validation_results.iter().all(|v| v.quality_score == 1.0));

    let page = store
        .find_records(RecordFilter { page: 1, page_size: 100, ..Default::default() })
        .await
        .unwrap();
    assert_eq!(page.total, 12);
    for record in &page.items {
        assert_eq!(record.net_profit, finunify::money::Money::from_f64(4000.0));
    }
}

/// Scenario 2: an imbalanced record (revenue=100, expenses=40, declared
/// net_profit=50, true diff is 60) fails `BAL_EQ` and is marked invalid —
/// the same `is_valid` gate `Orchestrator::run_file` checks before persisting.
#[tokio::test]
async fn scenario_2_imbalanced_record_is_rejected() {
    let imbalanced = ParsedInput {
        source: Source::DialectB,
        period_start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        period_end: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
        currency: "USD".to_string(),
        revenue: finunify::money::Money::from_f64(100.0),
        expenses: finunify::money::Money::from_f64(40.0),
        net_profit: finunify::money::Money::from_f64(50.0),
        disambiguator: "0".to_string(),
        accounts: vec![],
        values: vec![],
        raw: json!({}),
        issues: vec![],
    };

    let result = validate(&imbalanced, &[]);
    assert!(!result.is_valid);
    assert!(result.issues.iter().any(|i| i.code == "BAL_EQ"));
}

/// Scenario 3: two files cover 2024-01 in different dialects with revenues
/// 15000 (Dialect-A) and 14500 (Dialect-B). The higher-priority source
/// (Dialect-A) wins, and the conflict is attributed in `raw_data.conflicts`.
#[tokio::test]
async fn scenario_3_conflict_resolution_across_dialects() {
    let dir = tempfile::tempdir().unwrap();
    let path_a = write_json(&dir, "jan_a.json", &dialect_a_single_month(15000.0, 6000.0));
    let path_b = write_json(&dir, "jan_b.json", &dialect_b_single_month(14500.0, 6000.0));

    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let orchestrator = Orchestrator::new(Arc::clone(&store), Config::default());

    let first = orchestrator.ingest_file(&path_a, None).await;
    assert_eq!(first.status, FileStatus::Completed);
    let second = orchestrator.ingest_file(&path_b, None).await;
    assert_eq!(second.status, FileStatus::Completed);

    let page = store
        .find_records(RecordFilter { page: 1, page_size: 100, ..Default::default() })
        .await
        .unwrap();
    assert_eq!(page.total, 1, "same calendar period across dialects must merge into one record");

    let record = &page.items[0];
    assert_eq!(record.revenue, finunify::money::Money::from_f64(15000.0));
    let conflicts = record.raw_data.get("conflicts").and_then(|v| v.as_array()).cloned().unwrap_or_default();
    assert!(!conflicts.is_empty());
    assert_eq!(conflicts[0]["field"], json!("revenue"));
    assert_eq!(conflicts[0]["incoming_value"], json!("14500.00"));
}

struct ScriptedProvider {
    calls: AtomicUsize,
    replies: Vec<ChatReply>,
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat(&self, _messages: &[Message], _tools: &[ToolDeclaration]) -> Result<ChatReply> {
        let i = self.calls.fetch_add(1, Ordering::SeqCst);
        self.replies.get(i).cloned().ok_or_else(|| CoreError::LLMUnavailable("script exhausted".into()))
    }
}

fn tool_call_reply(name: &str, args: serde_json::Value) -> ChatReply {
    ChatReply {
        assistant_text: None,
        tool_calls: vec![ToolCall { id: "call-1".into(), name: name.into(), arguments_json: args }],
        usage: Usage::default(),
        stop_reason: StopReason::ToolCalls,
    }
}

fn final_reply(text: &str) -> ChatReply {
    ChatReply {
        assistant_text: Some(text.into()),
        tool_calls: vec![],
        usage: Usage::default(),
        stop_reason: StopReason::EndTurn,
    }
}

async fn seeded_agent(replies: Vec<ChatReply>) -> (AgentController, Arc<AtomicUsize>) {
    let dir = tempfile::tempdir().unwrap();
    let path = write_json(&dir, "year.json", &dialect_a_year(10000.0, 6000.0));
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let orchestrator = Orchestrator::new(Arc::clone(&store), Config::default());
    orchestrator.ingest_file(&path, None).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let provider = ScriptedProvider { calls: AtomicUsize::new(0), replies };
    let llm = Arc::new(LlmAdapter::with_provider(Arc::new(provider), Duration::from_secs(5)));
    let controller = AgentController::new(
        Arc::new(finunify::tools::ToolRegistry::new()),
        store,
        llm,
        &Config::default(),
    );
    (controller, calls)
}

/// Scenario 4: a simple query path. The store holds scenario 1's data; the
/// agent must invoke `get_revenue_by_period` and answer with the total.
#[tokio::test]
async fn scenario_4_query_path_invokes_revenue_tool() {
    let (controller, _calls) = seeded_agent(vec![
        tool_call_reply("get_revenue_by_period", json!({ "start_date": "2024-01-01", "end_date": "2024-03-31" })),
        final_reply("Total revenue for Q1 2024 was 30000.00."),
    ])
    .await;

    let result = controller
        .process_query("What was the total revenue in Q1 2024?", None, 5)
        .await
        .unwrap();

    assert_eq!(result.tool_calls_made, vec!["get_revenue_by_period"]);
    assert!(result.answer.contains("30000"));
    assert!(result.answer.to_lowercase().contains("revenue"));
}

/// Scenario 5: `max_iterations=1` with a prompt that would naturally need
/// three tool calls. The agent makes one tool call, then a forced summary —
/// at most 2 LLM calls total, `iterations=1`, a final answer is present.
#[tokio::test]
async fn scenario_5_agent_iteration_cap_forces_summary() {
    let (controller, _calls) = seeded_agent(vec![
        tool_call_reply("get_revenue_by_period", json!({ "start_date": "2024-01-01", "end_date": "2024-01-31" })),
        final_reply("Here is what I found so far."),
    ])
    .await;

    let result = controller
        .process_query(
            "Compare revenue, expenses, and net profit across every month of 2024.",
            None,
            1,
        )
        .await
        .unwrap();

    assert_eq!(result.iterations, 1);
    assert_eq!(result.tool_calls_made.len(), 1);
    assert_eq!(result.stop_reason, "max_iterations");
    assert!(!result.answer.is_empty());
}

/// Scenario 6: aggregate endpoint. Given scenario 1's data, aggregating
/// 2024-Q2 returns revenue 30000, expenses 18000, net_profit 12000, 3
/// records, sourced entirely from Dialect-A.
#[tokio::test]
async fn scenario_6_aggregate_endpoint_for_a_quarter() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_json(&dir, "year.json", &dialect_a_year(10000.0, 6000.0));

    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let orchestrator = Orchestrator::new(Arc::clone(&store), Config::default());
    orchestrator.ingest_file(&path, None).await;

    let agg = store.aggregate_period(PeriodSpec::Quarter(2024, 2)).await.unwrap();
    assert_eq!(agg.period, "2024-Q2");
    assert_eq!(agg.revenue, finunify::money::Money::from_f64(30000.0));
    assert_eq!(agg.expenses, finunify::money::Money::from_f64(18000.0));
    assert_eq!(agg.net_profit, finunify::money::Money::from_f64(12000.0));
    assert_eq!(agg.count, 3);
    assert_eq!(agg.sources, vec![Source::DialectA]);
}

/// Boundary: an empty batch returns a Completed result with zero totals.
#[tokio::test]
async fn empty_batch_completes_with_zero_totals() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let orchestrator = Arc::new(Orchestrator::new(store, Config::default()));
    let result = orchestrator.ingest_batch(vec![]).await;
    assert_eq!(result.status, finunify::ingestion::BatchStatus::Completed);
    assert!(result.file_results.is_empty());
}

/// Boundary: `max_iterations = 0` forces an immediate summary with zero
/// tool calls, regardless of what the query implies.
#[tokio::test]
async fn zero_max_iterations_never_calls_a_tool() {
    let (controller, _calls) = seeded_agent(vec![final_reply("no tools needed")]).await;
    let result = controller.process_query("anything at all", None, 0).await.unwrap();
    assert!(result.tool_calls_made.is_empty());
    assert_eq!(result.iterations, 0);
}
