//! The Tool Registry (C6): a declarative catalog of domain-specific, read-only
//! functions over the [`Store`](crate::store::Store) that the Agent Controller
//! exposes to the LLM by name. Tools never mutate state; every handler's
//! parameters are checked by `ToolHandler::validate` at the registry boundary,
//! in `ToolRegistry::execute`, before the handler's `call` ever runs.

use crate::error::{CoreError, Result};
use crate::model::{AccountType, Source};
use crate::money::Money;
use crate::store::{RecordFilter, Store};
use async_trait::async_trait;
use chrono::NaiveDate;
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MetricName {
    Revenue,
    Expenses,
    NetProfit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum SourceParam {
    DialectA,
    DialectB,
}

impl From<SourceParam> for Source {
    fn from(value: SourceParam) -> Self {
        match value {
            SourceParam::DialectA => Source::DialectA,
            SourceParam::DialectB => Source::DialectB,
        }
    }
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| CoreError::ValidationError(format!("`{raw}` is not a YYYY-MM-DD date")))
}

fn require_ordered(start: NaiveDate, end: NaiveDate) -> Result<()> {
    if start > end {
        return Err(CoreError::ValidationError(format!(
            "start date {start} is after end date {end}"
        )));
    }
    Ok(())
}

/// Paginates through every record whose period lies within `[start, end]`,
/// optionally narrowed to one source.
async fn records_in_range(
    store: &dyn Store,
    start: NaiveDate,
    end: NaiveDate,
    source: Option<Source>,
) -> Result<Vec<crate::model::FinancialRecord>> {
    let mut out = Vec::new();
    let mut page = 1usize;
    loop {
        let result = store
            .find_records(RecordFilter {
                source,
                period_start_from: Some(start),
                period_end_to: Some(end),
                page,
                page_size: 100,
                ..Default::default()
            })
            .await?;
        let got = result.items.len();
        out.extend(result.items);
        if got == 0 || out.len() >= result.total {
            break;
        }
        page += 1;
    }
    Ok(out)
}

fn metric_of(record: &crate::model::FinancialRecord, metric: MetricName) -> Money {
    match metric {
        MetricName::Revenue => record.revenue,
        MetricName::Expenses => record.expenses,
        MetricName::NetProfit => record.net_profit,
    }
}

/// One executable tool: its JSON-schema parameter description and its
/// side-effect-free handler over the store. The schema is generated from the
/// handler's own parameter struct via `schemars`, so the two never drift.
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters_schema: Value,
    handler: Arc<dyn ToolHandler>,
}

#[async_trait]
trait ToolHandler: Send + Sync {
    /// Checked by `ToolRegistry::execute` before `call` is ever invoked:
    /// JSON shape, enum membership, date formats, ordering, and range
    /// constraints all fail here, not partway through a handler.
    fn validate(&self, params: &Value) -> Result<()>;
    async fn call(&self, store: &dyn Store, params: Value) -> Result<Value>;
}

/// Declarative map from tool name to its spec, populated once at startup
/// from a fixed builder function; no runtime reflection or decorator-style
/// registration.
pub struct ToolRegistry {
    tools: BTreeMap<&'static str, ToolSpec>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        let mut tools = BTreeMap::new();
        for spec in build_tool_specs() {
            tools.insert(spec.name, spec);
        }
        ToolRegistry { tools }
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    pub fn specs(&self) -> impl Iterator<Item = &ToolSpec> {
        self.tools.values()
    }

    /// Validates and executes a tool call by name. Unknown names, malformed
    /// parameters, and out-of-range values all fail here, before the handler
    /// ever runs.
    pub async fn execute(&self, store: &dyn Store, name: &str, params: Value) -> Result<Value> {
        let spec = self
            .tools
            .get(name)
            .ok_or_else(|| CoreError::ValidationError(format!("unknown tool `{name}`")))?;
        spec.handler.validate(&params)?;
        log::debug!("executing tool `{name}` with params {params}");
        spec.handler.call(store, params).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! tool_spec {
    ($name:expr, $desc:expr, $params:ty, $handler:expr) => {
        ToolSpec {
            name: $name,
            description: $desc,
            parameters_schema: serde_json::to_value(schema_for!($params))
                .unwrap_or(json!({})),
            handler: Arc::new($handler),
        }
    };
}

fn build_tool_specs() -> Vec<ToolSpec> {
    vec![
        tool_spec!(
            "get_revenue_by_period",
            "Total revenue and a per-period breakdown between two dates.",
            RevenueExpenseParams,
            RevenueByPeriod
        ),
        tool_spec!(
            "get_expenses_by_period",
            "Total expenses, per-period breakdown, and category split between two dates.",
            RevenueExpenseParams,
            ExpensesByPeriod
        ),
        tool_spec!(
            "compare_financial_metrics",
            "Absolute and percent change for a set of metrics across two periods.",
            CompareMetricsParams,
            CompareMetrics
        ),
        tool_spec!(
            "calculate_growth_rate",
            "Per-pair growth and a CAGR-style summary for a metric across an ordered list of periods.",
            GrowthRateParams,
            GrowthRate
        ),
        tool_spec!(
            "detect_anomalies",
            "Periods whose metric value deviates from the lookback average beyond a threshold.",
            DetectAnomaliesParams,
            DetectAnomalies
        ),
        tool_spec!(
            "analyze_expense_trends",
            "Monotonic segments and inflection points in expenses across a date range.",
            RangeParams,
            AnalyzeExpenseTrends
        ),
        tool_spec!(
            "get_expense_categories",
            "Expense account totals and their share of total expenses across a date range.",
            RangeParams,
            GetExpenseCategories
        ),
        tool_spec!(
            "analyze_seasonal_patterns",
            "Per-calendar-month average, peak, and trough for a metric across a set of years.",
            SeasonalParams,
            AnalyzeSeasonalPatterns
        ),
        tool_spec!(
            "get_quarterly_performance",
            "Four quarter summaries for a year and metric, with YoY deltas if the prior year exists.",
            QuarterlyParams,
            GetQuarterlyPerformance
        ),
    ]
}

#[derive(Debug, Deserialize, JsonSchema)]
struct RevenueExpenseParams {
    start_date: String,
    end_date: String,
    source: Option<SourceParam>,
    currency: Option<String>,
}

fn parse_revenue_expense(params: &Value) -> Result<(RevenueExpenseParams, NaiveDate, NaiveDate)> {
    let p: RevenueExpenseParams = serde_json::from_value(params.clone())
        .map_err(|e| CoreError::ValidationError(e.to_string()))?;
    let start = parse_date(&p.start_date)?;
    let end = parse_date(&p.end_date)?;
    require_ordered(start, end)?;
    Ok((p, start, end))
}

struct RevenueByPeriod;

#[async_trait]
impl ToolHandler for RevenueByPeriod {
    fn validate(&self, params: &Value) -> Result<()> {
        parse_revenue_expense(params).map(|_| ())
    }

    async fn call(&self, store: &dyn Store, params: Value) -> Result<Value> {
        let (p, start, end) = parse_revenue_expense(&params)?;

        let records = records_in_range(store, start, end, p.source.map(Source::from)).await?;
        let total: Money = records.iter().map(|r| r.revenue).sum();
        let breakdown: Vec<Value> = records
            .iter()
            .map(|r| json!({ "period_start": r.period_start, "period_end": r.period_end, "revenue": r.revenue }))
            .collect();

        Ok(json!({ "total_revenue": total, "breakdown": breakdown }))
    }
}

struct ExpensesByPeriod;

#[async_trait]
impl ToolHandler for ExpensesByPeriod {
    fn validate(&self, params: &Value) -> Result<()> {
        parse_revenue_expense(params).map(|_| ())
    }

    async fn call(&self, store: &dyn Store, params: Value) -> Result<Value> {
        let (p, start, end) = parse_revenue_expense(&params)?;

        let records = records_in_range(store, start, end, p.source.map(Source::from)).await?;
        let total: Money = records.iter().map(|r| r.expenses).sum();
        let breakdown: Vec<Value> = records
            .iter()
            .map(|r| json!({ "period_start": r.period_start, "period_end": r.period_end, "expenses": r.expenses }))
            .collect();

        let categories = expense_category_totals(store, start, end).await?;

        Ok(json!({ "total_expenses": total, "breakdown": breakdown, "categories": categories }))
    }
}

async fn expense_category_totals(store: &dyn Store, start: NaiveDate, end: NaiveDate) -> Result<Vec<Value>> {
    let records = records_in_range(store, start, end, None).await?;
    let accounts = store.all_accounts().await?;
    let account_names: BTreeMap<_, _> = accounts
        .iter()
        .filter(|a| a.account_type == AccountType::Expense)
        .map(|a| (a.account_id.clone(), a.name.clone()))
        .collect();

    let mut totals: BTreeMap<String, Money> = BTreeMap::new();
    for record in &records {
        for value in store.account_values_for(&record.id).await? {
            if let Some(name) = account_names.get(&value.account_id) {
                *totals.entry(name.clone()).or_insert(Money::ZERO) = totals
                    .get(name)
                    .copied()
                    .unwrap_or(Money::ZERO)
                    + value.value;
            }
        }
    }
    let grand_total: Money = totals.values().copied().sum();

    Ok(totals
        .into_iter()
        .map(|(name, total)| {
            let share = if grand_total == Money::ZERO {
                0.0
            } else {
                total.to_f64() / grand_total.to_f64()
            };
            json!({ "category": name, "total": total, "share": share })
        })
        .collect())
}

#[derive(Debug, Deserialize, JsonSchema)]
struct CompareMetricsParams {
    start1: String,
    end1: String,
    start2: String,
    end2: String,
    metrics: Vec<MetricName>,
}

fn parse_compare_metrics(params: &Value) -> Result<(CompareMetricsParams, NaiveDate, NaiveDate, NaiveDate, NaiveDate)> {
    let p: CompareMetricsParams = serde_json::from_value(params.clone())
        .map_err(|e| CoreError::ValidationError(e.to_string()))?;
    if p.metrics.is_empty() {
        return Err(CoreError::ValidationError("metrics must not be empty".into()));
    }
    let (s1, e1) = (parse_date(&p.start1)?, parse_date(&p.end1)?);
    let (s2, e2) = (parse_date(&p.start2)?, parse_date(&p.end2)?);
    require_ordered(s1, e1)?;
    require_ordered(s2, e2)?;
    Ok((p, s1, e1, s2, e2))
}

struct CompareMetrics;

#[async_trait]
impl ToolHandler for CompareMetrics {
    fn validate(&self, params: &Value) -> Result<()> {
        parse_compare_metrics(params).map(|_| ())
    }

    async fn call(&self, store: &dyn Store, params: Value) -> Result<Value> {
        let (p, s1, e1, s2, e2) = parse_compare_metrics(&params)?;

        let period1 = records_in_range(store, s1, e1, None).await?;
        let period2 = records_in_range(store, s2, e2, None).await?;

        let mut per_metric = Vec::new();
        for metric in p.metrics {
            let total1: Money = period1.iter().map(|r| metric_of(r, metric)).sum();
            let total2: Money = period2.iter().map(|r| metric_of(r, metric)).sum();
            let delta = total2 - total1;
            let base = total1.to_f64();
            let delta_f = delta.to_f64();
            let percent_change = if base == 0.0 { None } else { Some(delta_f / base * 100.0) };
            per_metric.push(json!({
                "metric": metric,
                "period1_total": total1,
                "period2_total": total2,
                "absolute_change": delta,
                "percent_change": percent_change,
            }));
        }

        Ok(json!({ "comparisons": per_metric }))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct GrowthRateParams {
    metric: MetricName,
    periods: Vec<String>,
}

fn parse_growth_rate(params: &Value) -> Result<(GrowthRateParams, Vec<crate::dates::PeriodSpec>)> {
    let p: GrowthRateParams = serde_json::from_value(params.clone())
        .map_err(|e| CoreError::ValidationError(e.to_string()))?;
    if p.periods.len() < 2 {
        return Err(CoreError::ValidationError("at least two periods are required".into()));
    }
    let specs = p
        .periods
        .iter()
        .map(|raw| crate::dates::PeriodSpec::parse(raw))
        .collect::<Result<Vec<_>>>()?;
    Ok((p, specs))
}

struct GrowthRate;

#[async_trait]
impl ToolHandler for GrowthRate {
    fn validate(&self, params: &Value) -> Result<()> {
        parse_growth_rate(params).map(|_| ())
    }

    async fn call(&self, store: &dyn Store, params: Value) -> Result<Value> {
        let (p, specs) = parse_growth_rate(&params)?;

        let mut totals = Vec::with_capacity(p.periods.len());
        for (raw, spec) in p.periods.iter().zip(specs) {
            let agg = store.aggregate_period(spec).await?;
            let value = match p.metric {
                MetricName::Revenue => agg.revenue,
                MetricName::Expenses => agg.expenses,
                MetricName::NetProfit => agg.net_profit,
            };
            totals.push((raw.clone(), value));
        }

        let mut pairwise = Vec::new();
        for window in totals.windows(2) {
            let (from_label, from_value) = &window[0];
            let (to_label, to_value) = &window[1];
            let from_f = from_value.to_f64();
            let to_f = to_value.to_f64();
            let growth = if from_f == 0.0 { None } else { Some((to_f - from_f) / from_f * 100.0) };
            pairwise.push(json!({ "from": from_label, "to": to_label, "growth_percent": growth }));
        }

        let first_f = totals[0].1.to_f64();
        let last_f = totals[totals.len() - 1].1.to_f64();
        let n = (totals.len() - 1) as f64;
        let cagr = if first_f > 0.0 && n > 0.0 {
            Some(((last_f / first_f).powf(1.0 / n) - 1.0) * 100.0)
        } else {
            None
        };

        Ok(json!({ "pairwise_growth": pairwise, "cagr_percent": cagr }))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct DetectAnomaliesParams {
    metric: MetricName,
    #[serde(default = "default_threshold")]
    threshold: f64,
    lookback_months: u32,
}

fn default_threshold() -> f64 {
    0.2
}

fn parse_detect_anomalies(params: &Value) -> Result<DetectAnomaliesParams> {
    let p: DetectAnomaliesParams = serde_json::from_value(params.clone())
        .map_err(|e| CoreError::ValidationError(e.to_string()))?;
    if p.threshold <= 0.0 {
        return Err(CoreError::ValidationError("threshold must be > 0".into()));
    }
    if !(1..=120).contains(&p.lookback_months) {
        return Err(CoreError::ValidationError("lookback_months must be in 1..=120".into()));
    }
    Ok(p)
}

struct DetectAnomalies;

#[async_trait]
impl ToolHandler for DetectAnomalies {
    fn validate(&self, params: &Value) -> Result<()> {
        parse_detect_anomalies(params).map(|_| ())
    }

    async fn call(&self, store: &dyn Store, params: Value) -> Result<Value> {
        let p = parse_detect_anomalies(&params)?;

        let end = crate::dates::today();
        let start = end
            .checked_sub_months(chrono::Months::new(p.lookback_months))
            .unwrap_or(end);
        let mut records = records_in_range(store, start, end, None).await?;
        records.sort_by_key(|r| r.period_start);

        let values: Vec<f64> = records
            .iter()
            .map(|r| metric_of(r, p.metric).to_f64())
            .collect();
        let mean = if values.is_empty() { 0.0 } else { values.iter().sum::<f64>() / values.len() as f64 };
        let variance = if values.is_empty() {
            0.0
        } else {
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64
        };
        let stdev = variance.sqrt();

        let mut outliers = Vec::new();
        for (record, value) in records.iter().zip(values.iter()) {
            let deviation = if mean == 0.0 { 0.0 } else { (value - mean).abs() / mean };
            if deviation > p.threshold {
                let z_like = if stdev > 0.0 { (value - mean) / stdev } else { 0.0 };
                outliers.push(json!({
                    "period_start": record.period_start,
                    "period_end": record.period_end,
                    "value": value,
                    "z_like_score": z_like,
                }));
            }
        }

        Ok(json!({ "mean": mean, "stdev": stdev, "outliers": outliers }))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct RangeParams {
    start: String,
    end: String,
}

fn parse_range(params: &Value) -> Result<(RangeParams, NaiveDate, NaiveDate)> {
    let p: RangeParams = serde_json::from_value(params.clone())
        .map_err(|e| CoreError::ValidationError(e.to_string()))?;
    let start = parse_date(&p.start)?;
    let end = parse_date(&p.end)?;
    require_ordered(start, end)?;
    Ok((p, start, end))
}

struct AnalyzeExpenseTrends;

#[async_trait]
impl ToolHandler for AnalyzeExpenseTrends {
    fn validate(&self, params: &Value) -> Result<()> {
        parse_range(params).map(|_| ())
    }

    async fn call(&self, store: &dyn Store, params: Value) -> Result<Value> {
        let (_p, start, end) = parse_range(&params)?;

        let mut records = records_in_range(store, start, end, None).await?;
        records.sort_by_key(|r| r.period_start);

        let mut segments = Vec::new();
        let mut inflections = Vec::new();
        let mut direction: Option<std::cmp::Ordering> = None;
        let mut segment_start = records.first().map(|r| r.period_start);

        for window in records.windows(2) {
            let cmp = window[1].expenses.as_decimal().cmp(&window[0].expenses.as_decimal());
            if let Some(prev) = direction {
                if prev != cmp && cmp != std::cmp::Ordering::Equal {
                    inflections.push(json!({ "at": window[0].period_start }));
                    segments.push(json!({
                        "from": segment_start,
                        "to": window[0].period_start,
                        "direction": format!("{prev:?}"),
                    }));
                    segment_start = Some(window[0].period_start);
                }
            }
            if cmp != std::cmp::Ordering::Equal {
                direction = Some(cmp);
            }
        }
        if let (Some(start), Some(last)) = (segment_start, records.last()) {
            segments.push(json!({
                "from": start,
                "to": last.period_start,
                "direction": direction.map(|d| format!("{d:?}")),
            }));
        }

        Ok(json!({ "segments": segments, "inflection_points": inflections }))
    }
}

struct GetExpenseCategories;

#[async_trait]
impl ToolHandler for GetExpenseCategories {
    fn validate(&self, params: &Value) -> Result<()> {
        parse_range(params).map(|_| ())
    }

    async fn call(&self, store: &dyn Store, params: Value) -> Result<Value> {
        let (_p, start, end) = parse_range(&params)?;
        let categories = expense_category_totals(store, start, end).await?;
        Ok(json!({ "categories": categories }))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SeasonalParams {
    metric: MetricName,
    years: Vec<i32>,
}

fn parse_seasonal(params: &Value) -> Result<SeasonalParams> {
    let p: SeasonalParams = serde_json::from_value(params.clone())
        .map_err(|e| CoreError::ValidationError(e.to_string()))?;
    if p.years.is_empty() {
        return Err(CoreError::ValidationError("years must not be empty".into()));
    }
    for &year in &p.years {
        NaiveDate::from_ymd_opt(year, 1, 1)
            .ok_or_else(|| CoreError::ValidationError(format!("invalid year {year}")))?;
    }
    Ok(p)
}

struct AnalyzeSeasonalPatterns;

#[async_trait]
impl ToolHandler for AnalyzeSeasonalPatterns {
    fn validate(&self, params: &Value) -> Result<()> {
        parse_seasonal(params).map(|_| ())
    }

    async fn call(&self, store: &dyn Store, params: Value) -> Result<Value> {
        use chrono::Datelike;
        let p = parse_seasonal(&params)?;

        let mut by_month: BTreeMap<u32, Vec<f64>> = BTreeMap::new();
        for &year in &p.years {
            let start = NaiveDate::from_ymd_opt(year, 1, 1).unwrap();
            let end = NaiveDate::from_ymd_opt(year, 12, 31).unwrap();
            for record in records_in_range(store, start, end, None).await? {
                let value = metric_of(&record, p.metric).to_f64();
                by_month.entry(record.period_start.month()).or_default().push(value);
            }
        }

        let averages: BTreeMap<u32, f64> = by_month
            .iter()
            .map(|(month, values)| (*month, values.iter().sum::<f64>() / values.len() as f64))
            .collect();

        let peak = averages.iter().max_by(|a, b| a.1.total_cmp(b.1));
        let trough = averages.iter().min_by(|a, b| a.1.total_cmp(b.1));

        Ok(json!({
            "monthly_averages": averages,
            "peak_month": peak.map(|(m, v)| json!({ "month": m, "average": v })),
            "trough_month": trough.map(|(m, v)| json!({ "month": m, "average": v })),
        }))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct QuarterlyParams {
    year: i32,
    metric: MetricName,
}

fn parse_quarterly(params: &Value) -> Result<QuarterlyParams> {
    serde_json::from_value(params.clone()).map_err(|e| CoreError::ValidationError(e.to_string()))
}

struct GetQuarterlyPerformance;

#[async_trait]
impl ToolHandler for GetQuarterlyPerformance {
    fn validate(&self, params: &Value) -> Result<()> {
        parse_quarterly(params).map(|_| ())
    }

    async fn call(&self, store: &dyn Store, params: Value) -> Result<Value> {
        let p = parse_quarterly(&params)?;

        let mut quarters = Vec::new();
        for q in 1..=4u32 {
            let spec = crate::dates::PeriodSpec::Quarter(p.year, q);
            let agg = store.aggregate_period(spec).await?;
            let value = match p.metric {
                MetricName::Revenue => agg.revenue,
                MetricName::Expenses => agg.expenses,
                MetricName::NetProfit => agg.net_profit,
            };

            let prior_spec = crate::dates::PeriodSpec::Quarter(p.year - 1, q);
            let prior_agg = store.aggregate_period(prior_spec).await?;
            let yoy = if prior_agg.count > 0 {
                let prior_value = match p.metric {
                    MetricName::Revenue => prior_agg.revenue,
                    MetricName::Expenses => prior_agg.expenses,
                    MetricName::NetProfit => prior_agg.net_profit,
                };
                let base = prior_value.to_f64();
                let current = value.to_f64();
                if base == 0.0 { None } else { Some((current - base) / base * 100.0) }
            } else {
                None
            };

            quarters.push(json!({ "quarter": q, "value": value, "yoy_percent": yoy }));
        }

        Ok(json!({ "year": p.year, "quarters": quarters }))
    }
}
