use super::{parse_money_field, DialectParser, ParsedInput, ParsedValue};
use crate::error::{CoreError, Result};
use crate::issues::Issue;
use crate::model::{Account, AccountId, AccountType, Source};
use crate::money::Money;
use chrono::NaiveDate;
use serde::Deserialize;

/// Column-major P&L: a header block, an ordered list of period columns, and
/// a row tree whose terminal rows carry one value per column.
pub struct ParserA;

#[derive(Debug, Deserialize)]
struct RootA {
    #[serde(default)]
    header: Header,
    columns: Vec<ColumnMeta>,
    rows: Vec<Row>,
}

#[derive(Debug, Default, Deserialize)]
struct Header {
    currency: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ColumnMeta {
    title: String,
    start_date: NaiveDate,
    end_date: NaiveDate,
}

#[derive(Debug, Deserialize)]
struct Row {
    name: String,
    #[serde(default)]
    group: Option<String>,
    #[serde(default)]
    children: Vec<Row>,
    #[serde(default)]
    values: Vec<serde_json::Value>,
}

const REVENUE_KEYWORDS: &[&str] = &["income", "revenue", "sales", "service", "consulting"];
const EXPENSE_KEYWORDS: &[&str] = &["expense", "cost", "payroll", "rent", "marketing"];
const ASSET_KEYWORDS: &[&str] = &["cash", "bank", "receivable", "inventory", "equipment"];
const LIABILITY_KEYWORDS: &[&str] = &["payable", "loan", "debt", "liability", "accrued"];

/// Resolves a row's `AccountType`: its own `group` label wins if it carries a
/// keyword, then its own name, then the nearest enclosing group's resolved
/// type (a leaf with neither a recognizable group nor name inherits its
/// parent's classification rather than falling through to `Other`).
fn classify(group: Option<&str>, name: &str, inherited: Option<AccountType>) -> AccountType {
    if let Some(g) = group {
        if let Some(t) = classify_keyword(g) {
            return t;
        }
    }
    if let Some(t) = classify_keyword(name) {
        return t;
    }
    inherited.unwrap_or(AccountType::Other)
}

fn classify_keyword(label: &str) -> Option<AccountType> {
    let lower = label.to_lowercase();
    if REVENUE_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return Some(AccountType::Revenue);
    }
    if EXPENSE_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return Some(AccountType::Expense);
    }
    if ASSET_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return Some(AccountType::Asset);
    }
    if LIABILITY_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return Some(AccountType::Liability);
    }
    None
}

fn slug(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
}

struct PerPeriodTotals {
    revenue: Money,
    expenses: Money,
}

impl DialectParser for ParserA {
    fn source(&self) -> Source {
        Source::DialectA
    }

    fn parse(&self, raw: &serde_json::Value) -> Result<Vec<ParsedInput>> {
        let root: RootA = serde_json::from_value(raw.clone())
            .map_err(|e| CoreError::ParseError(format!("Dialect-A root shape: {e}")))?;

        let mut issues = Vec::new();
        let currency = root.header.currency.clone().unwrap_or_else(|| {
            issues.push(Issue::info(
                "CUR_DEFAULT",
                "currency missing from header, defaulting to USD",
            ));
            "USD".to_string()
        });

        let n_periods = root.columns.len();
        let mut accounts = Vec::new();
        let mut values_per_period: Vec<Vec<ParsedValue>> = (0..n_periods).map(|_| Vec::new()).collect();
        let mut totals: Vec<PerPeriodTotals> = (0..n_periods)
            .map(|_| PerPeriodTotals {
                revenue: Money::ZERO,
                expenses: Money::ZERO,
            })
            .collect();

        let mut seen_ids = std::collections::HashSet::new();
        for row in &root.rows {
            walk_row(
                row,
                None,
                None,
                n_periods,
                &mut accounts,
                &mut values_per_period,
                &mut totals,
                &mut issues,
                &mut seen_ids,
            );
        }

        let mut out = Vec::with_capacity(n_periods);
        for (i, column) in root.columns.iter().enumerate() {
            if column.end_date < column.start_date {
                issues.push(Issue::error(
                    "DATE_RANGE",
                    format!("column `{}`: period_end before period_start", column.title),
                ));
            }
            let revenue = totals[i].revenue;
            let expenses = totals[i].expenses;
            let net_profit = revenue - expenses;

            out.push(ParsedInput {
                source: Source::DialectA,
                period_start: column.start_date,
                period_end: column.end_date,
                currency: currency.to_uppercase(),
                revenue,
                expenses,
                net_profit,
                disambiguator: column.title.clone(),
                accounts: accounts.clone(),
                values: std::mem::take(&mut values_per_period[i]),
                raw: raw.clone(),
                issues: issues.clone(),
            });
        }

        Ok(out)
    }
}

#[allow(clippy::too_many_arguments)]
fn walk_row(
    row: &Row,
    parent_id: Option<&AccountId>,
    inherited_type: Option<AccountType>,
    n_periods: usize,
    accounts: &mut Vec<Account>,
    values_per_period: &mut [Vec<ParsedValue>],
    totals: &mut [PerPeriodTotals],
    issues: &mut Vec<Issue>,
    seen_ids: &mut std::collections::HashSet<AccountId>,
) {
    let account_type = classify(row.group.as_deref(), &row.name, inherited_type);

    let mut base_id = format!("a-{}", slug(&row.name));
    let mut suffix = 1;
    while seen_ids.contains(&AccountId(base_id.clone())) {
        suffix += 1;
        base_id = format!("a-{}-{}", slug(&row.name), suffix);
    }
    let account_id = AccountId(base_id);
    seen_ids.insert(account_id.clone());

    accounts.push(Account {
        account_id: account_id.clone(),
        name: row.name.clone(),
        account_type,
        parent_account_id: parent_id.cloned(),
        source: Source::DialectA,
        description: row.group.clone(),
        is_active: true,
    });

    if row.children.is_empty() {
        for i in 0..n_periods.min(row.values.len()) {
            let value = parse_money_field(issues, "HIGH_VAL", &row.name, &row.values[i]);
            values_per_period[i].push(ParsedValue {
                account_id: account_id.clone(),
                value,
            });
            match account_type {
                AccountType::Revenue => totals[i].revenue = totals[i].revenue + value,
                AccountType::Expense => totals[i].expenses = totals[i].expenses + value,
                _ => {}
            }
        }
    } else {
        for child in &row.children {
            walk_row(
                child,
                Some(&account_id),
                Some(account_type),
                n_periods,
                accounts,
                values_per_period,
                totals,
                issues,
                seen_ids,
            );
        }
    }
}
