use super::{parse_money_field, DialectParser, ParsedInput, ParsedValue};
use crate::error::{CoreError, Result};
use crate::issues::Issue;
use crate::model::{Account, AccountId, AccountType, Source};
use crate::money::Money;
use chrono::NaiveDate;
use serde::Deserialize;
use std::collections::HashSet;

/// Period-major records: a top-level `data` array whose elements carry
/// explicit period bounds and five category arrays of line items.
pub struct ParserB;

#[derive(Debug, Deserialize)]
struct RootB {
    data: Vec<RecordB>,
}

#[derive(Debug, Deserialize)]
struct RecordB {
    period_start: NaiveDate,
    period_end: NaiveDate,
    #[serde(default)]
    currency_id: Option<String>,
    #[serde(default)]
    revenue: Vec<LineItem>,
    #[serde(default, rename = "cost-of-goods")]
    cost_of_goods: Vec<LineItem>,
    #[serde(default, rename = "operating-expenses")]
    operating_expenses: Vec<LineItem>,
    #[serde(default, rename = "non-operating-revenue")]
    non_operating_revenue: Vec<LineItem>,
    #[serde(default, rename = "non-operating-expenses")]
    non_operating_expenses: Vec<LineItem>,
}

#[derive(Debug, Deserialize)]
struct LineItem {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    value: Option<serde_json::Value>,
    #[serde(default)]
    children: Vec<LineItem>,
}

fn slug(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
}

impl DialectParser for ParserB {
    fn source(&self) -> Source {
        Source::DialectB
    }

    fn parse(&self, raw: &serde_json::Value) -> Result<Vec<ParsedInput>> {
        let root: RootB = serde_json::from_value(raw.clone())
            .map_err(|e| CoreError::ParseError(format!("Dialect-B root shape: {e}")))?;

        let mut out = Vec::with_capacity(root.data.len());

        for (idx, rec) in root.data.iter().enumerate() {
            let mut issues = Vec::new();

            let currency = rec.currency_id.clone().unwrap_or_else(|| {
                issues.push(Issue::info(
                    "CUR_DEFAULT",
                    "currency_id missing, defaulting to USD",
                ));
                "USD".to_string()
            });

            let mut accounts = Vec::new();
            let mut values = Vec::new();
            let mut revenue = Money::ZERO;
            let mut expenses = Money::ZERO;
            let mut seen_ids: HashSet<AccountId> = HashSet::new();

            let categories: [(&str, &[LineItem], AccountType); 5] = [
                ("revenue", &rec.revenue, AccountType::Revenue),
                ("cost-of-goods", &rec.cost_of_goods, AccountType::Expense),
                ("operating-expenses", &rec.operating_expenses, AccountType::Expense),
                ("non-operating-revenue", &rec.non_operating_revenue, AccountType::Revenue),
                ("non-operating-expenses", &rec.non_operating_expenses, AccountType::Expense),
            ];

            for (category, items, account_type) in categories {
                for item in items {
                    walk_item(
                        item,
                        None,
                        category,
                        account_type,
                        &mut accounts,
                        &mut values,
                        &mut revenue,
                        &mut expenses,
                        &mut issues,
                        &mut seen_ids,
                    );
                }
            }

            if rec.period_end < rec.period_start {
                issues.push(Issue::error(
                    "DATE_RANGE",
                    format!("record #{idx}: period_end before period_start"),
                ));
            }

            out.push(ParsedInput {
                source: Source::DialectB,
                period_start: rec.period_start,
                period_end: rec.period_end,
                currency: currency.to_uppercase(),
                revenue,
                expenses,
                net_profit: revenue - expenses,
                disambiguator: idx.to_string(),
                accounts,
                values,
                raw: raw.clone(),
                issues,
            });
        }

        Ok(out)
    }
}

#[allow(clippy::too_many_arguments)]
fn walk_item(
    item: &LineItem,
    parent_id: Option<&AccountId>,
    category: &str,
    account_type: AccountType,
    accounts: &mut Vec<Account>,
    values: &mut Vec<ParsedValue>,
    revenue: &mut Money,
    expenses: &mut Money,
    issues: &mut Vec<Issue>,
    seen_ids: &mut HashSet<AccountId>,
) {
    let account_id = match &item.id {
        Some(id) => AccountId(format!("b-{id}")),
        None => {
            let mut base = format!("b-{category}-{}", slug(&item.name));
            let mut suffix = 1;
            while seen_ids.contains(&AccountId(base.clone())) {
                suffix += 1;
                base = format!("b-{category}-{}-{}", slug(&item.name), suffix);
            }
            AccountId(base)
        }
    };
    seen_ids.insert(account_id.clone());

    accounts.push(Account {
        account_id: account_id.clone(),
        name: item.name.clone(),
        account_type,
        parent_account_id: parent_id.cloned(),
        source: Source::DialectB,
        description: Some(category.to_string()),
        is_active: true,
    });

    // Partition semantics: a node's own value, when present, is its own
    // leaf contribution and is never re-derived from its children's sum.
    if let Some(raw_value) = &item.value {
        let value = parse_money_field(issues, "HIGH_VAL", &item.name, raw_value);
        values.push(ParsedValue {
            account_id: account_id.clone(),
            value,
        });
        match account_type {
            AccountType::Revenue => *revenue = *revenue + value,
            AccountType::Expense => *expenses = *expenses + value,
            _ => {}
        }
    }

    for child in &item.children {
        walk_item(
            child,
            Some(&account_id),
            category,
            account_type,
            accounts,
            values,
            revenue,
            expenses,
            issues,
            seen_ids,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> serde_json::Value {
        serde_json::json!({
            "data": [
                {
                    "period_start": "2024-01-01",
                    "period_end": "2024-01-31",
                    "currency_id": "usd",
                    "revenue": [
                        { "name": "Product Sales", "value": 8000.0 },
                        { "name": "Services", "value": 2000.0 }
                    ],
                    "operating-expenses": [
                        { "name": "Payroll", "value": 6000.0 }
                    ]
                }
            ]
        })
    }

    #[test]
    fn partitions_values_without_double_counting_parents() {
        let records = ParserB.parse(&sample()).unwrap();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.revenue, Money::from_f64(10000.0));
        assert_eq!(r.expenses, Money::from_f64(6000.0));
        assert_eq!(r.currency, "USD");
    }

    #[test]
    fn nested_children_each_get_own_account() {
        let raw = serde_json::json!({
            "data": [{
                "period_start": "2024-01-01",
                "period_end": "2024-01-31",
                "currency_id": "USD",
                "revenue": [
                    {
                        "name": "Sales",
                        "value": 100.0,
                        "children": [
                            { "name": "Online", "value": 60.0 },
                            { "name": "Retail", "value": 40.0 }
                        ]
                    }
                ]
            }]
        });
        let records = ParserB.parse(&raw).unwrap();
        let r = &records[0];
        // Sales (100) + Online (60) + Retail (40) = 200, since this is a
        // partition: Sales' own value is not a rollup of its children.
        assert_eq!(r.revenue, Money::from_f64(200.0));
        assert_eq!(r.accounts.len(), 3);
    }
}
