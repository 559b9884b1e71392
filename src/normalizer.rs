use crate::config::Config;
use crate::model::{Account, AccountId, AccountValue, FinancialRecord, RecordId, Source};
use crate::money::Money;
use crate::parsers::ParsedInput;
use chrono::Utc;
use std::collections::HashMap;

const CONFLICT_TOLERANCE: f64 = 0.01;

/// A single attribution entry appended to a record's `raw_data.conflicts[]`
/// array: which field disagreed, the value each source reported, and which
/// one won.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConflictEntry {
    pub field: String,
    pub incoming_source: Source,
    pub incoming_value: String,
    pub existing_source: Source,
    pub existing_value: String,
    pub winner: Source,
}

/// The result of reconciling one parsed candidate against whatever the Store
/// already holds for the same key: the record/accounts/values ready to
/// upsert, plus the conflicts that were detected and resolved along the way.
#[derive(Debug, Clone)]
pub struct NormalizedRecord {
    pub record: FinancialRecord,
    pub accounts: Vec<Account>,
    pub values: Vec<AccountValue>,
    pub conflicts: Vec<ConflictEntry>,
}

/// Normalizes dates/currency/category onto the unified schema, detects
/// conflicts against an already-persisted record for the same identity key,
/// and resolves them using `Config.source_priority`.
pub struct Normalizer<'a> {
    config: &'a Config,
}

impl<'a> Normalizer<'a> {
    pub fn new(config: &'a Config) -> Self {
        Normalizer { config }
    }

    /// `existing` is whatever the Store already has for this record's
    /// identity key (period/currency, independent of source), if any.
    pub fn normalize(
        &self,
        input: ParsedInput,
        existing: Option<&FinancialRecord>,
    ) -> NormalizedRecord {
        let currency = input.currency.trim().to_uppercase();
        let id = RecordId::compute(input.period_start, input.period_end, &currency);

        let mut conflicts = Vec::new();
        let (revenue, expenses, net_profit, currency, raw_data) = match existing {
            None => (input.revenue, input.expenses, input.net_profit, currency, input.raw),
            Some(prior) => self.reconcile(&mut conflicts, prior, &input, currency),
        };

        let now = Utc::now();
        let record = FinancialRecord {
            id: id.clone(),
            source: input.source,
            period_start: input.period_start,
            period_end: input.period_end,
            currency,
            revenue,
            expenses,
            net_profit,
            raw_data: attach_conflicts(raw_data, &conflicts),
            created_at: existing.map(|p| p.created_at).unwrap_or(now),
            updated_at: now,
        };

        let values = input
            .values
            .into_iter()
            .map(|v| AccountValue {
                financial_record_id: id.clone(),
                account_id: v.account_id,
                value: v.value,
            })
            .collect();

        NormalizedRecord {
            record,
            accounts: dedupe_accounts(input.accounts),
            values,
            conflicts,
        }
    }

    fn reconcile(
        &self,
        conflicts: &mut Vec<ConflictEntry>,
        prior: &FinancialRecord,
        incoming: &ParsedInput,
        incoming_currency: String,
    ) -> (Money, Money, Money, String, serde_json::Value) {
        let tolerance = Money::from_f64(CONFLICT_TOLERANCE);
        let incoming_wins = self.priority_of(incoming.source) >= self.priority_of(prior.source);

        let mut pick = |field: &str,
                        incoming_value: Money,
                        prior_value: Money|
         -> Money {
            if incoming_value.within_tolerance(prior_value, tolerance) {
                return incoming_value;
            }
            let winner_source = if incoming_wins { incoming.source } else { prior.source };
            conflicts.push(ConflictEntry {
                field: field.to_string(),
                incoming_source: incoming.source,
                incoming_value: incoming_value.to_string(),
                existing_source: prior.source,
                existing_value: prior_value.to_string(),
                winner: winner_source,
            });
            if incoming_wins {
                incoming_value
            } else {
                prior_value
            }
        };

        let revenue = pick("revenue", incoming.revenue, prior.revenue);
        let expenses = pick("expenses", incoming.expenses, prior.expenses);
        let net_profit = pick("net_profit", incoming.net_profit, prior.net_profit);

        let currency = if incoming_currency == prior.currency {
            incoming_currency
        } else {
            conflicts.push(ConflictEntry {
                field: "currency".to_string(),
                incoming_source: incoming.source,
                incoming_value: incoming_currency.clone(),
                existing_source: prior.source,
                existing_value: prior.currency.clone(),
                winner: if incoming_wins { incoming.source } else { prior.source },
            });
            if incoming_wins { incoming_currency } else { prior.currency.clone() }
        };

        // Balance-consistency: after picking winners independently, net_profit
        // may no longer equal revenue - expenses. Re-derive it so the merged
        // record stays internally consistent rather than carrying forward a
        // stale imbalance.
        let net_profit = if net_profit.within_tolerance(revenue - expenses, tolerance) {
            net_profit
        } else {
            revenue - expenses
        };

        let raw_data = if incoming_wins {
            incoming.raw.clone()
        } else {
            prior.raw_data.clone()
        };

        (revenue, expenses, net_profit, currency, raw_data)
    }

    fn priority_of(&self, source: Source) -> u8 {
        *self.config.source_priority.get(&source).unwrap_or(&0)
    }
}

fn dedupe_accounts(accounts: Vec<Account>) -> Vec<Account> {
    let mut seen: HashMap<AccountId, Account> = HashMap::new();
    for account in accounts {
        seen.entry(account.account_id.clone()).or_insert(account);
    }
    seen.into_values().collect()
}

fn attach_conflicts(mut raw: serde_json::Value, conflicts: &[ConflictEntry]) -> serde_json::Value {
    if conflicts.is_empty() {
        return raw;
    }
    if let Some(obj) = raw.as_object_mut() {
        obj.insert(
            "conflicts".to_string(),
            serde_json::to_value(conflicts).unwrap_or(serde_json::Value::Null),
        );
    }
    raw
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AccountType;
    use chrono::NaiveDate;

    fn input(source: Source, revenue: f64, expenses: f64) -> ParsedInput {
        ParsedInput {
            source,
            period_start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            period_end: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            currency: "USD".to_string(),
            revenue: Money::from_f64(revenue),
            expenses: Money::from_f64(expenses),
            net_profit: Money::from_f64(revenue - expenses),
            disambiguator: "jan".to_string(),
            accounts: vec![],
            values: vec![],
            raw: serde_json::json!({}),
            issues: vec![],
        }
    }

    #[test]
    fn first_seen_record_has_no_conflicts() {
        let config = Config::default();
        let normalizer = Normalizer::new(&config);
        let normalized = normalizer.normalize(input(Source::DialectA, 100.0, 40.0), None);
        assert!(normalized.conflicts.is_empty());
        assert_eq!(normalized.record.revenue, Money::from_f64(100.0));
    }

    #[test]
    fn higher_priority_source_wins_on_conflict() {
        let config = Config::default(); // DialectA: 2, DialectB: 1
        let normalizer = Normalizer::new(&config);

        let prior_input = input(Source::DialectB, 100.0, 40.0);
        let prior = normalizer.normalize(prior_input, None).record;

        let incoming = input(Source::DialectA, 150.0, 40.0);
        let normalized = normalizer.normalize(incoming, Some(&prior));

        assert_eq!(normalized.record.revenue, Money::from_f64(150.0));
        assert_eq!(normalized.conflicts.len(), 1);
        assert_eq!(normalized.conflicts[0].field, "revenue");
        assert!(matches!(normalized.conflicts[0].winner, Source::DialectA));
    }

    #[test]
    fn lower_priority_incoming_does_not_overwrite() {
        let config = Config::default();
        let normalizer = Normalizer::new(&config);

        let prior_input = input(Source::DialectA, 100.0, 40.0);
        let prior = normalizer.normalize(prior_input, None).record;

        let incoming = input(Source::DialectB, 999.0, 40.0);
        let normalized = normalizer.normalize(incoming, Some(&prior));

        assert_eq!(normalized.record.revenue, Money::from_f64(100.0));
        assert!(matches!(normalized.conflicts[0].winner, Source::DialectA));
    }

    #[test]
    fn accounts_are_deduped_by_id() {
        let config = Config::default();
        let normalizer = Normalizer::new(&config);
        let mut parsed = input(Source::DialectA, 100.0, 40.0);
        parsed.accounts = vec![
            Account {
                account_id: AccountId("a-x".into()),
                name: "X".into(),
                account_type: AccountType::Revenue,
                parent_account_id: None,
                source: Source::DialectA,
                description: None,
                is_active: true,
            },
            Account {
                account_id: AccountId("a-x".into()),
                name: "X duplicate".into(),
                account_type: AccountType::Revenue,
                parent_account_id: None,
                source: Source::DialectA,
                description: None,
                is_active: true,
            },
        ];
        let normalized = normalizer.normalize(parsed, None);
        assert_eq!(normalized.accounts.len(), 1);
    }
}
