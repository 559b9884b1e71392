use crate::dates::{today, years_ago};
use crate::issues::{Issue, Severity};
use crate::model::{Account, AccountId, AccountType};
use crate::money::Money;
use crate::parsers::{ParsedInput, ParsedValue};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};

const HIGH_VALUE_THRESHOLD: &str = "1000000000000"; // 10^12
const BALANCE_TOLERANCE_CENTS: f64 = 0.01;

fn common_currencies() -> &'static [&'static str] {
    &[
        "USD", "EUR", "GBP", "JPY", "CAD", "AUD", "NZD", "CHF", "CNY", "INR", "SGD", "HKD",
    ]
}

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub issues: Vec<Issue>,
    pub quality_score: f64,
    pub is_valid: bool,
}

impl ValidationResult {
    fn from_issues(issues: Vec<Issue>) -> Self {
        let mut counts = HashMap::new();
        for issue in &issues {
            *counts.entry(issue.severity).or_insert(0u32) += 1;
        }
        let info = *counts.get(&Severity::Info).unwrap_or(&0) as f64;
        let warning = *counts.get(&Severity::Warning).unwrap_or(&0) as f64;
        let error = *counts.get(&Severity::Error).unwrap_or(&0) as f64;
        let critical = *counts.get(&Severity::Critical).unwrap_or(&0) as f64;

        let raw_score = 1.0 - 0.05 * info - 0.15 * warning - 0.35 * error - 0.50 * critical;
        let quality_score = raw_score.clamp(0.0, 1.0);

        let is_valid = !issues
            .iter()
            .any(|i| matches!(i.severity, Severity::Error | Severity::Critical));

        ValidationResult {
            issues,
            quality_score,
            is_valid,
        }
    }
}

/// Validates one parsed candidate against the §4.2 rule set. `existing_accounts`
/// lets the ACC_ORPHAN / ACC_CYCLE checks resolve parents that already live in
/// the Store rather than only ones freshly discovered in this file.
pub fn validate(input: &ParsedInput, existing_accounts: &[Account]) -> ValidationResult {
    let mut issues = Vec::new();

    if input.revenue.is_negative() {
        issues.push(Issue::warning("NEG_REV", "revenue is negative"));
    }
    if input.expenses.is_negative() {
        issues.push(Issue::warning("NEG_EXP", "expenses is negative"));
    }

    let threshold: Decimal = HIGH_VALUE_THRESHOLD.parse().unwrap();
    for (label, amount) in [
        ("revenue", input.revenue),
        ("expenses", input.expenses),
        ("net_profit", input.net_profit),
    ] {
        if amount.exceeds(threshold) {
            issues.push(Issue::warning("HIGH_VAL", format!("{label} exceeds 10^12")));
        }
    }
    for value in &input.values {
        if value.value.exceeds(threshold) {
            issues.push(Issue::warning(
                "HIGH_VAL",
                format!("account {} value exceeds 10^12", value.account_id),
            ));
        }
    }

    let balance_diff = input.net_profit - (input.revenue - input.expenses);
    if balance_diff.abs() > Money::from_f64(BALANCE_TOLERANCE_CENTS) {
        issues.push(Issue::error(
            "BAL_EQ",
            format!(
                "net_profit differs from revenue - expenses by {}",
                balance_diff
            ),
        ));
    }

    if input.period_end < input.period_start {
        issues.push(Issue::error("DATE_RANGE", "period_end before period_start"));
    }

    let now = today();
    if input.period_end > now {
        issues.push(Issue::warning("FUTURE_PERIOD", "period_end is in the future"));
    }
    if input.period_end < years_ago(now, 10) {
        issues.push(Issue::info("OLD_PERIOD", "period_end is more than 10 years old"));
    }

    if input.currency.len() != 3 || !input.currency.chars().all(|c| c.is_ascii_uppercase()) {
        issues.push(Issue::error(
            "CUR_FMT",
            format!("currency `{}` is not exactly three uppercase letters", input.currency),
        ));
    } else if !common_currencies().contains(&input.currency.as_str()) {
        issues.push(Issue::info(
            "CUR_UNCOMMON",
            format!("currency `{}` is outside the common set", input.currency),
        ));
    }

    validate_account_tree(&input.accounts, existing_accounts, &mut issues);
    validate_sum_consistency(input, &mut issues);

    // Parser-level issues (e.g. defaulted currency, zero-substitutions)
    // are carried through unchanged.
    issues.extend(input.issues.clone());

    ValidationResult::from_issues(issues)
}

fn validate_account_tree(fresh: &[Account], existing: &[Account], issues: &mut Vec<Issue>) {
    let mut by_id: HashMap<&AccountId, &Account> = HashMap::new();
    for a in existing.iter().chain(fresh.iter()) {
        by_id.insert(&a.account_id, a);
    }

    for account in fresh {
        if let Some(parent_id) = &account.parent_account_id {
            match by_id.get(parent_id) {
                None => {
                    issues.push(Issue::error(
                        "ACC_ORPHAN",
                        format!("account `{}` references unknown parent `{parent_id}`", account.name),
                    ));
                }
                Some(parent) => {
                    if !families_compatible(account.account_type, parent.account_type) {
                        issues.push(Issue::warning(
                            "ACC_TYPE_MIX",
                            format!(
                                "account `{}` ({:?}) has parent of a different family ({:?})",
                                account.name, account.account_type, parent.account_type
                            ),
                        ));
                    }
                }
            }
        }

        if has_cycle(&account.account_id, &by_id) {
            issues.push(Issue::error(
                "ACC_CYCLE",
                format!("account `{}` is part of a parent cycle", account.name),
            ));
        }
    }
}

fn families_compatible(child: AccountType, parent: AccountType) -> bool {
    use AccountType::*;
    match (child, parent) {
        (Revenue, Revenue) | (Expense, Expense) => true,
        (a, b) => a == b,
    }
}

fn has_cycle(start: &AccountId, by_id: &HashMap<&AccountId, &Account>) -> bool {
    let mut seen = HashSet::new();
    let mut current = start;
    loop {
        if !seen.insert(current.clone()) {
            return true;
        }
        match by_id.get(current).and_then(|a| a.parent_account_id.as_ref()) {
            Some(parent) => current = parent,
            None => return false,
        }
        if seen.len() > by_id.len() + 1 {
            return true;
        }
    }
}

fn validate_sum_consistency(input: &ParsedInput, issues: &mut Vec<Issue>) {
    let type_of: HashMap<&AccountId, AccountType> = input
        .accounts
        .iter()
        .map(|a| (&a.account_id, a.account_type))
        .collect();

    let sum_by_type = |t: AccountType| -> Money {
        input
            .values
            .iter()
            .filter(|v: &&ParsedValue| type_of.get(&v.account_id) == Some(&t))
            .map(|v| v.value)
            .sum()
    };

    let revenue_sum = sum_by_type(AccountType::Revenue);
    let expense_sum = sum_by_type(AccountType::Expense);
    let tolerance = Money::from_f64(BALANCE_TOLERANCE_CENTS);

    if !revenue_sum.within_tolerance(input.revenue, tolerance) {
        issues.push(Issue::error(
            "SUM_MISMATCH",
            format!(
                "sum of revenue account values ({revenue_sum}) does not match record revenue ({})",
                input.revenue
            ),
        ));
    }
    if !expense_sum.within_tolerance(input.expenses, tolerance) {
        issues.push(Issue::error(
            "SUM_MISMATCH",
            format!(
                "sum of expense account values ({expense_sum}) does not match record expenses ({})",
                input.expenses
            ),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Source;
    use chrono::NaiveDate;

    fn base_input() -> ParsedInput {
        ParsedInput {
            source: Source::DialectA,
            period_start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            period_end: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            currency: "USD".to_string(),
            revenue: Money::from_f64(10000.0),
            expenses: Money::from_f64(6000.0),
            net_profit: Money::from_f64(4000.0),
            disambiguator: "x".to_string(),
            accounts: vec![],
            values: vec![],
            raw: serde_json::json!({}),
            issues: vec![],
        }
    }

    #[test]
    fn perfect_record_scores_1_0() {
        let result = validate(&base_input(), &[]);
        assert!(result.is_valid);
        assert_eq!(result.quality_score, 1.0);
    }

    #[test]
    fn imbalanced_record_is_invalid() {
        let mut input = base_input();
        input.revenue = Money::from_f64(100.0);
        input.expenses = Money::from_f64(40.0);
        input.net_profit = Money::from_f64(50.0); // true diff is 60
        let result = validate(&input, &[]);
        assert!(!result.is_valid);
        assert!(result.issues.iter().any(|i| i.code == "BAL_EQ"));
    }

    #[test]
    fn bad_currency_format_is_an_error() {
        let mut input = base_input();
        input.currency = "US".to_string();
        let result = validate(&input, &[]);
        assert!(!result.is_valid);
        assert!(result.issues.iter().any(|i| i.code == "CUR_FMT"));
    }

    #[test]
    fn orphan_parent_is_an_error() {
        let mut input = base_input();
        input.accounts.push(Account {
            account_id: AccountId("a-child".into()),
            name: "Child".into(),
            account_type: AccountType::Revenue,
            parent_account_id: Some(AccountId("a-missing".into())),
            source: Source::DialectA,
            description: None,
            is_active: true,
        });
        let result = validate(&input, &[]);
        assert!(result.issues.iter().any(|i| i.code == "ACC_ORPHAN"));
    }
}
