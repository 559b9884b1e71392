pub mod dialect_a;
pub mod dialect_b;

use crate::error::{CoreError, Result};
use crate::issues::Issue;
use crate::model::{Account, AccountId, Source};
use crate::money::Money;
use chrono::NaiveDate;

pub use dialect_a::ParserA;
pub use dialect_b::ParserB;

/// An account's contribution before it has been attached to a persisted
/// `FinancialRecord`; the record id is assigned by the Normalizer once the
/// record itself is upserted.
#[derive(Debug, Clone)]
pub struct ParsedValue {
    pub account_id: AccountId,
    pub value: Money,
}

/// The intermediate triple every dialect parser produces: a candidate
/// record plus the accounts and values discovered while walking it. Neither
/// the Validator nor the Normalizer mutate a parser's output; they consume
/// it and produce their own types.
#[derive(Debug, Clone)]
pub struct ParsedInput {
    pub source: Source,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub currency: String,
    pub revenue: Money,
    pub expenses: Money,
    pub net_profit: Money,
    pub disambiguator: String,
    pub accounts: Vec<Account>,
    pub values: Vec<ParsedValue>,
    pub raw: serde_json::Value,
    pub issues: Vec<Issue>,
}

/// A dialect-specific parser. Implementations turn a decoded JSON value into
/// one intermediate triple per period found in the file; they never talk to
/// the Store.
pub trait DialectParser {
    fn source(&self) -> Source;
    fn parse(&self, raw: &serde_json::Value) -> Result<Vec<ParsedInput>>;
}

fn money(caller: &mut Vec<Issue>, code: &'static str, field: &str, value: &serde_json::Value) -> Money {
    match value {
        serde_json::Value::Number(n) => Money::from_f64(n.as_f64().unwrap_or(0.0)),
        serde_json::Value::String(s) => s.parse::<f64>().map(Money::from_f64).unwrap_or_else(|_| {
            caller.push(Issue::warning(
                code,
                format!("could not parse numeric field `{field}`, substituting zero"),
            ));
            Money::ZERO
        }),
        serde_json::Value::Null => {
            caller.push(Issue::warning(
                code,
                format!("missing numeric field `{field}`, substituting zero"),
            ));
            Money::ZERO
        }
        other => {
            caller.push(Issue::warning(
                code,
                format!("unexpected type for field `{field}`: {other}"),
            ));
            Money::ZERO
        }
    }
}

/// Inspects the top-level shape of a decoded JSON value and selects the
/// dialect-specific parser. Fails the whole file with `UnknownDialect` when
/// neither shape matches.
pub struct Detector;

impl Detector {
    pub fn detect_and_parse(raw: &serde_json::Value) -> Result<Vec<ParsedInput>> {
        let obj = raw
            .as_object()
            .ok_or_else(|| CoreError::ParseError("root JSON value is not an object".into()))?;

        if obj.contains_key("data") && obj.get("data").is_some_and(|v| v.is_array()) {
            let first = obj.get("data").and_then(|v| v.as_array()).and_then(|a| a.first());
            if first.is_some_and(|e| e.get("period_start").is_some() && e.get("period_end").is_some()) {
                return ParserB.parse(raw);
            }
        }

        if obj.contains_key("header") || obj.contains_key("columns") || obj.contains_key("rows") {
            return ParserA.parse(raw);
        }

        Err(CoreError::ParseError(
            "UnknownDialect: root shape matched neither Dialect-A nor Dialect-B".into(),
        ))
    }
}

pub(crate) use money as parse_money_field;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_shape_is_rejected() {
        let raw = serde_json::json!({ "nothing_recognizable": true });
        let result = Detector::detect_and_parse(&raw);
        assert!(matches!(result, Err(CoreError::ParseError(_))));
    }
}
