use rust_decimal::prelude::*;
use rust_decimal::RoundingStrategy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Neg, Sub};

/// A fixed-point monetary amount, scaled to two fractional digits with
/// half-even rounding applied at every arithmetic boundary. Backed by
/// `rust_decimal::Decimal` rather than a float, per the data model's
/// precision requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Money(Decimal);

const SCALE: u32 = 2;

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);

    pub fn new(value: Decimal) -> Self {
        Money(value.round_dp_with_strategy(SCALE, RoundingStrategy::MidpointNearestEven))
    }

    pub fn from_f64(value: f64) -> Self {
        let dec = Decimal::from_f64(value).unwrap_or(Decimal::ZERO);
        Money::new(dec)
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// Lossy conversion used by analytics tools that need floating-point
    /// ratios (growth rates, z-scores); never used for persisted amounts.
    pub fn to_f64(&self) -> f64 {
        self.0.to_f64().unwrap_or(0.0)
    }

    pub fn abs(&self) -> Money {
        Money(self.0.abs())
    }

    pub fn is_negative(&self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    /// True if `self` and `other` differ by at most `tolerance`.
    pub fn within_tolerance(&self, other: Money, tolerance: Money) -> bool {
        (*self - other).abs() <= tolerance
    }

    pub fn exceeds(&self, threshold: Decimal) -> bool {
        self.0.abs() > threshold
    }
}

impl Add for Money {
    type Output = Money;
    fn add(self, rhs: Money) -> Money {
        Money::new(self.0 + rhs.0)
    }
}

impl Sub for Money {
    type Output = Money;
    fn sub(self, rhs: Money) -> Money {
        Money::new(self.0 - rhs.0)
    }
}

impl Neg for Money {
    type Output = Money;
    fn neg(self) -> Money {
        Money(-self.0)
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, m| acc + m)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Money {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = serde_json::Value::deserialize(deserializer)?;
        let dec = match raw {
            serde_json::Value::String(s) => {
                Decimal::from_str(&s).map_err(serde::de::Error::custom)?
            }
            serde_json::Value::Number(n) => {
                Decimal::from_f64(n.as_f64().unwrap_or(0.0)).unwrap_or(Decimal::ZERO)
            }
            other => return Err(serde::de::Error::custom(format!("invalid money value: {other}"))),
        };
        Ok(Money::new(dec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_to_two_fractional_digits_half_even() {
        let a = Money::from_f64(1.005);
        // 1.005 isn't exactly representable in f64, but the half-even rule
        // still lands on a 2-decimal value.
        assert_eq!(a.as_decimal().scale(), 2);
    }

    #[test]
    fn tolerance_check() {
        let a = Money::from_f64(100.00);
        let b = Money::from_f64(100.009);
        assert!(a.within_tolerance(b, Money::from_f64(0.01)));
        let c = Money::from_f64(100.02);
        assert!(!a.within_tolerance(c, Money::from_f64(0.01)));
    }

    #[test]
    fn json_round_trip() {
        let m = Money::from_f64(-42.5);
        let json = serde_json::to_string(&m).unwrap();
        let parsed: Money = serde_json::from_str(&json).unwrap();
        assert_eq!(m, parsed);
    }
}
