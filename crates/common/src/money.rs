use serde::{Deserialize, Serialize};

/// A monetary amount in cents.
///
/// Amounts are signed so that intermediate arithmetic (base minus discount)
/// cannot silently wrap; callers decide whether a negative total is valid.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    /// Creates an amount from cents.
    pub fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    /// Returns the zero amount.
    pub fn zero() -> Self {
        Self(0)
    }

    /// Returns the amount in cents.
    pub fn as_cents(&self) -> i64 {
        self.0
    }

    /// Returns true if the amount is negative.
    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }
}

impl std::ops::Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl std::ops::Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic() {
        let base = Money::from_cents(10_000);
        let tax = Money::from_cents(800);
        let discount = Money::from_cents(1_000);
        assert_eq!(base - discount + tax, Money::from_cents(9_800));
    }

    #[test]
    fn display_formats_cents() {
        assert_eq!(Money::from_cents(9_800).to_string(), "98.00");
        assert_eq!(Money::from_cents(5).to_string(), "0.05");
        assert_eq!(Money::from_cents(-150).to_string(), "-1.50");
    }

    #[test]
    fn serialization_is_transparent() {
        let json = serde_json::to_string(&Money::from_cents(1234)).unwrap();
        assert_eq!(json, "1234");
        let back: Money = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Money::from_cents(1234));
    }
}
