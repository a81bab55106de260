use std::fmt;

use serde::{Deserialize, Serialize};

/// ISO-4217 currency code, e.g. `USD`, `EUR`. Stored upper-case.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Currency(pub String);

impl Currency {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into().to_ascii_uppercase())
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An exact signed amount in a currency's minor unit (e.g. cents).
///
/// All arithmetic is exact `i64` arithmetic; there is no floating point
/// anywhere in the ledger or wagering paths.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MinorAmount(pub i64);

impl MinorAmount {
    pub const ZERO: MinorAmount = MinorAmount(0);

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn checked_add(self, other: MinorAmount) -> Option<MinorAmount> {
        self.0.checked_add(other.0).map(MinorAmount)
    }

    pub fn checked_sub(self, other: MinorAmount) -> Option<MinorAmount> {
        self.0.checked_sub(other.0).map(MinorAmount)
    }
}

impl fmt::Display for MinorAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A currency-tagged exact amount.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub amount_minor: MinorAmount,
    pub currency: Currency,
}

impl Money {
    pub fn new(amount_minor: i64, currency: impl Into<String>) -> Self {
        Self {
            amount_minor: MinorAmount(amount_minor),
            currency: Currency::new(currency),
        }
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount_minor, self.currency)
    }
}
