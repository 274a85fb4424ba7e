//! Token amounts expressed in the smallest unit of the payment asset.
//!
//! x402 carries amounts as stringified integers (`"10000"` is one cent of a
//! six-decimal stablecoin) so that JSON consumers never lose precision.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// An integer amount in the asset's smallest unit.
///
/// # Serialization
///
/// Serialized as a stringified integer:
///
/// ```json
/// "10000"
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TokenAmount(u128);

/// Error returned when a string is not a valid non-negative integer amount.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid token amount {0:?}: expected a non-negative integer")]
pub struct AmountParseError(String);

impl TokenAmount {
    /// Creates an amount from raw smallest-unit value.
    #[must_use]
    pub const fn new(atomic: u128) -> Self {
        Self(atomic)
    }

    /// Returns the raw smallest-unit value.
    #[must_use]
    pub const fn atomic(&self) -> u128 {
        self.0
    }
}

impl From<u128> for TokenAmount {
    fn from(value: u128) -> Self {
        Self(value)
    }
}

impl FromStr for TokenAmount {
    type Err = AmountParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AmountParseError(s.to_owned()));
        }
        trimmed
            .parse::<u128>()
            .map(Self)
            .map_err(|_| AmountParseError(s.to_owned()))
    }
}

impl Display for TokenAmount {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for TokenAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_string() {
        let amount = TokenAmount::new(10_000);
        assert_eq!(serde_json::to_string(&amount).unwrap(), "\"10000\"");
    }

    #[test]
    fn rejects_decimal_and_negative_strings() {
        assert!("0.01".parse::<TokenAmount>().is_err());
        assert!("-5".parse::<TokenAmount>().is_err());
        assert!("".parse::<TokenAmount>().is_err());
        assert!(serde_json::from_str::<TokenAmount>("\"1e6\"").is_err());
    }

    #[test]
    fn parses_with_surrounding_whitespace() {
        let amount: TokenAmount = " 250 ".parse().unwrap();
        assert_eq!(amount.atomic(), 250);
    }
}
