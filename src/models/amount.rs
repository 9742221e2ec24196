//! Token amounts travel as decimal strings; `U256`'s own serde impl uses hex.

use ethers::types::U256;
use serde::{Deserialize, Deserializer, Serializer};

/// Either form a client may send an amount in.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AmountField {
    Text(String),
    Number(u64),
}

impl AmountField {
    pub fn to_u256(&self) -> Option<U256> {
        match self {
            AmountField::Text(s) => parse_decimal(s),
            AmountField::Number(n) => Some(U256::from(*n)),
        }
    }
}

/// Strict base-10 parse, rejecting signs, whitespace and hex.
pub fn parse_decimal(s: &str) -> Option<U256> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    U256::from_dec_str(s).ok()
}

/// Exact sum; `None` on 256-bit overflow.
pub fn checked_sum<I>(amounts: I) -> Option<U256>
where
    I: IntoIterator<Item = U256>,
{
    amounts
        .into_iter()
        .try_fold(U256::zero(), |acc, amount| acc.checked_add(amount))
}

pub mod decimal {
    use super::*;

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let field = AmountField::deserialize(deserializer)?;
        field
            .to_u256()
            .ok_or_else(|| serde::de::Error::custom("expected a non-negative decimal integer"))
    }
}

pub mod decimal_opt {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Option<U256>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.collect_str(v),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<U256>, D::Error> {
        match Option::<AmountField>::deserialize(deserializer)? {
            Some(field) => field
                .to_u256()
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom("expected a non-negative decimal integer")),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_decimal_rejects_non_digits() {
        assert_eq!(parse_decimal("1000000"), Some(U256::from(1_000_000u64)));
        assert_eq!(parse_decimal("-5"), None);
        assert_eq!(parse_decimal("0x10"), None);
        assert_eq!(parse_decimal(" 1"), None);
        assert_eq!(parse_decimal(""), None);
    }

    #[test]
    fn test_checked_sum_exceeds_u128() {
        let big = U256::from(u128::MAX);
        let total = checked_sum([big, big, U256::from(2u64)]).unwrap();
        assert_eq!(total.to_string(), "680564733841876926926749214863536422912");
    }

    #[test]
    fn test_checked_sum_overflow_is_none() {
        assert_eq!(checked_sum([U256::MAX, U256::one()]), None);
    }
}
