use std::{fmt, str::FromStr};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

/// Largest representable amount in minor units (`decimal(15, 2)`).
pub const MAX_AMOUNT_MINOR: i64 = 999_999_999_999_999;

/// Largest representable rate in hundredths (`100.00`).
pub const MAX_RATE_HUNDREDTHS: i64 = 10_000;

/// Non-negative money value with two decimal places, held in minor units.
///
/// Serialized as a decimal string (`"25.50"`) so clients never see binary
/// floating point values. Deserialization accepts either a string or a JSON
/// number with at most two fractional digits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Self = Self(0);

    /// Builds an amount from minor units (kobo, cents).
    pub fn from_minor(minor: i64) -> Result<Self, AmountError> {
        check_range(minor, MAX_AMOUNT_MINOR).map(Self)
    }

    /// Returns the value in minor units.
    pub fn minor(self) -> i64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Adds two amounts, returning `None` when the result leaves the valid range.
    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0
            .checked_add(other.0)
            .and_then(|sum| Self::from_minor(sum).ok())
    }

    /// Mean of `count` contributions summing to `total`, rounded half up to the cent.
    pub fn average(total: Self, count: u64) -> Self {
        if count == 0 {
            return Self::ZERO;
        }
        let total = i128::from(total.0);
        let count = i128::from(count);
        let mean = (total * 2 + count) / (count * 2);
        Self(mean as i64)
    }

    /// Parses a JSON value that is either a decimal string or a number.
    pub fn from_json(value: &Value) -> Result<Self, AmountError> {
        parse_json_fixed2(value, MAX_AMOUNT_MINOR).map(Self)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_fixed2(f, self.0)
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        parse_fixed2(value, MAX_AMOUNT_MINOR).map(Self)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_json(&value).map_err(de::Error::custom)
    }
}

/// Percentage with two decimal places (`0.00..=100.00`), held in hundredths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rate(i64);

impl Rate {
    pub fn from_hundredths(value: i64) -> Result<Self, AmountError> {
        check_range(value, MAX_RATE_HUNDREDTHS).map(Self)
    }

    pub fn hundredths(self) -> i64 {
        self.0
    }

    pub fn from_json(value: &Value) -> Result<Self, AmountError> {
        parse_json_fixed2(value, MAX_RATE_HUNDREDTHS).map(Self)
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_fixed2(f, self.0)
    }
}

impl FromStr for Rate {
    type Err = AmountError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        parse_fixed2(value, MAX_RATE_HUNDREDTHS).map(Self)
    }
}

impl Serialize for Rate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Rate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_json(&value).map_err(de::Error::custom)
    }
}

/// Errors produced while parsing fixed-point values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AmountError {
    #[error("value is empty")]
    Empty,
    #[error("value is not a decimal number")]
    Malformed,
    #[error("value has more than two decimal places")]
    TooPrecise,
    #[error("value must not be negative")]
    Negative,
    #[error("value is too large")]
    TooLarge,
}

fn check_range(value: i64, max: i64) -> Result<i64, AmountError> {
    if value < 0 {
        return Err(AmountError::Negative);
    }
    if value > max {
        return Err(AmountError::TooLarge);
    }
    Ok(value)
}

fn write_fixed2(f: &mut fmt::Formatter<'_>, value: i64) -> fmt::Result {
    write!(f, "{}.{:02}", value / 100, value % 100)
}

fn parse_fixed2(raw: &str, max: i64) -> Result<i64, AmountError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(AmountError::Empty);
    }
    if value.starts_with('-') {
        return Err(AmountError::Negative);
    }

    let (whole, fraction) = match value.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (value, None),
    };

    if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AmountError::Malformed);
    }

    let cents = match fraction {
        None => 0,
        Some(digits) if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) => {
            return Err(AmountError::Malformed);
        }
        Some(digits) if digits.len() > 2 => return Err(AmountError::TooPrecise),
        Some(digits) => {
            let parsed: i64 = digits.parse().map_err(|_| AmountError::Malformed)?;
            if digits.len() == 1 {
                parsed * 10
            } else {
                parsed
            }
        }
    };

    let mut units: i64 = 0;
    for digit in whole.bytes() {
        units = units
            .checked_mul(10)
            .and_then(|acc| acc.checked_add(i64::from(digit - b'0')))
            .ok_or(AmountError::TooLarge)?;
    }

    let total = units
        .checked_mul(100)
        .and_then(|acc| acc.checked_add(cents))
        .ok_or(AmountError::TooLarge)?;
    check_range(total, max)
}

fn parse_json_fixed2(value: &Value, max: i64) -> Result<i64, AmountError> {
    match value {
        Value::String(raw) => parse_fixed2(raw, max),
        Value::Number(number) => {
            if let Some(units) = number.as_u64() {
                let units = i64::try_from(units).map_err(|_| AmountError::TooLarge)?;
                let total = units.checked_mul(100).ok_or(AmountError::TooLarge)?;
                return check_range(total, max);
            }
            if number.as_i64().is_some() {
                return Err(AmountError::Negative);
            }
            // Fall back to the shortest decimal rendering of the float so that
            // `12.5` parses as written rather than as its binary expansion.
            parse_fixed2(&number.to_string(), max)
        }
        Value::Null => Err(AmountError::Empty),
        _ => Err(AmountError::Malformed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_decimal_strings() {
        assert_eq!("25".parse::<Amount>().unwrap().minor(), 2500);
        assert_eq!("25.5".parse::<Amount>().unwrap().minor(), 2550);
        assert_eq!("0.07".parse::<Amount>().unwrap().minor(), 7);
        assert_eq!(" 100.00 ".parse::<Amount>().unwrap().minor(), 10_000);
    }

    #[test]
    fn rejects_malformed_strings() {
        assert_eq!("".parse::<Amount>(), Err(AmountError::Empty));
        assert_eq!("-1".parse::<Amount>(), Err(AmountError::Negative));
        assert_eq!("1.234".parse::<Amount>(), Err(AmountError::TooPrecise));
        assert_eq!("1e5".parse::<Amount>(), Err(AmountError::Malformed));
        assert_eq!(".5".parse::<Amount>(), Err(AmountError::Malformed));
        assert_eq!("5.".parse::<Amount>(), Err(AmountError::Malformed));
        assert_eq!("+5".parse::<Amount>(), Err(AmountError::Malformed));
        assert_eq!(
            "10000000000000.00".parse::<Amount>(),
            Err(AmountError::TooLarge)
        );
    }

    #[test]
    fn accepts_json_numbers() {
        assert_eq!(Amount::from_json(&json!(50)).unwrap().minor(), 5000);
        assert_eq!(Amount::from_json(&json!(12.5)).unwrap().minor(), 1250);
        assert_eq!(Amount::from_json(&json!(0.1)).unwrap().minor(), 10);
        assert_eq!(Amount::from_json(&json!(-3)), Err(AmountError::Negative));
        assert_eq!(
            Amount::from_json(&json!(1.005)),
            Err(AmountError::TooPrecise)
        );
        assert_eq!(Amount::from_json(&json!(true)), Err(AmountError::Malformed));
    }

    #[test]
    fn serializes_as_two_decimal_string() {
        let amount = Amount::from_minor(123_405).unwrap();
        assert_eq!(serde_json::to_value(amount).unwrap(), json!("1234.05"));
        assert_eq!(Amount::ZERO.to_string(), "0.00");
    }

    #[test]
    fn average_rounds_half_up() {
        let total = Amount::from_minor(1000).unwrap();
        assert_eq!(Amount::average(total, 3).minor(), 333);
        let total = Amount::from_minor(5).unwrap();
        assert_eq!(Amount::average(total, 2).minor(), 3);
        assert_eq!(Amount::average(total, 0), Amount::ZERO);
    }

    #[test]
    fn checked_add_respects_ceiling() {
        let max = Amount::from_minor(MAX_AMOUNT_MINOR).unwrap();
        assert!(max.checked_add(Amount::from_minor(1).unwrap()).is_none());
        let sum = Amount::from_minor(150)
            .unwrap()
            .checked_add(Amount::from_minor(250).unwrap())
            .unwrap();
        assert_eq!(sum.minor(), 400);
    }

    #[test]
    fn rate_is_bounded_to_one_hundred_percent() {
        assert_eq!("12.75".parse::<Rate>().unwrap().hundredths(), 1275);
        assert_eq!("100".parse::<Rate>().unwrap().hundredths(), 10_000);
        assert_eq!("100.01".parse::<Rate>(), Err(AmountError::TooLarge));
    }
}
