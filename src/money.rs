//! Fixed-point USDC quantities.
//!
//! USDC carries six decimal places, so every amount in this service is an
//! integer count of micro-units (10⁻⁶ USDC) stored in an `i64`. The wire
//! form is a decimal string (`"0.001000"`) so that integer precision
//! survives JSON round-trips across language boundaries. Floating point is
//! accepted only at ingress, with explicit half-even rounding.

use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::Display;
use std::str::FromStr;

/// Number of decimal places in one USDC.
pub const USDC_SCALE: u32 = 6;

const MICRO: i64 = 1_000_000;

/// A non-negative amount of USDC in integer micro-units.
///
/// Subtraction below zero and addition past `i64::MAX` are programming
/// errors surfaced as [`MoneyError`], never silently saturated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, sqlx::Type)]
#[sqlx(transparent)]
pub struct Money(i64);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MoneyError {
    #[error("amount overflows the 64-bit micro-unit range")]
    Overflow,
    #[error("subtraction result would be negative")]
    Underflow,
    #[error("negative amounts are not representable")]
    Negative,
    #[error("more than {USDC_SCALE} fractional digits: scale {0}")]
    TooPrecise(u32),
    #[error("invalid decimal amount")]
    InvalidFormat,
}

impl Money {
    pub const ZERO: Money = Money(0);

    /// Wraps a raw micro-unit count. Negative input is rejected.
    pub fn from_micros(micros: i64) -> Result<Self, MoneyError> {
        if micros < 0 {
            return Err(MoneyError::Negative);
        }
        Ok(Money(micros))
    }

    pub fn micros(&self) -> i64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Money) -> Result<Money, MoneyError> {
        self.0
            .checked_add(other.0)
            .map(Money)
            .ok_or(MoneyError::Overflow)
    }

    /// Subtracts `other`, failing loudly when the result would dip below
    /// zero. Balances and prices are non-negative by invariant, so an
    /// underflow here means a caller skipped its sufficiency check.
    pub fn checked_sub(self, other: Money) -> Result<Money, MoneyError> {
        let result = self.0 - other.0;
        if result < 0 {
            return Err(MoneyError::Underflow);
        }
        Ok(Money(result))
    }

    /// Multiplies by a basis-points fraction through 128-bit intermediates,
    /// rounding half away from zero so repeated fee computations carry no
    /// systematic downward bias.
    pub fn mul_bps(self, bps: u32) -> Result<Money, MoneyError> {
        let wide = (self.0 as i128) * (bps as i128);
        let rounded = (wide + 5_000) / 10_000;
        i64::try_from(rounded)
            .map(Money)
            .map_err(|_| MoneyError::Overflow)
    }

    /// Parses a decimal USDC string such as `"0.001"` or `"48.250000"`.
    ///
    /// More than six fractional digits is an error even when the extra
    /// digits are zero: callers producing such strings are computing in the
    /// wrong unit.
    pub fn parse(input: &str) -> Result<Self, MoneyError> {
        let parsed = Decimal::from_str(input).map_err(|_| MoneyError::InvalidFormat)?;
        Self::try_from_decimal(parsed)
    }

    /// Float ingress. Rounds to the nearest micro-unit half-even before
    /// converting, so `0.0000005` becomes an even micro count instead of
    /// accumulating drift.
    pub fn from_f64_lossy(value: f64) -> Result<Self, MoneyError> {
        let decimal = Decimal::from_f64(value).ok_or(MoneyError::InvalidFormat)?;
        let rounded = decimal.round_dp_with_strategy(
            USDC_SCALE,
            rust_decimal::RoundingStrategy::MidpointNearestEven,
        );
        Self::try_from_decimal(rounded)
    }

    fn try_from_decimal(value: Decimal) -> Result<Self, MoneyError> {
        if value.is_sign_negative() && !value.is_zero() {
            return Err(MoneyError::Negative);
        }
        let scale = value.scale();
        if scale > USDC_SCALE {
            return Err(MoneyError::TooPrecise(scale));
        }
        let mantissa = value.mantissa().unsigned_abs();
        let factor = 10u128.pow(USDC_SCALE - scale);
        let micros = mantissa.checked_mul(factor).ok_or(MoneyError::Overflow)?;
        i64::try_from(micros)
            .map(Money)
            .map_err(|_| MoneyError::Overflow)
    }
}

impl Display for Money {
    /// Always prints six fractional digits: `1000` micros is `"0.001000"`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.0 / MICRO, self.0 % MICRO)
    }
}

impl FromStr for Money {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Money::parse(s)
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Money::parse(&s).map_err(DeError::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_whole_and_fractional() {
        assert_eq!(Money::parse("1").unwrap().micros(), 1_000_000);
        assert_eq!(Money::parse("0.001").unwrap().micros(), 1_000);
        assert_eq!(Money::parse("48.25").unwrap().micros(), 48_250_000);
        assert_eq!(Money::parse("0.000001").unwrap().micros(), 1);
        assert_eq!(Money::parse("0").unwrap(), Money::ZERO);
    }

    #[test]
    fn rejects_excess_precision() {
        assert_eq!(
            Money::parse("0.0000001"),
            Err(MoneyError::TooPrecise(7))
        );
        assert_eq!(
            Money::parse("1.0000000"),
            Err(MoneyError::TooPrecise(7))
        );
    }

    #[test]
    fn rejects_negative_and_garbage() {
        assert_eq!(Money::parse("-1"), Err(MoneyError::Negative));
        assert_eq!(Money::parse("abc"), Err(MoneyError::InvalidFormat));
        assert_eq!(Money::from_micros(-5), Err(MoneyError::Negative));
    }

    #[test]
    fn display_is_six_digit_fixed() {
        assert_eq!(Money::from_micros(1_000).unwrap().to_string(), "0.001000");
        assert_eq!(
            Money::from_micros(48_250_000).unwrap().to_string(),
            "48.250000"
        );
        assert_eq!(Money::ZERO.to_string(), "0.000000");
    }

    #[test]
    fn subtraction_underflow_fails_loudly() {
        let one = Money::parse("1").unwrap();
        let two = Money::parse("2").unwrap();
        assert_eq!(one.checked_sub(two), Err(MoneyError::Underflow));
        assert_eq!(two.checked_sub(one).unwrap(), one);
    }

    #[test]
    fn bps_multiply_uses_full_width() {
        // 3.5% of 50 USDC is exactly 1.75 USDC.
        let gross = Money::parse("50").unwrap();
        assert_eq!(gross.mul_bps(350).unwrap(), Money::parse("1.75").unwrap());
        // Near-max values stay exact through the i128 intermediate.
        let large = Money::from_micros(i64::MAX / 2).unwrap();
        assert!(large.mul_bps(10_000).is_ok());
    }

    #[test]
    fn half_even_float_ingress() {
        assert_eq!(Money::from_f64_lossy(0.0000005).unwrap().micros(), 0);
        assert_eq!(Money::from_f64_lossy(0.0000015).unwrap().micros(), 2);
        assert_eq!(Money::from_f64_lossy(0.001).unwrap().micros(), 1_000);
    }

    #[test]
    fn json_wire_form_is_decimal_string() {
        let m = Money::parse("0.999").unwrap();
        let json = serde_json::to_string(&m).unwrap();
        assert_eq!(json, "\"0.999000\"");
        let back: Money = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    proptest! {
        #[test]
        fn add_is_commutative_and_exact(a in 0i64..1_000_000_000_000, b in 0i64..1_000_000_000_000) {
            let (a, b) = (Money::from_micros(a).unwrap(), Money::from_micros(b).unwrap());
            prop_assert_eq!(a.checked_add(b).unwrap(), b.checked_add(a).unwrap());
        }

        #[test]
        fn add_is_associative(a in 0i64..1_000_000_000, b in 0i64..1_000_000_000, c in 0i64..1_000_000_000) {
            let (a, b, c) = (
                Money::from_micros(a).unwrap(),
                Money::from_micros(b).unwrap(),
                Money::from_micros(c).unwrap(),
            );
            let left = a.checked_add(b).unwrap().checked_add(c).unwrap();
            let right = a.checked_add(b.checked_add(c).unwrap()).unwrap();
            prop_assert_eq!(left, right);
        }

        #[test]
        fn sub_inverts_add(a in 0i64..1_000_000_000_000, b in 0i64..1_000_000_000_000) {
            let (a, b) = (Money::from_micros(a).unwrap(), Money::from_micros(b).unwrap());
            let sum = a.checked_add(b).unwrap();
            prop_assert_eq!(sum.checked_sub(b).unwrap(), a);
        }

        #[test]
        fn display_parse_round_trip(micros in 0i64..i64::MAX) {
            let m = Money::from_micros(micros).unwrap();
            prop_assert_eq!(Money::parse(&m.to_string()).unwrap(), m);
        }
    }
}
