use crate::error::PaymentError;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// ISO 4217 currencies the engine settles in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Eur,
    Usd,
    Gbp,
    Rub,
    Jpy,
}

impl Currency {
    /// Number of decimal places of the minor unit.
    pub fn minor_exponent(self) -> u32 {
        match self {
            Currency::Jpy => 0,
            _ => 2,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Currency::Eur => "EUR",
            Currency::Usd => "USD",
            Currency::Gbp => "GBP",
            Currency::Rub => "RUB",
            Currency::Jpy => "JPY",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Currency {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "EUR" => Ok(Currency::Eur),
            "USD" => Ok(Currency::Usd),
            "GBP" => Ok(Currency::Gbp),
            "RUB" => Ok(Currency::Rub),
            "JPY" => Ok(Currency::Jpy),
            other => Err(PaymentError::ValidationError(format!(
                "unsupported currency `{other}`"
            ))),
        }
    }
}

/// A fixed-point monetary value.
///
/// The amount is always held at exactly the currency's minor-unit scale, so
/// two equal values have identical serialized forms. Arithmetic between
/// different currencies is rejected rather than coerced, and arithmetic that
/// leaves the representable range is an error, never a panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawMoney")]
pub struct Money {
    amount: Decimal,
    currency: Currency,
}

/// Wire form of `Money`; deserialized values go through `Money::new`.
#[derive(Deserialize)]
struct RawMoney {
    amount: Decimal,
    currency: Currency,
}

impl TryFrom<RawMoney> for Money {
    type Error = PaymentError;

    fn try_from(raw: RawMoney) -> Result<Self, Self::Error> {
        Money::new(raw.amount, raw.currency)
    }
}

fn overflow(operation: &str, currency: Currency) -> PaymentError {
    PaymentError::ValidationError(format!("{currency} amount overflowed in {operation}"))
}

impl Money {
    /// Builds a value, rejecting amounts finer than the currency's minor unit.
    pub fn new(amount: Decimal, currency: Currency) -> Result<Self, PaymentError> {
        let exponent = currency.minor_exponent();
        if amount.round_dp(exponent) != amount {
            return Err(PaymentError::ValidationError(format!(
                "{amount} has more than {exponent} decimal places for {currency}"
            )));
        }
        Self::at_scale(amount, currency)
    }

    /// Brings an arbitrary decimal to currency precision using banker's rounding.
    pub fn rounded(amount: Decimal, currency: Currency) -> Result<Self, PaymentError> {
        let amount = amount.round_dp_with_strategy(
            currency.minor_exponent(),
            RoundingStrategy::MidpointNearestEven,
        );
        Self::at_scale(amount, currency)
    }

    /// Rescales to the minor unit. Values too large to carry that scale are
    /// out of range.
    fn at_scale(mut amount: Decimal, currency: Currency) -> Result<Self, PaymentError> {
        let exponent = currency.minor_exponent();
        amount.rescale(exponent);
        if amount.scale() != exponent {
            return Err(PaymentError::ValidationError(format!(
                "{amount} is out of range for {currency}"
            )));
        }
        Ok(Self { amount, currency })
    }

    pub fn from_minor(minor: i64, currency: Currency) -> Self {
        Self {
            amount: Decimal::new(minor, currency.minor_exponent()),
            currency,
        }
    }

    pub fn zero(currency: Currency) -> Self {
        Self::from_minor(0, currency)
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    /// The amount in integer minor units, when it fits an `i64`.
    pub fn minor_units(&self) -> Result<i64, PaymentError> {
        i64::try_from(self.amount.mantissa()).map_err(|_| overflow("minor units", self.currency))
    }

    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        self.amount > Decimal::ZERO
    }

    fn same_currency(&self, other: &Money) -> Result<(), PaymentError> {
        if self.currency == other.currency {
            Ok(())
        } else {
            Err(PaymentError::CurrencyMismatch {
                expected: self.currency,
                actual: other.currency,
            })
        }
    }

    pub fn checked_add(&self, other: Money) -> Result<Money, PaymentError> {
        self.same_currency(&other)?;
        let sum = self
            .amount
            .checked_add(other.amount)
            .ok_or_else(|| overflow("addition", self.currency))?;
        Self::at_scale(sum, self.currency)
    }

    pub fn checked_sub(&self, other: Money) -> Result<Money, PaymentError> {
        self.same_currency(&other)?;
        let difference = self
            .amount
            .checked_sub(other.amount)
            .ok_or_else(|| overflow("subtraction", self.currency))?;
        Self::at_scale(difference, self.currency)
    }

    /// Unit price times quantity, using the shared rounding rule.
    pub fn times(&self, quantity: u32) -> Result<Money, PaymentError> {
        let product = self
            .amount
            .checked_mul(Decimal::from(quantity))
            .ok_or_else(|| overflow("multiplication", self.currency))?;
        Self::rounded(product, self.currency)
    }

    /// Sums values that must all be in `currency`.
    pub fn sum<I>(values: I, currency: Currency) -> Result<Money, PaymentError>
    where
        I: IntoIterator<Item = Money>,
    {
        values
            .into_iter()
            .try_fold(Money::zero(currency), |acc, value| acc.checked_add(value))
    }

    /// Splits `self` proportionally to `weights` using the largest-remainder
    /// method over integer minor units. The parts always sum to `self`.
    pub fn allocate(&self, weights: &[Money]) -> Result<Vec<Money>, PaymentError> {
        for weight in weights {
            self.same_currency(weight)?;
            if weight.amount < Decimal::ZERO {
                return Err(PaymentError::ValidationError(
                    "allocation weights must not be negative".to_string(),
                ));
            }
        }
        let weight_units = weights
            .iter()
            .map(|weight| weight.minor_units().map(i128::from))
            .collect::<Result<Vec<_>, _>>()?;
        let total_weight: i128 = weight_units.iter().sum();
        if total_weight == 0 {
            return Err(PaymentError::ValidationError(
                "allocation weights sum to zero".to_string(),
            ));
        }

        let target = i128::from(self.minor_units()?);
        let mut parts = Vec::with_capacity(weights.len());
        let mut remainders = Vec::with_capacity(weights.len());
        for (index, weight) in weight_units.iter().enumerate() {
            let exact = target * weight;
            parts.push(exact.div_euclid(total_weight));
            remainders.push((exact.rem_euclid(total_weight), index));
        }

        let mut leftover = target - parts.iter().sum::<i128>();
        // Largest remainder first, earlier lines win ties.
        remainders.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        for (_, index) in remainders {
            if leftover <= 0 {
                break;
            }
            parts[index] += 1;
            leftover -= 1;
        }

        parts
            .into_iter()
            .map(|minor| {
                i64::try_from(minor)
                    .map(|minor| Money::from_minor(minor, self.currency))
                    .map_err(|_| {
                        PaymentError::ValidationError("allocation overflowed".to_string())
                    })
            })
            .collect()
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

impl PartialOrd for Money {
    /// Values in different currencies are not comparable.
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        if self.currency == other.currency {
            self.amount.partial_cmp(&other.amount)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn eur(minor: i64) -> Money {
        Money::from_minor(minor, Currency::Eur)
    }

    #[test]
    fn test_money_rejects_sub_minor_precision() {
        assert!(Money::new(dec!(10.00), Currency::Eur).is_ok());
        assert!(matches!(
            Money::new(dec!(10.001), Currency::Eur),
            Err(PaymentError::ValidationError(_))
        ));
        assert!(matches!(
            Money::new(dec!(1.5), Currency::Jpy),
            Err(PaymentError::ValidationError(_))
        ));
    }

    #[test]
    fn test_money_is_rescaled_to_currency() {
        let money = Money::new(dec!(100), Currency::Eur).unwrap();
        assert_eq!(money.amount().to_string(), "100.00");
        assert_eq!(money.minor_units().unwrap(), 10000);
        assert_eq!(money, eur(10000));
    }

    #[test]
    fn test_rounding_is_bankers() {
        assert_eq!(Money::rounded(dec!(0.125), Currency::Eur).unwrap(), eur(12));
        assert_eq!(Money::rounded(dec!(0.135), Currency::Eur).unwrap(), eur(14));
    }

    #[test]
    fn test_arithmetic_checks_currency() {
        assert_eq!(eur(150).checked_add(eur(50)).unwrap(), eur(200));
        assert_eq!(eur(150).checked_sub(eur(50)).unwrap(), eur(100));
        let usd = Money::from_minor(1, Currency::Usd);
        assert!(matches!(
            eur(1).checked_add(usd),
            Err(PaymentError::CurrencyMismatch { .. })
        ));
        assert_eq!(eur(1).partial_cmp(&usd), None);
    }

    #[test]
    fn test_times_and_sum() {
        assert_eq!(eur(333).times(3).unwrap(), eur(999));
        let total = Money::sum([eur(1), eur(2), eur(3)], Currency::Eur).unwrap();
        assert_eq!(total, eur(6));
    }

    #[test]
    fn test_overflow_is_an_error() {
        let huge = Money::new(dec!(10000000000000000000000000), Currency::Eur).unwrap();
        assert!(matches!(huge.times(10_000), Err(PaymentError::ValidationError(_))));
        let max = Money::new(dec!(500000000000000000000000000), Currency::Eur).unwrap();
        assert!(max.checked_add(max).is_err());
        assert!(max.checked_sub(max).unwrap().is_zero());
        assert!(matches!(
            Money::new(dec!(10000000000000000000000000000), Currency::Eur),
            Err(PaymentError::ValidationError(_))
        ));
        assert!(huge.minor_units().is_err());
    }

    #[test]
    fn test_deserialize_validates_scale() {
        let money: Money =
            serde_json::from_str(r#"{"amount":"12.5","currency":"EUR"}"#).unwrap();
        assert_eq!(money, eur(1250));
        assert_eq!(money.amount().to_string(), "12.50");
        assert!(serde_json::from_str::<Money>(r#"{"amount":"12.505","currency":"EUR"}"#).is_err());
        assert!(serde_json::from_str::<Money>(r#"{"amount":"1.5","currency":"JPY"}"#).is_err());
    }

    #[test]
    fn test_allocate_distributes_remainder_exactly() {
        let parts = eur(100).allocate(&[eur(1), eur(1), eur(1)]).unwrap();
        assert_eq!(parts, vec![eur(34), eur(33), eur(33)]);

        let parts = eur(4000)
            .allocate(&[eur(6000), eur(3000), eur(1000)])
            .unwrap();
        assert_eq!(parts, vec![eur(2400), eur(1200), eur(400)]);
    }

    #[test]
    fn test_allocate_prefers_largest_remainder() {
        // 7 split 1:2:2 is 1.4, 2.8, 2.8
        let parts = eur(7).allocate(&[eur(1), eur(2), eur(2)]).unwrap();
        assert_eq!(parts, vec![eur(1), eur(3), eur(3)]);
    }

    #[test]
    fn test_allocate_rejects_zero_weights() {
        assert!(eur(100).allocate(&[eur(0), eur(0)]).is_err());
    }

    #[test]
    fn test_currency_parsing() {
        assert_eq!("eur".parse::<Currency>().unwrap(), Currency::Eur);
        assert!("XXX".parse::<Currency>().is_err());
        assert_eq!(Currency::Jpy.minor_exponent(), 0);
    }
}
