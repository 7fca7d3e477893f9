//! Token Unit Conversion
//!
//! TRC20 amounts travel as integer base units on chain and as decimals in
//! the ledger. Conversions here are exact; nothing goes through floats.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Largest exponent `rust_decimal` can represent as a scale
const MAX_DECIMALS: u32 = 28;

/// Unit conversion errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnitsError {
    #[error("malformed raw amount: {0:?}")]
    Malformed(String),

    #[error("amount {0} has more precision than the token allows")]
    FractionalUnits(String),

    #[error("amount {0} is out of range")]
    OutOfRange(String),

    #[error("unsupported decimals: {0}")]
    Decimals(u32),
}

/// Parse the chain's decimal-string `value` field
///
/// A uint256 on chain; anything past `u128` is out of range for the ledger.
pub fn parse_raw_amount(raw: &str) -> Result<u128, UnitsError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(UnitsError::Malformed(raw.to_string()));
    }
    trimmed
        .parse::<u128>()
        .map_err(|_| UnitsError::OutOfRange(raw.to_string()))
}

/// `units / 10^decimals`
pub fn from_base_units(units: u128, decimals: u32) -> Result<Decimal, UnitsError> {
    if decimals > MAX_DECIMALS {
        return Err(UnitsError::Decimals(decimals));
    }
    let mantissa =
        i128::try_from(units).map_err(|_| UnitsError::OutOfRange(units.to_string()))?;
    Decimal::try_from_i128_with_scale(mantissa, decimals)
        .map_err(|_| UnitsError::OutOfRange(units.to_string()))
}

/// `amount * 10^decimals`, refusing anything that does not land on a whole unit
pub fn to_base_units(amount: Decimal, decimals: u32) -> Result<u128, UnitsError> {
    if decimals > 18 {
        return Err(UnitsError::Decimals(decimals));
    }
    if amount.is_sign_negative() {
        return Err(UnitsError::OutOfRange(amount.to_string()));
    }

    let scale = Decimal::from(10u64.pow(decimals));
    let scaled = amount
        .checked_mul(scale)
        .ok_or_else(|| UnitsError::OutOfRange(amount.to_string()))?;

    if !scaled.fract().is_zero() {
        return Err(UnitsError::FractionalUnits(amount.to_string()));
    }

    scaled
        .trunc()
        .to_u128()
        .ok_or_else(|| UnitsError::OutOfRange(amount.to_string()))
}

/// Format base units for logs, e.g. `50.000000`
pub fn format_units(units: u128, decimals: u32) -> String {
    match from_base_units(units, decimals) {
        Ok(amount) => amount.to_string(),
        Err(_) => format!("{} base units", units),
    }
}
