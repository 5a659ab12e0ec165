//! Decimal coin amounts.

use trove_core::constants::{COIN, DECIMALS};
use trove_core::error::ValidationError;

/// Parse a decimal amount such as `"0.0001"` into satoshis.
pub fn parse_amount(input: &str) -> Result<u64, ValidationError> {
    let s = input.trim();
    let invalid = || ValidationError::InvalidAmount(input.to_string());
    if s.is_empty() {
        return Err(invalid());
    }
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return Err(invalid());
    }
    if frac.len() > DECIMALS as usize
        || !whole.chars().all(|c| c.is_ascii_digit())
        || !frac.chars().all(|c| c.is_ascii_digit())
    {
        return Err(invalid());
    }
    let whole: u64 = if whole.is_empty() { 0 } else { whole.parse().map_err(|_| invalid())? };
    let padded = format!("{frac:0<width$}", width = DECIMALS as usize);
    let frac: u64 = padded.parse().map_err(|_| invalid())?;
    whole
        .checked_mul(COIN)
        .and_then(|v| v.checked_add(frac))
        .ok_or(ValidationError::ValueOverflow)
}

/// Format satoshis as a decimal amount, trimming trailing zeros.
pub fn format_amount(value: u64) -> String {
    let whole = value / COIN;
    let frac = value % COIN;
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{frac:0width$}", width = DECIMALS as usize);
    format!("{whole}.{}", frac.trim_end_matches('0'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parse_fractional() {
        assert_eq!(parse_amount("0.0001").unwrap(), 10_000);
        assert_eq!(parse_amount("1.5").unwrap(), 150_000_000);
        assert_eq!(parse_amount(".5").unwrap(), 50_000_000);
        assert_eq!(parse_amount(" 2 ").unwrap(), 200_000_000);
    }

    #[test]
    fn parse_rejects_garbage() {
        for bad in ["", ".", "1.2.3", "-1", "1e5", "0.000000001", "abc"] {
            assert!(parse_amount(bad).is_err(), "{bad} should fail");
        }
    }

    #[test]
    fn parse_overflow() {
        assert_eq!(
            parse_amount("999999999999999"),
            Err(ValidationError::ValueOverflow)
        );
    }

    #[test]
    fn format_trims_zeros() {
        assert_eq!(format_amount(10_000), "0.0001");
        assert_eq!(format_amount(150_000_000), "1.5");
        assert_eq!(format_amount(300_000_000), "3");
        assert_eq!(format_amount(1), "0.00000001");
    }

    proptest! {
        #[test]
        fn formatted_amount_parses_back(value in 0u64..=21_000_000 * COIN) {
            prop_assert_eq!(parse_amount(&format_amount(value)), Ok(value));
        }
    }
}
