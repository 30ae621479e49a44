//! Ether amount parsing.

use alloy_primitives::U256;

/// Decimals in one ether.
pub const ETHER_DECIMALS: usize = 18;

/// Parse a decimal ether amount such as `"1.5"` into wei.
///
/// Fractional digits beyond 18 are truncated. Signs, exponents and
/// anything but ASCII digits and one `.` are rejected.
pub fn parse_ether(input: &str) -> Result<U256, String> {
    let s = input.trim();
    let (int_part, frac_part) = match s.split_once('.') {
        Some((i, f)) => (i, f),
        None => (s, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(format!("invalid ether amount: {input:?}"));
    }
    let all_digits = |p: &str| p.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(int_part) || !all_digits(frac_part) {
        return Err(format!("invalid ether amount: {input:?}"));
    }

    let mut frac = frac_part[..frac_part.len().min(ETHER_DECIMALS)].to_string();
    while frac.len() < ETHER_DECIMALS {
        frac.push('0');
    }

    let overflow = || format!("ether amount out of range: {input:?}");
    let int = if int_part.is_empty() {
        U256::ZERO
    } else {
        U256::from_str_radix(int_part, 10).map_err(|_| overflow())?
    };
    let frac = U256::from_str_radix(&frac, 10).map_err(|_| overflow())?;
    let scale = U256::from(10u64).pow(U256::from(ETHER_DECIMALS as u64));

    int.checked_mul(scale)
        .and_then(|wei| wei.checked_add(frac))
        .ok_or_else(overflow)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wei(s: &str) -> U256 {
        U256::from_str_radix(s, 10).unwrap()
    }

    #[test]
    fn whole_and_fractional() {
        assert_eq!(parse_ether("1").unwrap(), wei("1000000000000000000"));
        assert_eq!(parse_ether("1.5").unwrap(), wei("1500000000000000000"));
        assert_eq!(parse_ether("0.000000000000000001").unwrap(), U256::from(1u64));
        assert_eq!(parse_ether(".25").unwrap(), wei("250000000000000000"));
        assert_eq!(parse_ether("10.").unwrap(), wei("10000000000000000000"));
        assert_eq!(parse_ether(" 2 ").unwrap(), wei("2000000000000000000"));
    }

    #[test]
    fn extra_fraction_digits_truncated() {
        assert_eq!(
            parse_ether("0.0000000000000000019").unwrap(),
            U256::from(1u64)
        );
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", ".", "-1", "1e18", "abc", "1.2.3", "0x10", "+1"] {
            assert!(parse_ether(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn rejects_overflow() {
        let huge = "9".repeat(80);
        assert!(parse_ether(&huge).is_err());
    }
}
