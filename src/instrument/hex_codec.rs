//! Eight-digit hexadecimal number format used by the VSM magnet controller.
//!
//! Layout of a word, most significant digit first:
//!
//! | digits | content                                             |
//! |--------|-----------------------------------------------------|
//! | 0      | sign, `0` positive or `8` negative                  |
//! | 1      | binary exponent plus one                            |
//! | 2..4   | integer part of `mantissa * 128`                    |
//! | 4..8   | fractional part of `mantissa * 128`, times 65536     |
//!
//! The mantissa is the magnitude halved until it is below 2. Values below 1
//! are not normalized upward, so tiny values lose relative precision. Zero is
//! always `00000000`.

use anyhow::{bail, Context, Result};

/// Smallest magnitude that no longer fits the exponent digit.
pub const MAX_MAGNITUDE: f64 = 32768.0;

/// Encode a value as an uppercase 8-digit word.
pub fn encode(value: f64) -> Result<String> {
    if !value.is_finite() {
        bail!("cannot encode {value} for the magnet controller");
    }
    if value == 0.0 {
        return Ok("00000000".to_string());
    }
    let magnitude = value.abs();
    if magnitude >= MAX_MAGNITUDE {
        bail!("{value} is out of range for the magnet controller (|x| < {MAX_MAGNITUDE})");
    }

    let sign = if value > 0.0 { 0 } else { 8 };
    let mut mantissa = magnitude;
    let mut exponent = 0u32;
    while mantissa >= 2.0 {
        mantissa /= 2.0;
        exponent += 1;
    }

    let scaled = mantissa * 128.0;
    let integer = scaled.trunc();
    let fraction = ((scaled - integer) * 65536.0).trunc();
    Ok(format!(
        "{sign:X}{:X}{:02X}{:04X}",
        exponent + 1,
        integer as u32,
        fraction as u32
    ))
}

/// Decode an 8-digit word. Hex digits are accepted in either case.
pub fn decode(word: &str) -> Result<f64> {
    let word = word.trim();
    if word.len() != 8 || !word.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("'{word}' is not an 8-digit hex word");
    }

    let sign = match &word[0..1] {
        "0" => 1.0,
        "8" => -1.0,
        other => bail!("'{word}' has invalid sign digit '{other}'"),
    };
    let exponent = i32::from_str_radix(&word[1..2], 16).context("exponent digit")? - 1;
    let integer = u32::from_str_radix(&word[2..4], 16).context("mantissa digits")?;
    let fraction = u32::from_str_radix(&word[4..8], 16).context("fraction digits")?;

    let mantissa = (f64::from(integer) + f64::from(fraction) / 65536.0) / 128.0;
    Ok(sign * mantissa * 2f64.powi(exponent))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn known_words() {
        assert_eq!(encode(0.0).unwrap(), "00000000");
        assert_eq!(encode(1.0).unwrap(), "01800000");
        assert_eq!(encode(4.0).unwrap(), "03800000");
        assert_eq!(encode(-4.0).unwrap(), "83800000");
        assert_eq!(encode(1000.0).unwrap(), "0AFA0000");
        assert_eq!(encode(0.5).unwrap(), "01400000");
    }

    #[test]
    fn decode_is_case_insensitive() {
        assert_eq!(decode("0afa0000").unwrap(), 1000.0);
        assert_eq!(decode("0AFA0000").unwrap(), 1000.0);
    }

    #[test]
    fn zero_decodes_to_zero() {
        assert_eq!(decode("00000000").unwrap(), 0.0);
    }

    #[test]
    fn integers_round_trip_exactly() {
        for value in -100..100 {
            let value = f64::from(value);
            assert_eq!(decode(&encode(value).unwrap()).unwrap(), value);
        }
    }

    #[test]
    fn malformed_words_are_rejected() {
        assert!(decode("1AFA0000").is_err());
        assert!(decode("0AFA000").is_err());
        assert!(decode("0AFG0000").is_err());
        assert!(encode(f64::NAN).is_err());
        assert!(encode(40000.0).is_err());
    }

    proptest! {
        #[test]
        fn round_trip_within_resolution(value in -15000.0f64..15000.0) {
            let decoded = decode(&encode(value).unwrap()).unwrap();
            // one fraction LSB at the value's exponent, plus the unnormalized floor
            let tolerance = value.abs() / (128.0 * 65536.0) * 2.0 + 1.0 / (128.0 * 65536.0);
            prop_assert!((decoded - value).abs() <= tolerance);
        }

        #[test]
        fn encoding_is_idempotent(value in -15000.0f64..15000.0) {
            let once = decode(&encode(value).unwrap()).unwrap();
            let twice = decode(&encode(once).unwrap()).unwrap();
            prop_assert_eq!(once, twice);
        }
    }
}
