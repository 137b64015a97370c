//! Text-format encoding of parameter values.
//!
//! Parameters are always sent in the text format with unspecified type OIDs,
//! leaving type inference to the server. The rendering here matches what the
//! server's input functions accept for each type.

use std::fmt::Write as _;

use crate::value::SqlValue;

/// Render a value as wire text, or `None` for the NULL marker.
#[must_use]
pub fn encode_text(value: &SqlValue) -> Option<String> {
    let text = match value {
        SqlValue::Null => return None,
        SqlValue::Bool(v) => if *v { "true" } else { "false" }.to_owned(),
        SqlValue::SmallInt(v) => v.to_string(),
        SqlValue::Int(v) => v.to_string(),
        SqlValue::BigInt(v) => v.to_string(),
        SqlValue::Float(v) => encode_float(f64::from(*v), v.to_string()),
        SqlValue::Double(v) => encode_float(*v, v.to_string()),
        SqlValue::String(v) => v.clone(),
        SqlValue::Binary(v) => encode_bytea_hex(v),
        #[cfg(feature = "decimal")]
        SqlValue::Decimal(v) => v.to_string(),
        #[cfg(feature = "uuid")]
        SqlValue::Uuid(v) => v.hyphenated().to_string(),
        #[cfg(feature = "chrono")]
        SqlValue::Date(v) => v.format("%Y-%m-%d").to_string(),
        #[cfg(feature = "chrono")]
        SqlValue::Time(v) => v.format("%H:%M:%S%.f").to_string(),
        #[cfg(feature = "chrono")]
        SqlValue::DateTime(v) => v.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
        #[cfg(feature = "chrono")]
        SqlValue::DateTimeTz(v) => v.format("%Y-%m-%d %H:%M:%S%.f%:z").to_string(),
        #[cfg(feature = "json")]
        SqlValue::Json(v) => v.to_string(),
    };
    Some(text)
}

// `finite` is the shortest round-trip rendering of the original width, so
// `0.1f32` is sent as "0.1" rather than its widened f64 expansion.
fn encode_float(v: f64, finite: String) -> String {
    if v.is_nan() {
        "NaN".to_owned()
    } else if v.is_infinite() {
        if v.is_sign_positive() {
            "Infinity".to_owned()
        } else {
            "-Infinity".to_owned()
        }
    } else {
        finite
    }
}

/// Encode bytes in the `bytea` hex format (`\x` followed by hex digits).
#[must_use]
pub fn encode_bytea_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for b in bytes {
        // Writing to a String cannot fail.
        let _ = write!(out, "{b:02x}");
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_null_has_no_text() {
        assert_eq!(encode_text(&SqlValue::Null), None);
    }

    #[test]
    fn test_bool_text() {
        assert_eq!(encode_text(&SqlValue::Bool(true)).as_deref(), Some("true"));
        assert_eq!(encode_text(&SqlValue::Bool(false)).as_deref(), Some("false"));
    }

    #[test]
    fn test_integer_text() {
        assert_eq!(encode_text(&SqlValue::Int(-42)).as_deref(), Some("-42"));
        assert_eq!(
            encode_text(&SqlValue::BigInt(i64::MAX)).as_deref(),
            Some("9223372036854775807")
        );
    }

    #[test]
    fn test_float_special_values() {
        assert_eq!(encode_text(&SqlValue::Double(f64::NAN)).as_deref(), Some("NaN"));
        assert_eq!(
            encode_text(&SqlValue::Double(f64::INFINITY)).as_deref(),
            Some("Infinity")
        );
        assert_eq!(
            encode_text(&SqlValue::Float(f32::NEG_INFINITY)).as_deref(),
            Some("-Infinity")
        );
        assert_eq!(encode_text(&SqlValue::Float(0.1)).as_deref(), Some("0.1"));
        assert_eq!(encode_text(&SqlValue::Double(2.5)).as_deref(), Some("2.5"));
    }

    #[test]
    fn test_string_is_verbatim() {
        let text = "Robert'); DROP TABLE students;--";
        assert_eq!(
            encode_text(&SqlValue::String(text.into())).as_deref(),
            Some(text)
        );
    }

    #[test]
    fn test_bytea_hex() {
        assert_eq!(encode_bytea_hex(&[0xde, 0xad, 0x00, 0x0f]), "\\xdead000f");
        assert_eq!(encode_bytea_hex(&[]), "\\x");
    }

    #[cfg(feature = "chrono")]
    #[test]
    fn test_timestamp_text() {
        let ts = chrono::NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_micro_opt(7, 8, 9, 120_000)
            .unwrap();
        assert_eq!(
            encode_text(&SqlValue::DateTime(ts)).as_deref(),
            Some("2024-03-09 07:08:09.120")
        );
    }
}
