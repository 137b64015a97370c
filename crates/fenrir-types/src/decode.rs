//! Text-format decoding of result fields.
//!
//! Result rows arrive in the text format. [`decode_text`] uses the column's
//! type OID to turn the raw text into a [`SqlValue`]. Unrecognized OIDs
//! decode to [`SqlValue::String`] so no field is ever unreadable.

use bytes::Bytes;

use crate::error::TypeError;
use crate::oid::{self, Oid};
use crate::value::SqlValue;

/// Decode one non-NULL field given its column type OID.
pub fn decode_text(type_oid: Oid, text: &str) -> Result<SqlValue, TypeError> {
    match type_oid {
        oid::BOOL => parse_bool(text).map(SqlValue::Bool),
        oid::INT2 => text
            .parse()
            .map(SqlValue::SmallInt)
            .map_err(|_| TypeError::parse("smallint", text)),
        oid::INT4 => text
            .parse()
            .map(SqlValue::Int)
            .map_err(|_| TypeError::parse("integer", text)),
        oid::INT8 => text
            .parse()
            .map(SqlValue::BigInt)
            .map_err(|_| TypeError::parse("bigint", text)),
        oid::OID => text
            .parse::<u32>()
            .map(|v| SqlValue::BigInt(i64::from(v)))
            .map_err(|_| TypeError::parse("oid", text)),
        oid::FLOAT4 => text
            .parse()
            .map(SqlValue::Float)
            .map_err(|_| TypeError::parse("real", text)),
        oid::FLOAT8 => text
            .parse()
            .map(SqlValue::Double)
            .map_err(|_| TypeError::parse("double precision", text)),
        oid::BYTEA => decode_bytea(text).map(|b| SqlValue::Binary(Bytes::from(b))),
        #[cfg(feature = "decimal")]
        oid::NUMERIC => text
            .parse::<rust_decimal::Decimal>()
            .map(SqlValue::Decimal)
            .map_err(|e| TypeError::InvalidDecimal(format!("{text}: {e}"))),
        #[cfg(feature = "uuid")]
        oid::UUID => uuid::Uuid::parse_str(text)
            .map(SqlValue::Uuid)
            .map_err(|e| TypeError::InvalidUuid(format!("{text}: {e}"))),
        #[cfg(feature = "chrono")]
        oid::DATE => chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .map(SqlValue::Date)
            .map_err(|e| TypeError::InvalidDateTime(format!("{text}: {e}"))),
        #[cfg(feature = "chrono")]
        oid::TIME => chrono::NaiveTime::parse_from_str(text, "%H:%M:%S%.f")
            .map(SqlValue::Time)
            .map_err(|e| TypeError::InvalidDateTime(format!("{text}: {e}"))),
        #[cfg(feature = "chrono")]
        oid::TIMESTAMP => chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
            .map(SqlValue::DateTime)
            .map_err(|e| TypeError::InvalidDateTime(format!("{text}: {e}"))),
        #[cfg(feature = "chrono")]
        oid::TIMESTAMPTZ => chrono::DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
            .map(SqlValue::DateTimeTz)
            .map_err(|e| TypeError::InvalidDateTime(format!("{text}: {e}"))),
        #[cfg(feature = "json")]
        oid::JSON | oid::JSONB => serde_json::from_str(text)
            .map(SqlValue::Json)
            .map_err(|e| TypeError::InvalidJson(e.to_string())),
        _ => Ok(SqlValue::String(text.to_owned())),
    }
}

/// Parse boolean wire text.
///
/// The server emits `t`/`f`; the longer spellings and `1`/`0` are accepted
/// for text columns holding flags.
pub fn parse_bool(text: &str) -> Result<bool, TypeError> {
    match text {
        "t" | "true" | "TRUE" | "True" | "1" | "y" | "yes" | "on" => Ok(true),
        "f" | "false" | "FALSE" | "False" | "0" | "n" | "no" | "off" => Ok(false),
        _ => Err(TypeError::parse("boolean", text)),
    }
}

/// Decode `bytea` text in either the hex (`\x..`) or the legacy escape format.
pub fn decode_bytea(text: &str) -> Result<Vec<u8>, TypeError> {
    if let Some(hex) = text.strip_prefix("\\x") {
        return decode_hex(hex);
    }

    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        match bytes.get(i + 1) {
            Some(b'\\') => {
                out.push(b'\\');
                i += 2;
            }
            Some(_) if i + 4 <= bytes.len() && is_octal_triplet(&bytes[i + 1..i + 4]) => {
                let digits = &bytes[i + 1..i + 4];
                let value = digits
                    .iter()
                    .fold(0u16, |acc, d| acc * 8 + u16::from(d - b'0'));
                let byte = u8::try_from(value).map_err(|_| {
                    TypeError::InvalidBinary(format!("octal escape out of range at offset {i}"))
                })?;
                out.push(byte);
                i += 4;
            }
            _ => {
                return Err(TypeError::InvalidBinary(format!(
                    "invalid escape sequence at offset {i}"
                )));
            }
        }
    }
    Ok(out)
}

fn is_octal_triplet(digits: &[u8]) -> bool {
    digits.len() == 3 && digits.iter().all(|d| (b'0'..=b'7').contains(d))
}

fn decode_hex(hex: &str) -> Result<Vec<u8>, TypeError> {
    let hex = hex.as_bytes();
    if hex.len() % 2 != 0 {
        return Err(TypeError::InvalidBinary("odd number of hex digits".into()));
    }
    hex.chunks_exact(2)
        .map(|pair| Ok((hex_digit(pair[0])? << 4) | hex_digit(pair[1])?))
        .collect()
}

fn hex_digit(d: u8) -> Result<u8, TypeError> {
    match d {
        b'0'..=b'9' => Ok(d - b'0'),
        b'a'..=b'f' => Ok(d - b'a' + 10),
        b'A'..=b'F' => Ok(d - b'A' + 10),
        _ => Err(TypeError::InvalidBinary(format!(
            "invalid hex digit {:?}",
            char::from(d)
        ))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_integers() {
        assert_eq!(decode_text(oid::INT4, "42").unwrap(), SqlValue::Int(42));
        assert_eq!(decode_text(oid::INT2, "-7").unwrap(), SqlValue::SmallInt(-7));
        assert_eq!(
            decode_text(oid::INT8, "9000000000").unwrap(),
            SqlValue::BigInt(9_000_000_000)
        );
        assert!(matches!(
            decode_text(oid::INT4, "forty-two"),
            Err(TypeError::Parse { target_type: "integer", .. })
        ));
    }

    #[test]
    fn test_decode_bool() {
        assert_eq!(decode_text(oid::BOOL, "t").unwrap(), SqlValue::Bool(true));
        assert_eq!(decode_text(oid::BOOL, "f").unwrap(), SqlValue::Bool(false));
        assert!(decode_text(oid::BOOL, "maybe").is_err());
    }

    #[test]
    fn test_decode_float_specials() {
        assert_eq!(
            decode_text(oid::FLOAT8, "Infinity").unwrap(),
            SqlValue::Double(f64::INFINITY)
        );
        match decode_text(oid::FLOAT8, "NaN").unwrap() {
            SqlValue::Double(v) => assert!(v.is_nan()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_oid_is_text() {
        assert_eq!(
            decode_text(600, "(1,2)").unwrap(),
            SqlValue::String("(1,2)".into())
        );
        assert_eq!(
            decode_text(oid::TEXT, "hello").unwrap(),
            SqlValue::String("hello".into())
        );
    }

    #[test]
    fn test_decode_bytea_hex() {
        assert_eq!(decode_bytea("\\xdeadBEEF").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
        assert!(decode_bytea("\\xabc").is_err());
        assert!(decode_bytea("\\xzz").is_err());
    }

    #[test]
    fn test_decode_bytea_escape() {
        assert_eq!(decode_bytea("abc").unwrap(), b"abc".to_vec());
        assert_eq!(decode_bytea("a\\\\b").unwrap(), b"a\\b".to_vec());
        assert_eq!(decode_bytea("\\000\\377").unwrap(), vec![0u8, 255]);
        assert!(decode_bytea("\\9").is_err());
    }

    #[cfg(feature = "chrono")]
    #[test]
    fn test_decode_timestamptz_short_offset() {
        let value = decode_text(oid::TIMESTAMPTZ, "2024-01-02 03:04:05.5+02").unwrap();
        match value {
            SqlValue::DateTimeTz(dt) => {
                assert_eq!(dt.offset().local_minus_utc(), 2 * 3600);
                assert_eq!(dt.timestamp_subsec_millis(), 500);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[cfg(feature = "chrono")]
    #[test]
    fn test_decode_date() {
        assert_eq!(
            decode_text(oid::DATE, "2023-12-31").unwrap(),
            SqlValue::Date(chrono::NaiveDate::from_ymd_opt(2023, 12, 31).unwrap())
        );
        assert!(decode_text(oid::DATE, "infinity").is_err());
    }

    #[cfg(feature = "uuid")]
    #[test]
    fn test_decode_uuid() {
        let text = "a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11";
        assert_eq!(
            decode_text(oid::UUID, text).unwrap(),
            SqlValue::Uuid(uuid::Uuid::parse_str(text).unwrap())
        );
    }
}
