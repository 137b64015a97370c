//! Trait for converting from SQL values to Rust types.

use crate::decode::parse_bool;
use crate::error::TypeError;
use crate::value::SqlValue;

/// Trait for types that can be extracted from result fields.
///
/// Integer targets accept any narrower or wider integer case as long as the
/// value fits. Text values are parsed, since columns of unknown type decode
/// to [`SqlValue::String`].
pub trait FromSql: Sized {
    /// Convert from a SQL value to this type.
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError>;

    /// Convert from an optional SQL value.
    ///
    /// Returns `None` if the value is NULL.
    fn from_sql_nullable(value: &SqlValue) -> Result<Option<Self>, TypeError> {
        if value.is_null() {
            Ok(None)
        } else {
            Self::from_sql(value).map(Some)
        }
    }
}

fn mismatch(expected: &'static str, value: &SqlValue) -> TypeError {
    TypeError::TypeMismatch {
        expected,
        actual: value.type_name().to_string(),
    }
}

fn parse_text<T: std::str::FromStr>(target_type: &'static str, text: &str) -> Result<T, TypeError> {
    text.trim().parse().map_err(|_| TypeError::Parse {
        target_type,
        value: text.to_owned(),
    })
}

macro_rules! impl_from_sql_int {
    ($ty:ty, $name:literal) => {
        impl FromSql for $ty {
            fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
                let out_of_range = || TypeError::OutOfRange { target_type: $name };
                match value {
                    SqlValue::SmallInt(v) => <$ty>::try_from(*v).map_err(|_| out_of_range()),
                    SqlValue::Int(v) => <$ty>::try_from(*v).map_err(|_| out_of_range()),
                    SqlValue::BigInt(v) => <$ty>::try_from(*v).map_err(|_| out_of_range()),
                    SqlValue::String(s) => parse_text($name, s),
                    SqlValue::Null => Err(TypeError::UnexpectedNull),
                    _ => Err(mismatch($name, value)),
                }
            }
        }
    };
}

impl_from_sql_int!(i16, "i16");
impl_from_sql_int!(i32, "i32");
impl_from_sql_int!(i64, "i64");
impl_from_sql_int!(u32, "u32");
impl_from_sql_int!(u64, "u64");

impl FromSql for bool {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Bool(v) => Ok(*v),
            SqlValue::SmallInt(v) => Ok(*v != 0),
            SqlValue::Int(v) => Ok(*v != 0),
            SqlValue::BigInt(v) => Ok(*v != 0),
            SqlValue::String(s) => parse_bool(s.trim()),
            SqlValue::Null => Err(TypeError::UnexpectedNull),
            _ => Err(mismatch("bool", value)),
        }
    }
}

impl FromSql for f32 {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Float(v) => Ok(*v),
            SqlValue::SmallInt(v) => Ok(f32::from(*v)),
            SqlValue::String(s) => parse_text("f32", s),
            SqlValue::Null => Err(TypeError::UnexpectedNull),
            _ => Err(mismatch("f32", value)),
        }
    }
}

impl FromSql for f64 {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Double(v) => Ok(*v),
            SqlValue::Float(v) => Ok(f64::from(*v)),
            SqlValue::SmallInt(v) => Ok(f64::from(*v)),
            SqlValue::Int(v) => Ok(f64::from(*v)),
            #[cfg(feature = "decimal")]
            SqlValue::Decimal(v) => {
                use rust_decimal::prelude::ToPrimitive;
                v.to_f64().ok_or(TypeError::OutOfRange { target_type: "f64" })
            }
            SqlValue::String(s) => parse_text("f64", s),
            SqlValue::Null => Err(TypeError::UnexpectedNull),
            _ => Err(mismatch("f64", value)),
        }
    }
}

impl FromSql for String {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::String(v) => Ok(v.clone()),
            SqlValue::Null => Err(TypeError::UnexpectedNull),
            // Any other case reads back as the same text the server sent.
            other => other.encode_text().ok_or(TypeError::UnexpectedNull),
        }
    }
}

impl FromSql for Vec<u8> {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Binary(v) => Ok(v.to_vec()),
            SqlValue::Null => Err(TypeError::UnexpectedNull),
            _ => Err(mismatch("Vec<u8>", value)),
        }
    }
}

impl FromSql for bytes::Bytes {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Binary(v) => Ok(v.clone()),
            SqlValue::Null => Err(TypeError::UnexpectedNull),
            _ => Err(mismatch("Bytes", value)),
        }
    }
}

impl FromSql for SqlValue {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        Ok(value.clone())
    }
}

impl<T: FromSql> FromSql for Option<T> {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        T::from_sql_nullable(value)
    }
}

#[cfg(feature = "uuid")]
impl FromSql for uuid::Uuid {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Uuid(v) => Ok(*v),
            SqlValue::String(s) => {
                uuid::Uuid::parse_str(s).map_err(|e| TypeError::InvalidUuid(e.to_string()))
            }
            SqlValue::Null => Err(TypeError::UnexpectedNull),
            _ => Err(mismatch("Uuid", value)),
        }
    }
}

#[cfg(feature = "decimal")]
impl FromSql for rust_decimal::Decimal {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Decimal(v) => Ok(*v),
            SqlValue::SmallInt(v) => Ok(rust_decimal::Decimal::from(*v)),
            SqlValue::Int(v) => Ok(rust_decimal::Decimal::from(*v)),
            SqlValue::BigInt(v) => Ok(rust_decimal::Decimal::from(*v)),
            SqlValue::String(s) => s
                .parse()
                .map_err(|e: rust_decimal::Error| TypeError::InvalidDecimal(e.to_string())),
            SqlValue::Null => Err(TypeError::UnexpectedNull),
            _ => Err(mismatch("Decimal", value)),
        }
    }
}

#[cfg(feature = "chrono")]
impl FromSql for chrono::NaiveDate {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Date(v) => Ok(*v),
            SqlValue::Null => Err(TypeError::UnexpectedNull),
            _ => Err(mismatch("NaiveDate", value)),
        }
    }
}

#[cfg(feature = "chrono")]
impl FromSql for chrono::NaiveTime {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Time(v) => Ok(*v),
            SqlValue::Null => Err(TypeError::UnexpectedNull),
            _ => Err(mismatch("NaiveTime", value)),
        }
    }
}

#[cfg(feature = "chrono")]
impl FromSql for chrono::NaiveDateTime {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::DateTime(v) => Ok(*v),
            SqlValue::DateTimeTz(v) => Ok(v.naive_utc()),
            SqlValue::Null => Err(TypeError::UnexpectedNull),
            _ => Err(mismatch("NaiveDateTime", value)),
        }
    }
}

#[cfg(feature = "chrono")]
impl FromSql for chrono::DateTime<chrono::FixedOffset> {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::DateTimeTz(v) => Ok(*v),
            SqlValue::Null => Err(TypeError::UnexpectedNull),
            _ => Err(mismatch("DateTime<FixedOffset>", value)),
        }
    }
}

#[cfg(feature = "chrono")]
impl FromSql for chrono::DateTime<chrono::Utc> {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::DateTimeTz(v) => Ok(v.with_timezone(&chrono::Utc)),
            SqlValue::DateTime(v) => Ok(v.and_utc()),
            SqlValue::Null => Err(TypeError::UnexpectedNull),
            _ => Err(mismatch("DateTime<Utc>", value)),
        }
    }
}

#[cfg(feature = "json")]
impl FromSql for serde_json::Value {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Json(v) => Ok(v.clone()),
            SqlValue::String(s) => {
                serde_json::from_str(s).map_err(|e| TypeError::InvalidJson(e.to_string()))
            }
            SqlValue::Null => Err(TypeError::UnexpectedNull),
            _ => Err(mismatch("serde_json::Value", value)),
        }
    }
}
