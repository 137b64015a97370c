//! SQL value representation.

use bytes::Bytes;

/// A SQL value that can be sent as a parameter or decoded from a result.
///
/// This is the closed set of cases parameters are dispatched through before
/// being rendered as wire text. [`SqlValue::Null`] is rendered as the wire
/// NULL marker rather than as text.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum SqlValue {
    /// NULL value.
    #[default]
    Null,
    /// Boolean value (`boolean`).
    Bool(bool),
    /// 16-bit signed integer (`smallint`).
    SmallInt(i16),
    /// 32-bit signed integer (`integer`).
    Int(i32),
    /// 64-bit signed integer (`bigint`).
    BigInt(i64),
    /// 32-bit floating point (`real`).
    Float(f32),
    /// 64-bit floating point (`double precision`).
    Double(f64),
    /// String value (`text`, `varchar`, `char`, `name`).
    String(String),
    /// Binary value (`bytea`).
    Binary(Bytes),
    /// Decimal value (`numeric`).
    #[cfg(feature = "decimal")]
    Decimal(rust_decimal::Decimal),
    /// UUID value (`uuid`).
    #[cfg(feature = "uuid")]
    Uuid(uuid::Uuid),
    /// Date value (`date`).
    #[cfg(feature = "chrono")]
    Date(chrono::NaiveDate),
    /// Time value (`time`).
    #[cfg(feature = "chrono")]
    Time(chrono::NaiveTime),
    /// Timestamp without time zone (`timestamp`).
    #[cfg(feature = "chrono")]
    DateTime(chrono::NaiveDateTime),
    /// Timestamp with time zone (`timestamptz`).
    #[cfg(feature = "chrono")]
    DateTimeTz(chrono::DateTime<chrono::FixedOffset>),
    /// JSON document (`json`, `jsonb`).
    #[cfg(feature = "json")]
    Json(serde_json::Value),
}

impl SqlValue {
    /// Check if the value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the value as a bool, if it is one.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Get the value as an i32, if it fits.
    #[must_use]
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::Int(v) => Some(*v),
            Self::SmallInt(v) => Some(i32::from(*v)),
            Self::BigInt(v) => i32::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Get the value as an i64, if it is an integer.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::BigInt(v) => Some(*v),
            Self::Int(v) => Some(i64::from(*v)),
            Self::SmallInt(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// Get the value as an f64, if it is floating point.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Double(v) => Some(*v),
            Self::Float(v) => Some(f64::from(*v)),
            _ => None,
        }
    }

    /// Get the value as a string slice, if it is one.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    /// Get the value as bytes, if it is binary.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(v) => Some(v),
            _ => None,
        }
    }

    /// Get the server type name of this value.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Bool(_) => "boolean",
            Self::SmallInt(_) => "smallint",
            Self::Int(_) => "integer",
            Self::BigInt(_) => "bigint",
            Self::Float(_) => "real",
            Self::Double(_) => "double precision",
            Self::String(_) => "text",
            Self::Binary(_) => "bytea",
            #[cfg(feature = "decimal")]
            Self::Decimal(_) => "numeric",
            #[cfg(feature = "uuid")]
            Self::Uuid(_) => "uuid",
            #[cfg(feature = "chrono")]
            Self::Date(_) => "date",
            #[cfg(feature = "chrono")]
            Self::Time(_) => "time",
            #[cfg(feature = "chrono")]
            Self::DateTime(_) => "timestamp",
            #[cfg(feature = "chrono")]
            Self::DateTimeTz(_) => "timestamptz",
            #[cfg(feature = "json")]
            Self::Json(_) => "json",
        }
    }

    /// Render this value as wire text.
    ///
    /// Returns `None` for NULL, which is sent as the wire NULL marker.
    #[must_use]
    pub fn encode_text(&self) -> Option<String> {
        crate::encode::encode_text(self)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i16> for SqlValue {
    fn from(v: i16) -> Self {
        Self::SmallInt(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::BigInt(v)
    }
}

impl From<f32> for SqlValue {
    fn from(v: f32) -> Self {
        Self::Float(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(v))
    }
}

impl<T> From<Option<T>> for SqlValue
where
    T: Into<SqlValue>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Self::Null,
        }
    }
}

#[cfg(feature = "uuid")]
impl From<uuid::Uuid> for SqlValue {
    fn from(v: uuid::Uuid) -> Self {
        Self::Uuid(v)
    }
}

#[cfg(feature = "decimal")]
impl From<rust_decimal::Decimal> for SqlValue {
    fn from(v: rust_decimal::Decimal) -> Self {
        Self::Decimal(v)
    }
}

#[cfg(feature = "chrono")]
impl From<chrono::NaiveDate> for SqlValue {
    fn from(v: chrono::NaiveDate) -> Self {
        Self::Date(v)
    }
}

#[cfg(feature = "chrono")]
impl From<chrono::NaiveDateTime> for SqlValue {
    fn from(v: chrono::NaiveDateTime) -> Self {
        Self::DateTime(v)
    }
}

#[cfg(feature = "json")]
impl From<serde_json::Value> for SqlValue {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}
