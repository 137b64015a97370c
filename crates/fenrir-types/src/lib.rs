//! # fenrir-types
//!
//! Value model and text-format conversions for the fenrir PostgreSQL client.
//!
//! Every parameter travels to the server in the text format and every result
//! field comes back in the text format. This crate owns both directions:
//! [`ToSql`] turns a Rust value into a [`SqlValue`] and from there into wire
//! text (or the NULL marker), while [`decode_text`] and [`FromSql`] turn a
//! column's wire text back into typed Rust values.
//!
//! ## Features
//!
//! - `chrono` (default): date/time support via chrono
//! - `uuid` (default): UUID support
//! - `decimal` (default): NUMERIC support via rust_decimal
//! - `json`: JSON/JSONB support via serde_json
//!
//! ## Type Mappings
//!
//! | PostgreSQL Type | Rust Type |
//! |-----------------|-----------|
//! | `boolean` | `bool` |
//! | `smallint` | `i16` |
//! | `integer` | `i32` |
//! | `bigint` | `i64` |
//! | `real` | `f32` |
//! | `double precision` | `f64` |
//! | `numeric` | `rust_decimal::Decimal` |
//! | `text`/`varchar`/`char`/`name` | `String` |
//! | `bytea` | `Vec<u8>` / `bytes::Bytes` |
//! | `date` | `chrono::NaiveDate` |
//! | `time` | `chrono::NaiveTime` |
//! | `timestamp` | `chrono::NaiveDateTime` |
//! | `timestamptz` | `chrono::DateTime<FixedOffset>` |
//! | `uuid` | `uuid::Uuid` |
//! | `json`/`jsonb` | `serde_json::Value` |

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod decode;
pub mod encode;
pub mod error;
pub mod from_sql;
pub mod oid;
pub mod to_sql;
pub mod value;

pub use decode::decode_text;
pub use encode::{encode_bytea_hex, encode_text};
pub use error::TypeError;
pub use from_sql::FromSql;
pub use to_sql::ToSql;
pub use value::SqlValue;
