//! Well-known type OIDs from the server catalog (`pg_type`).
//!
//! Only the types this crate decodes are listed. Anything else is surfaced
//! to callers as plain text.

/// Type OID as reported in a row description.
pub type Oid = u32;

/// `boolean`
pub const BOOL: Oid = 16;
/// `bytea`
pub const BYTEA: Oid = 17;
/// `"char"`
pub const CHAR: Oid = 18;
/// `name`
pub const NAME: Oid = 19;
/// `bigint`
pub const INT8: Oid = 20;
/// `smallint`
pub const INT2: Oid = 21;
/// `integer`
pub const INT4: Oid = 23;
/// `text`
pub const TEXT: Oid = 25;
/// `oid`
pub const OID: Oid = 26;
/// `json`
pub const JSON: Oid = 114;
/// `real`
pub const FLOAT4: Oid = 700;
/// `double precision`
pub const FLOAT8: Oid = 701;
/// `unknown`
pub const UNKNOWN: Oid = 705;
/// `character(n)`
pub const BPCHAR: Oid = 1042;
/// `character varying(n)`
pub const VARCHAR: Oid = 1043;
/// `date`
pub const DATE: Oid = 1082;
/// `time without time zone`
pub const TIME: Oid = 1083;
/// `timestamp without time zone`
pub const TIMESTAMP: Oid = 1114;
/// `timestamp with time zone`
pub const TIMESTAMPTZ: Oid = 1184;
/// `numeric`
pub const NUMERIC: Oid = 1700;
/// `uuid`
pub const UUID: Oid = 2950;
/// `jsonb`
pub const JSONB: Oid = 3802;

/// Human-readable name for a type OID, used in diagnostics.
#[must_use]
pub fn type_name(oid: Oid) -> &'static str {
    match oid {
        BOOL => "boolean",
        BYTEA => "bytea",
        CHAR => "\"char\"",
        NAME => "name",
        INT8 => "bigint",
        INT2 => "smallint",
        INT4 => "integer",
        TEXT => "text",
        OID => "oid",
        JSON => "json",
        FLOAT4 => "real",
        FLOAT8 => "double precision",
        UNKNOWN => "unknown",
        BPCHAR => "character",
        VARCHAR => "character varying",
        DATE => "date",
        TIME => "time",
        TIMESTAMP => "timestamp",
        TIMESTAMPTZ => "timestamptz",
        NUMERIC => "numeric",
        UUID => "uuid",
        JSONB => "jsonb",
        _ => "other",
    }
}
