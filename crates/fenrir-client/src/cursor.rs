//! Result cursor over one command's reply.
//!
//! A [`ResultCursor`] owns the fully buffered reply of a single command.
//! Fields are kept as the text the server sent; typed access decodes them
//! on demand using the column's type OID, so a `bool` column reported as
//! `t` still reads back as `true`.
//!
//! ```rust,ignore
//! let cursor = conn.execute("SELECT id, name FROM users")?;
//! for row in cursor.rows() {
//!     let id: i32 = row.get(0)?;
//!     let name: Option<String> = row.try_get(1);
//! }
//! ```

use fenrir_codec::{ColumnDesc, RawResult, ResultStatus};
use fenrir_types::{FromSql, SqlValue, decode_text};

use crate::error::{Error, Result};

/// Column metadata of a result.
pub type Column = ColumnDesc;

/// The buffered reply of one command.
///
/// The cursor exclusively owns its rows. It cannot be cloned, and dropping
/// it releases the buffered reply exactly once.
#[derive(Debug)]
pub struct ResultCursor {
    result: RawResult,
}

impl ResultCursor {
    pub(crate) fn new(result: RawResult) -> Self {
        Self { result }
    }

    /// Number of rows in the result.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.result.rows().len()
    }

    /// Number of columns in the result.
    #[must_use]
    pub fn column_count(&self) -> usize {
        self.result.columns().len()
    }

    /// Check if the result has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.result.rows().is_empty()
    }

    /// Outcome class reported by the server.
    #[must_use]
    pub fn status(&self) -> ResultStatus {
        self.result.status()
    }

    /// Column metadata.
    #[must_use]
    pub fn columns(&self) -> &[Column] {
        self.result.columns()
    }

    /// Name of column `col`.
    pub fn column_name(&self, col: usize) -> Result<&str> {
        self.column(col).map(|c| c.name.as_str())
    }

    /// Index of the column called `name`.
    ///
    /// An exact match wins; otherwise the first case-insensitive match is
    /// used.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        let columns = self.result.columns();
        columns.iter().position(|c| c.name == name).or_else(|| {
            columns
                .iter()
                .position(|c| c.name.eq_ignore_ascii_case(name))
        })
    }

    /// Type OID of column `col`.
    pub fn column_type(&self, col: usize) -> Result<u32> {
        self.column(col).map(|c| c.type_oid)
    }

    /// Check if the field at (`row`, `col`) is NULL.
    pub fn is_null(&self, row: usize, col: usize) -> Result<bool> {
        Ok(self.field(row, col)?.is_none())
    }

    /// Raw wire text of the field at (`row`, `col`); `None` for NULL.
    pub fn get_value(&self, row: usize, col: usize) -> Result<Option<&str>> {
        Ok(self.field(row, col)?.as_deref())
    }

    /// Raw wire text of the named field in `row`.
    pub fn get_value_by_name(&self, row: usize, name: &str) -> Result<Option<&str>> {
        self.get_value(row, self.index_of(name)?)
    }

    /// Decode the field at (`row`, `col`) into a [`SqlValue`].
    pub fn value(&self, row: usize, col: usize) -> Result<SqlValue> {
        let type_oid = self.column(col)?.type_oid;
        match self.field(row, col)? {
            Some(text) => Ok(decode_text(type_oid, text)?),
            None => Ok(SqlValue::Null),
        }
    }

    /// Decode the field at (`row`, `col`) as `T`.
    ///
    /// A NULL field converts only into types that accept NULL, such as
    /// `Option<T>`.
    pub fn get<T: FromSql>(&self, row: usize, col: usize) -> Result<T> {
        let value = self.value(row, col)?;
        Ok(T::from_sql(&value)?)
    }

    /// Decode the named field in `row` as `T`.
    pub fn get_by_name<T: FromSql>(&self, row: usize, name: &str) -> Result<T> {
        self.get(row, self.index_of(name)?)
    }

    /// Decode the field at (`row`, `col`), returning `None` for NULL or on
    /// any error.
    #[must_use]
    pub fn try_get<T: FromSql>(&self, row: usize, col: usize) -> Option<T> {
        let value = self.value(row, col).ok()?;
        T::from_sql_nullable(&value).ok().flatten()
    }

    /// The command tag, such as `INSERT 0 5` or `SELECT 3`.
    #[must_use]
    pub fn command_tag(&self) -> Option<&str> {
        self.result.command_tag()
    }

    /// Number of rows the command affected, taken from the command tag.
    ///
    /// Tags without a count (`CREATE TABLE`, `BEGIN`) give 0.
    #[must_use]
    pub fn affected_rows(&self) -> u64 {
        self.command_tag()
            .and_then(|tag| tag.rsplit(' ').next())
            .and_then(|count| count.parse().ok())
            .unwrap_or(0)
    }

    /// View of row `row`.
    pub fn row(&self, row: usize) -> Result<Row<'_>> {
        let count = self.row_count();
        if row >= count {
            return Err(Error::RowIndexOutOfRange { index: row, count });
        }
        Ok(Row {
            cursor: self,
            index: row,
        })
    }

    /// Iterate over the rows.
    pub fn rows(&self) -> impl ExactSizeIterator<Item = Row<'_>> + '_ {
        (0..self.row_count()).map(move |index| Row {
            cursor: self,
            index,
        })
    }

    fn column(&self, col: usize) -> Result<&Column> {
        let columns = self.result.columns();
        columns.get(col).ok_or(Error::ColumnIndexOutOfRange {
            index: col,
            count: columns.len(),
        })
    }

    fn index_of(&self, name: &str) -> Result<usize> {
        self.column_index(name)
            .ok_or_else(|| Error::ColumnNotFound(name.to_string()))
    }

    fn field(&self, row: usize, col: usize) -> Result<&Option<String>> {
        let rows = self.result.rows();
        let fields = rows.get(row).ok_or(Error::RowIndexOutOfRange {
            index: row,
            count: rows.len(),
        })?;
        fields.get(col).ok_or(Error::ColumnIndexOutOfRange {
            index: col,
            count: fields.len(),
        })
    }
}

/// A borrowed view of one row of a [`ResultCursor`].
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    cursor: &'a ResultCursor,
    index: usize,
}

impl<'a> Row<'a> {
    /// Position of this row in the result.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cursor.column_count()
    }

    /// Check if the row has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if field `col` is NULL.
    pub fn is_null(&self, col: usize) -> Result<bool> {
        self.cursor.is_null(self.index, col)
    }

    /// Raw wire text of field `col`.
    pub fn get_value(&self, col: usize) -> Result<Option<&'a str>> {
        self.cursor.get_value(self.index, col)
    }

    /// Decode field `col` as `T`.
    pub fn get<T: FromSql>(&self, col: usize) -> Result<T> {
        self.cursor.get(self.index, col)
    }

    /// Decode the named field as `T`.
    pub fn get_by_name<T: FromSql>(&self, name: &str) -> Result<T> {
        self.cursor.get_by_name(self.index, name)
    }

    /// Decode field `col`, returning `None` for NULL or on any error.
    #[must_use]
    pub fn try_get<T: FromSql>(&self, col: usize) -> Option<T> {
        self.cursor.try_get(self.index, col)
    }
}
