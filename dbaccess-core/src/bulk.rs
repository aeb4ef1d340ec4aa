//! Column-oriented data for bulk array inserts.
//!
//! Each column carries its own element type. The bind type is part of the
//! variant, so choosing the PostgreSQL array type is an exhaustive match.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Local, NaiveDate, NaiveDateTime};
use indexmap::IndexMap;
use rust_decimal::Decimal;
use sqlx::postgres::{PgArguments, Postgres};
use sqlx::query::Query;

use crate::error::{DbError, Result};
use crate::params::Params;
use crate::value::Value;

/// Scalar type of a bulk column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlType {
    Char,
    Date,
    Decimal,
    Int16,
    Int32,
    Int64,
    /// Timestamp without time zone
    Timestamp,
    /// Timestamp rendered in the session's local zone
    TimestampLtz,
    /// Timestamp with an explicit offset
    TimestampTz,
    Varchar,
    Boolean,
}

impl SqlType {
    pub const ALL: [SqlType; 11] = [
        SqlType::Char,
        SqlType::Date,
        SqlType::Decimal,
        SqlType::Int16,
        SqlType::Int32,
        SqlType::Int64,
        SqlType::Timestamp,
        SqlType::TimestampLtz,
        SqlType::TimestampTz,
        SqlType::Varchar,
        SqlType::Boolean,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SqlType::Char => "char",
            SqlType::Date => "date",
            SqlType::Decimal => "decimal",
            SqlType::Int16 => "int16",
            SqlType::Int32 => "int32",
            SqlType::Int64 => "int64",
            SqlType::Timestamp => "timestamp",
            SqlType::TimestampLtz => "timestamp_ltz",
            SqlType::TimestampTz => "timestamp_tz",
            SqlType::Varchar => "varchar",
            SqlType::Boolean => "boolean",
        }
    }

    /// PostgreSQL array type the column parameter is cast to.
    pub fn array_cast(self) -> &'static str {
        match self {
            SqlType::Char => "bpchar[]",
            SqlType::Date => "date[]",
            SqlType::Decimal => "numeric[]",
            SqlType::Int16 => "int2[]",
            SqlType::Int32 => "int4[]",
            SqlType::Int64 => "int8[]",
            SqlType::Timestamp => "timestamp[]",
            SqlType::TimestampLtz | SqlType::TimestampTz => "timestamptz[]",
            SqlType::Varchar => "varchar[]",
            SqlType::Boolean => "bool[]",
        }
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SqlType {
    type Err = DbError;

    /// Parse a type tag. Tags outside the supported set are an error,
    /// never a silently skipped column.
    fn from_str(s: &str) -> Result<Self> {
        let tag = s.trim().to_ascii_lowercase();
        let ty = match tag.as_str() {
            "char" | "bpchar" => SqlType::Char,
            "date" => SqlType::Date,
            "decimal" | "numeric" => SqlType::Decimal,
            "int16" | "smallint" | "int2" => SqlType::Int16,
            "int32" | "integer" | "int4" => SqlType::Int32,
            "int64" | "bigint" | "int8" => SqlType::Int64,
            "timestamp" => SqlType::Timestamp,
            "timestamp_ltz" | "timestampltz" => SqlType::TimestampLtz,
            "timestamp_tz" | "timestamptz" => SqlType::TimestampTz,
            "varchar" | "varchar2" | "text" => SqlType::Varchar,
            "boolean" | "bool" => SqlType::Boolean,
            _ => {
                return Err(DbError::invalid_argument(format!(
                    "unsupported bulk type tag '{}'",
                    s
                )))
            }
        };
        Ok(ty)
    }
}

/// One bulk column: all of its per-row values, typed.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValues {
    Char(Vec<Option<String>>),
    Date(Vec<Option<NaiveDate>>),
    Decimal(Vec<Option<Decimal>>),
    Int16(Vec<Option<i16>>),
    Int32(Vec<Option<i32>>),
    Int64(Vec<Option<i64>>),
    Timestamp(Vec<Option<NaiveDateTime>>),
    TimestampLtz(Vec<Option<DateTime<Local>>>),
    TimestampTz(Vec<Option<DateTime<FixedOffset>>>),
    Varchar(Vec<Option<String>>),
    Boolean(Vec<Option<bool>>),
}

impl ColumnValues {
    pub fn sql_type(&self) -> SqlType {
        match self {
            ColumnValues::Char(_) => SqlType::Char,
            ColumnValues::Date(_) => SqlType::Date,
            ColumnValues::Decimal(_) => SqlType::Decimal,
            ColumnValues::Int16(_) => SqlType::Int16,
            ColumnValues::Int32(_) => SqlType::Int32,
            ColumnValues::Int64(_) => SqlType::Int64,
            ColumnValues::Timestamp(_) => SqlType::Timestamp,
            ColumnValues::TimestampLtz(_) => SqlType::TimestampLtz,
            ColumnValues::TimestampTz(_) => SqlType::TimestampTz,
            ColumnValues::Varchar(_) => SqlType::Varchar,
            ColumnValues::Boolean(_) => SqlType::Boolean,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnValues::Char(v) | ColumnValues::Varchar(v) => v.len(),
            ColumnValues::Date(v) => v.len(),
            ColumnValues::Decimal(v) => v.len(),
            ColumnValues::Int16(v) => v.len(),
            ColumnValues::Int32(v) => v.len(),
            ColumnValues::Int64(v) => v.len(),
            ColumnValues::Timestamp(v) => v.len(),
            ColumnValues::TimestampLtz(v) => v.len(),
            ColumnValues::TimestampTz(v) => v.len(),
            ColumnValues::Boolean(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build a typed column from dynamic values.
    ///
    /// `Value::Null` becomes a NULL element. Integers are range-checked when
    /// narrowed; a value of the wrong kind fails the whole column.
    pub fn from_values(column: &str, ty: SqlType, values: Vec<Value>) -> Result<Self> {
        let mismatch = |found: &'static str| DbError::BulkTypeMismatch {
            column: column.to_string(),
            expected: ty.name(),
            found,
        };

        macro_rules! convert {
            ($variant:ident, |$v:ident| $body:expr) => {
                values
                    .into_iter()
                    .map(|$v| match $v {
                        Value::Null => Ok(None),
                        $v => $body.map(Some),
                    })
                    .collect::<Result<Vec<_>>>()
                    .map(ColumnValues::$variant)
            };
        }

        match ty {
            SqlType::Char => convert!(Char, |v| match v {
                Value::Text(s) => Ok(s),
                other => Err(mismatch(other.kind())),
            }),
            SqlType::Varchar => convert!(Varchar, |v| match v {
                Value::Text(s) => Ok(s),
                other => Err(mismatch(other.kind())),
            }),
            SqlType::Date => convert!(Date, |v| match v {
                Value::Date(d) => Ok(d),
                other => Err(mismatch(other.kind())),
            }),
            SqlType::Decimal => convert!(Decimal, |v| match v {
                Value::Decimal(d) => Ok(d),
                Value::Int(i) => Ok(Decimal::from(i)),
                Value::Float(f) => Decimal::try_from(f).map_err(|_| mismatch("non-finite float")),
                other => Err(mismatch(other.kind())),
            }),
            SqlType::Int16 => convert!(Int16, |v| match v {
                Value::Int(i) => i16::try_from(i).map_err(|_| mismatch("out-of-range integer")),
                other => Err(mismatch(other.kind())),
            }),
            SqlType::Int32 => convert!(Int32, |v| match v {
                Value::Int(i) => i32::try_from(i).map_err(|_| mismatch("out-of-range integer")),
                other => Err(mismatch(other.kind())),
            }),
            SqlType::Int64 => convert!(Int64, |v| match v {
                Value::Int(i) => Ok(i),
                other => Err(mismatch(other.kind())),
            }),
            SqlType::Timestamp => convert!(Timestamp, |v| match v {
                Value::Timestamp(ts) => Ok(ts),
                other => Err(mismatch(other.kind())),
            }),
            SqlType::TimestampLtz => convert!(TimestampLtz, |v| match v {
                Value::TimestampTz(ts) => Ok(ts.with_timezone(&Local)),
                other => Err(mismatch(other.kind())),
            }),
            SqlType::TimestampTz => convert!(TimestampTz, |v| match v {
                Value::TimestampTz(ts) => Ok(ts.fixed_offset()),
                other => Err(mismatch(other.kind())),
            }),
            SqlType::Boolean => convert!(Boolean, |v| match v {
                Value::Bool(b) => Ok(b),
                other => Err(mismatch(other.kind())),
            }),
        }
    }

    /// Bind the whole column as one array parameter.
    pub(crate) fn bind_to<'q>(
        &'q self,
        query: Query<'q, Postgres, PgArguments>,
    ) -> Query<'q, Postgres, PgArguments> {
        match self {
            ColumnValues::Char(v) | ColumnValues::Varchar(v) => query.bind(v.as_slice()),
            ColumnValues::Date(v) => query.bind(v.as_slice()),
            ColumnValues::Decimal(v) => query.bind(v.as_slice()),
            ColumnValues::Int16(v) => query.bind(v.as_slice()),
            ColumnValues::Int32(v) => query.bind(v.as_slice()),
            ColumnValues::Int64(v) => query.bind(v.as_slice()),
            ColumnValues::Timestamp(v) => query.bind(v.as_slice()),
            ColumnValues::TimestampLtz(v) => query.bind(v.as_slice()),
            ColumnValues::TimestampTz(v) => query.bind(v.as_slice()),
            ColumnValues::Boolean(v) => query.bind(v.as_slice()),
        }
    }
}

fn write_array<T: fmt::Display>(f: &mut fmt::Formatter<'_>, values: &[Option<T>]) -> fmt::Result {
    f.write_str("{")?;
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            f.write_str(",")?;
        }
        match value {
            Some(v) => write!(f, "{}", v)?,
            None => f.write_str("NULL")?,
        }
    }
    f.write_str("}")
}

impl fmt::Display for ColumnValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnValues::Char(v) | ColumnValues::Varchar(v) => write_array(f, v),
            ColumnValues::Date(v) => write_array(f, v),
            ColumnValues::Decimal(v) => write_array(f, v),
            ColumnValues::Int16(v) => write_array(f, v),
            ColumnValues::Int32(v) => write_array(f, v),
            ColumnValues::Int64(v) => write_array(f, v),
            ColumnValues::Timestamp(v) => write_array(f, v),
            ColumnValues::TimestampLtz(v) => write_array(f, v),
            ColumnValues::TimestampTz(v) => write_array(f, v),
            ColumnValues::Boolean(v) => write_array(f, v),
        }
    }
}

macro_rules! impl_column_from {
    ($($variant:ident: $ty:ty),* $(,)?) => {
        $(
            impl From<Vec<Option<$ty>>> for ColumnValues {
                fn from(values: Vec<Option<$ty>>) -> Self {
                    ColumnValues::$variant(values)
                }
            }

            impl From<Vec<$ty>> for ColumnValues {
                fn from(values: Vec<$ty>) -> Self {
                    ColumnValues::$variant(values.into_iter().map(Some).collect())
                }
            }
        )*
    };
}

// Strings default to varchar; build `ColumnValues::Char` explicitly for CHAR columns.
impl_column_from! {
    Varchar: String,
    Date: NaiveDate,
    Decimal: Decimal,
    Int16: i16,
    Int32: i32,
    Int64: i64,
    Timestamp: NaiveDateTime,
    TimestampLtz: DateTime<Local>,
    TimestampTz: DateTime<FixedOffset>,
    Boolean: bool,
}

/// Column name to column values, in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkData {
    columns: IndexMap<String, ColumnValues>,
}

impl BulkData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style column insert.
    pub fn with(mut self, column: impl Into<String>, values: impl Into<ColumnValues>) -> Self {
        self.insert(column, values);
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, values: impl Into<ColumnValues>) {
        self.columns.insert(column.into(), values.into());
    }

    /// Insert a column from a type tag plus dynamic values.
    pub fn insert_values(&mut self, column: impl Into<String>, ty: SqlType, values: Vec<Value>) -> Result<()> {
        let column = column.into();
        let data = ColumnValues::from_values(&column, ty, values)?;
        self.columns.insert(column, data);
        Ok(())
    }

    pub fn get(&self, column: &str) -> Option<&ColumnValues> {
        self.columns.get(column)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ColumnValues)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Every column must hold exactly `row_count` values.
    pub fn validate(&self, row_count: usize) -> Result<()> {
        if self.columns.is_empty() {
            return Err(DbError::EmptyParameters {
                operation: "bulk insert",
            });
        }
        for (column, values) in &self.columns {
            if values.len() != row_count {
                return Err(DbError::BulkLengthMismatch {
                    column: column.clone(),
                    expected: row_count,
                    actual: values.len(),
                });
            }
        }
        Ok(())
    }

    /// Move every column into a parameter of the same name.
    pub(crate) fn into_params(self) -> Params {
        self.columns
            .into_iter()
            .map(|(column, values)| (column, Value::Array(values)))
            .collect()
    }
}
