//! Dynamically typed parameter and column values.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use sqlx::encode::{Encode, IsNull};
use sqlx::error::BoxDynError;
use sqlx::postgres::types::{Oid, PgInterval};
use sqlx::postgres::{PgArgumentBuffer, PgArguments, PgRow, PgTypeInfo, Postgres};
use sqlx::query::Query;
use sqlx::{Column, Row, Type, TypeInfo, ValueRef};

use crate::bulk::ColumnValues;
use crate::error::{DbError, Result};

/// A single SQL value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    /// A whole column of values, bound as one array parameter
    Array(ColumnValues),
}

impl Value {
    /// Short kind name used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Decimal(_) => "decimal",
            Value::Text(_) => "text",
            Value::Date(_) => "date",
            Value::Timestamp(_) => "timestamp",
            Value::TimestampTz(_) => "timestamptz",
            Value::Array(_) => "array",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Bind this value as the next positional parameter.
    pub(crate) fn bind_to<'q>(
        &'q self,
        query: Query<'q, Postgres, PgArguments>,
    ) -> Query<'q, Postgres, PgArguments> {
        match self {
            Value::Null => query.bind(UntypedNull),
            Value::Bool(b) => query.bind(*b),
            Value::Int(i) => query.bind(*i),
            Value::Float(f) => query.bind(*f),
            Value::Decimal(d) => query.bind(*d),
            Value::Text(s) => query.bind(s.as_str()),
            Value::Date(d) => query.bind(*d),
            Value::Timestamp(ts) => query.bind(*ts),
            Value::TimestampTz(ts) => query.bind(*ts),
            Value::Array(column) => column.bind_to(query),
        }
    }

    /// Decode column `index` of `row` by inspecting its PostgreSQL type.
    pub fn from_column(row: &PgRow, index: usize) -> Result<Self> {
        if row.try_get_raw(index)?.is_null() {
            return Ok(Value::Null);
        }

        let column = row.try_column(index)?;
        let type_name = column.type_info().name();

        let value = match type_name {
            "BOOL" => Value::Bool(row.try_get(index)?),
            "INT2" => Value::Int(row.try_get::<i16, _>(index)?.into()),
            "INT4" => Value::Int(row.try_get::<i32, _>(index)?.into()),
            "INT8" => Value::Int(row.try_get(index)?),
            "FLOAT4" => Value::Float(row.try_get::<f32, _>(index)?.into()),
            "FLOAT8" => Value::Float(row.try_get(index)?),
            "NUMERIC" => Value::Decimal(row.try_get(index)?),
            // "CHAR" is bpchar; the one-byte internal type is "\"CHAR\""
            "TEXT" | "VARCHAR" | "CHAR" | "NAME" => Value::Text(row.try_get(index)?),
            "\"CHAR\"" => Value::Text(char::from(row.try_get::<i8, _>(index)? as u8).to_string()),
            "UUID" => Value::Text(row.try_get::<uuid::Uuid, _>(index)?.to_string()),
            "JSON" | "JSONB" => Value::Text(row.try_get::<serde_json::Value, _>(index)?.to_string()),
            "BYTEA" => Value::Text(hex_escape(&row.try_get::<Vec<u8>, _>(index)?)),
            "TIME" => Value::Text(row.try_get::<NaiveTime, _>(index)?.to_string()),
            "INTERVAL" => Value::Text(format_interval(&row.try_get(index)?)),
            "DATE" => Value::Date(row.try_get(index)?),
            "TIMESTAMP" => Value::Timestamp(row.try_get(index)?),
            "TIMESTAMPTZ" => Value::TimestampTz(row.try_get(index)?),
            "BOOL[]" => Value::Array(ColumnValues::Boolean(row.try_get(index)?)),
            "INT2[]" => Value::Array(ColumnValues::Int16(row.try_get(index)?)),
            "INT4[]" => Value::Array(ColumnValues::Int32(row.try_get(index)?)),
            "INT8[]" => Value::Array(ColumnValues::Int64(row.try_get(index)?)),
            "NUMERIC[]" => Value::Array(ColumnValues::Decimal(row.try_get(index)?)),
            "TEXT[]" | "VARCHAR[]" => Value::Array(ColumnValues::Varchar(row.try_get(index)?)),
            "CHAR[]" => Value::Array(ColumnValues::Char(row.try_get(index)?)),
            "DATE[]" => Value::Array(ColumnValues::Date(row.try_get(index)?)),
            "TIMESTAMP[]" => Value::Array(ColumnValues::Timestamp(row.try_get(index)?)),
            "TIMESTAMPTZ[]" => {
                let values: Vec<Option<DateTime<Utc>>> = row.try_get(index)?;
                Value::Array(ColumnValues::TimestampTz(
                    values
                        .into_iter()
                        .map(|v| v.map(|ts| ts.fixed_offset()))
                        .collect(),
                ))
            }
            other => {
                return Err(DbError::UnsupportedColumnType {
                    column: column.name().to_string(),
                    type_name: other.to_string(),
                })
            }
        };
        Ok(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Decimal(d) => write!(f, "{}", d),
            Value::Text(s) => f.write_str(s),
            Value::Date(d) => write!(f, "{}", d),
            Value::Timestamp(ts) => write!(f, "{}", ts),
            Value::TimestampTz(ts) => write!(f, "{}", ts.to_rfc3339()),
            Value::Array(column) => write!(f, "{}", column),
        }
    }
}

/// `bytea` in the server's hex output form: `\x0102`.
fn hex_escape(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// `interval` in the server's default `postgres` output style,
/// e.g. `1 year 2 mons 3 days 04:05:06.5`.
fn format_interval(interval: &PgInterval) -> String {
    let mut parts = Vec::new();
    let (years, months) = (interval.months / 12, interval.months % 12);
    for (n, unit) in [(years, "year"), (months, "mon"), (interval.days, "day")] {
        if n != 0 {
            let plural = if n == 1 { "" } else { "s" };
            parts.push(format!("{n} {unit}{plural}"));
        }
    }

    let micros = interval.microseconds;
    if micros != 0 || parts.is_empty() {
        // a positive time after a negative field carries an explicit '+'
        let earlier_negative = interval.months < 0 || interval.days < 0;
        let sign = match micros {
            m if m < 0 => "-",
            m if m > 0 && earlier_negative => "+",
            _ => "",
        };
        let total = micros.unsigned_abs();
        let secs = total / 1_000_000;
        let mut time = format!(
            "{sign}{:02}:{:02}:{:02}",
            secs / 3600,
            secs / 60 % 60,
            secs % 60
        );
        let frac = total % 1_000_000;
        if frac != 0 {
            let digits = format!("{frac:06}");
            time.push('.');
            time.push_str(digits.trim_end_matches('0'));
        }
        parts.push(time);
    }
    parts.join(" ")
}

/// SQL NULL whose type the server infers from context.
///
/// Declared with OID 0 ("unspecified") so a NULL can target a column of
/// any type.
struct UntypedNull;

impl Type<Postgres> for UntypedNull {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }
}

impl Encode<'_, Postgres> for UntypedNull {
    fn encode_by_ref(&self, _buf: &mut PgArgumentBuffer) -> std::result::Result<IsNull, BoxDynError> {
        Ok(IsNull::Yes)
    }
}

macro_rules! impl_value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v.into())
                }
            }
        )*
    };
}

impl_value_from! {
    bool => Bool,
    i16 => Int,
    i32 => Int,
    i64 => Int,
    u32 => Int,
    f32 => Float,
    f64 => Float,
    Decimal => Decimal,
    String => Text,
    &str => Text,
    NaiveDate => Date,
    NaiveDateTime => Timestamp,
    DateTime<Utc> => TimestampTz,
    ColumnValues => Array,
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}
