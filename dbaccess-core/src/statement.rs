//! SQL text for table-level mutations.
//!
//! Column names come from parameter keys and are emitted in map order.
//! Values never appear in the text; each column gets a `:name` marker.

use crate::bulk::BulkData;
use crate::error::{DbError, Result};
use crate::params::{is_valid_name, Params};

/// `INSERT INTO t (A,B) VALUES (:A,:B)`
pub fn insert_sql(table: &str, params: &Params) -> Result<String> {
    check_table(table)?;
    let columns = column_names(params, "insert")?;

    Ok(format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        columns.join(","),
        columns
            .iter()
            .map(|c| format!(":{}", c))
            .collect::<Vec<_>>()
            .join(",")
    ))
}

/// `UPDATE t SET A = :A, B = :B WHERE K = :K AND L = :L`
pub fn update_sql(table: &str, params: &Params, where_params: &Params) -> Result<String> {
    check_table(table)?;
    let set = column_names(params, "update")?;
    let filter = column_names(where_params, "update filter")?;

    Ok(format!(
        "UPDATE {} SET {} WHERE {}",
        table,
        assignments(&set, ", "),
        assignments(&filter, " AND ")
    ))
}

/// `DELETE FROM t WHERE K = :K AND L = :L`
pub fn delete_sql(table: &str, where_params: &Params) -> Result<String> {
    check_table(table)?;
    let filter = column_names(where_params, "delete filter")?;

    Ok(format!(
        "DELETE FROM {} WHERE {}",
        table,
        assignments(&filter, " AND ")
    ))
}

/// `INSERT INTO t (A,B) SELECT * FROM UNNEST(:A::int4[], :B::varchar[])`
///
/// Each column is one array parameter; the server expands them row-wise.
pub fn bulk_insert_sql(table: &str, data: &BulkData) -> Result<String> {
    check_table(table)?;
    if data.is_empty() {
        return Err(DbError::EmptyParameters {
            operation: "bulk insert",
        });
    }

    let mut columns = Vec::with_capacity(data.len());
    let mut arrays = Vec::with_capacity(data.len());
    for (column, values) in data.iter() {
        check_column(column)?;
        columns.push(column);
        arrays.push(format!(":{}::{}", column, values.sql_type().array_cast()));
    }

    Ok(format!(
        "INSERT INTO {} ({}) SELECT * FROM UNNEST({})",
        table,
        columns.join(","),
        arrays.join(", ")
    ))
}

/// Table names: identifiers, optionally schema-qualified (`schema.table`).
pub fn check_table(table: &str) -> Result<()> {
    let valid = !table.is_empty()
        && table.split('.').count() <= 2
        && table.split('.').all(is_valid_name);
    if valid {
        Ok(())
    } else {
        Err(DbError::InvalidIdentifier {
            name: table.to_string(),
        })
    }
}

fn check_column(column: &str) -> Result<()> {
    if is_valid_name(column) {
        Ok(())
    } else {
        Err(DbError::InvalidIdentifier {
            name: column.to_string(),
        })
    }
}

fn column_names<'a>(params: &'a Params, operation: &'static str) -> Result<Vec<&'a str>> {
    if params.is_empty() {
        return Err(DbError::EmptyParameters { operation });
    }
    params
        .keys()
        .map(|column| check_column(column).map(|_| column))
        .collect()
}

fn assignments(columns: &[&str], separator: &str) -> String {
    columns
        .iter()
        .map(|c| format!("{} = :{}", c, c))
        .collect::<Vec<_>>()
        .join(separator)
}
