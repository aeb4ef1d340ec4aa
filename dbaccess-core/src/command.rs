//! Command builder: SQL text plus bound parameters, ready to execute.
//!
//! Callers write `:name` markers. PostgreSQL wants `$1..$n`, so the text is
//! rewritten and the parameters are laid out in marker order.

use indexmap::IndexMap;
use sqlx::postgres::{PgArguments, Postgres};
use sqlx::query::Query;

use crate::error::{DbError, Result};
use crate::params::{is_valid_name, Params};
use crate::value::Value;

/// A statement with its positional bindings.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    sql: String,
    bindings: Vec<(String, Value)>,
}

impl Command {
    /// Build a command from `:name` SQL and one or two parameter maps.
    ///
    /// Names must be disjoint across the two maps, every marker must have a
    /// parameter, and every parameter must be referenced.
    pub fn build(sql: &str, params: &Params, where_params: Option<&Params>) -> Result<Self> {
        Self::build_owned(sql, params.clone(), where_params.cloned())
    }

    /// Same as [`Command::build`], taking ownership of the values.
    pub fn build_owned(sql: &str, params: Params, where_params: Option<Params>) -> Result<Self> {
        let mut merged: IndexMap<String, Value> = IndexMap::with_capacity(
            params.len() + where_params.as_ref().map_or(0, Params::len),
        );

        for (name, value) in params {
            check_name(&name)?;
            merged.insert(name, value);
        }
        for (name, value) in where_params.into_iter().flatten() {
            check_name(&name)?;
            if merged.contains_key(&name) {
                return Err(DbError::ParameterCollision { name });
            }
            merged.insert(name, value);
        }

        let rewritten = rewrite_named(sql);
        let mut bindings = Vec::with_capacity(rewritten.names.len());
        for name in rewritten.names {
            match merged.shift_remove(&name) {
                Some(value) => bindings.push((name, value)),
                None => return Err(DbError::MissingParameter { name }),
            }
        }

        if let Some((name, _)) = merged.into_iter().next() {
            return Err(DbError::UnusedParameter { name });
        }

        Ok(Self {
            sql: rewritten.sql,
            bindings,
        })
    }

    /// Rewritten SQL text with `$n` markers.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Bindings in positional order: `bindings()[0]` is `$1`.
    pub fn bindings(&self) -> &[(String, Value)] {
        &self.bindings
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// A sqlx query with every value bound.
    ///
    /// Never served from the statement cache: parameter types are fixed at
    /// prepare time, and the same text may be bound with other value kinds
    /// on the next call.
    pub fn query(&self) -> Query<'_, Postgres, PgArguments> {
        let query = sqlx::query::<Postgres>(&self.sql).persistent(false);
        self.bindings
            .iter()
            .fold(query, |query, (_, value)| value.bind_to(query))
    }
}

fn check_name(name: &str) -> Result<()> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(DbError::InvalidParameterName {
            name: name.to_string(),
        })
    }
}

/// Result of rewriting `:name` markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewritten {
    /// SQL with `$n` markers
    pub sql: String,
    /// Distinct marker names; `names[0]` is `$1`
    pub names: Vec<String>,
}

/// Rewrite `:name` markers to `$n`.
///
/// Each distinct name gets one index in order of first appearance.
/// Quoted strings, quoted identifiers, dollar-quoted bodies, comments and
/// `::type` casts pass through untouched.
pub fn rewrite_named(sql: &str) -> Rewritten {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len() + 8);
    let mut names: Vec<String> = Vec::new();
    let mut copied = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' => i = skip_quoted(bytes, i),
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                i = bytes[i..]
                    .iter()
                    .position(|&b| b == b'\n')
                    .map_or(bytes.len(), |p| i + p + 1);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_block_comment(bytes, i),
            b'$' => i = skip_dollar_quoted(bytes, i),
            b':' if bytes.get(i + 1) == Some(&b':') => i += 2,
            b':' if bytes.get(i + 1).is_some_and(|&b| is_name_start(b)) => {
                let start = i + 1;
                let end = bytes[start..]
                    .iter()
                    .position(|&b| !is_name_char(b))
                    .map_or(bytes.len(), |p| start + p);
                let name = &sql[start..end];

                let index = match names.iter().position(|n| n == name) {
                    Some(pos) => pos + 1,
                    None => {
                        names.push(name.to_string());
                        names.len()
                    }
                };

                out.push_str(&sql[copied..i]);
                out.push('$');
                out.push_str(&index.to_string());
                copied = end;
                i = end;
            }
            _ => i += 1,
        }
    }

    out.push_str(&sql[copied..]);
    Rewritten { sql: out, names }
}

fn is_name_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_name_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Skip a '...' or "..." run; doubled quotes stay inside.
fn skip_quoted(bytes: &[u8], start: usize) -> usize {
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

/// Skip a /* ... */ comment. PostgreSQL nests them.
fn skip_block_comment(bytes: &[u8], start: usize) -> usize {
    let mut depth = 0usize;
    let mut i = start;
    while i + 1 < bytes.len() {
        match (bytes[i], bytes[i + 1]) {
            (b'/', b'*') => {
                depth += 1;
                i += 2;
            }
            (b'*', b'/') => {
                depth -= 1;
                i += 2;
                if depth == 0 {
                    return i;
                }
            }
            _ => i += 1,
        }
    }
    bytes.len()
}

/// Skip a $tag$ ... $tag$ body. A `$` that does not open one (e.g. `$1`)
/// is passed over on its own.
fn skip_dollar_quoted(bytes: &[u8], start: usize) -> usize {
    let tag_end = bytes[start + 1..]
        .iter()
        .position(|&b| !is_name_char(b))
        .map(|p| start + 1 + p);

    let Some(tag_end) = tag_end else {
        return bytes.len();
    };
    if bytes[tag_end] != b'$' || bytes.get(start + 1).is_some_and(|b| b.is_ascii_digit()) {
        return start + 1;
    }

    let tag = &bytes[start..=tag_end];
    let body = tag_end + 1;
    bytes[body..]
        .windows(tag.len())
        .position(|w| w == tag)
        .map_or(bytes.len(), |p| body + p + tag.len())
}
