//! Async database access over one owned connection.
//!
//! Every executor follows the same sequence:
//! 1. resolve the model (materializing reads only)
//! 2. make sure the connection is open
//! 3. build the command (`:name` -> `$n`, parameters bound in marker order)
//! 4. run it raced against the caller's cancellation token
//! 5. on a transport failure or cancellation, mark the connection broken
//!
//! Rows stream through a cursor that lives only inside the executor call;
//! dropping it on any exit path releases the connection for the next call.

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use futures::TryStreamExt;
use indexmap::IndexMap;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow, Postgres};
use sqlx::{Column, Decode, Row, Type};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use crate::bulk::BulkData;
use crate::command::Command;
use crate::config::DatabaseConfig;
use crate::connection::{ConnectionManager, ConnectionState, PgConnector};
use crate::error::{is_transport_failure, DbError, Result};
use crate::params::Params;
use crate::registry::{Model, ModelRegistry, Record};
use crate::statement;
use crate::value::Value;

/// Separator between the parts of a composite key.
pub const KEY_SEPARATOR: &str = "_";

/// Generic PostgreSQL access: reads, mutations and bulk inserts.
///
/// One command runs at a time; executors take `&mut self`. Share a
/// `Database` across tasks by wrapping it in `tokio::sync::Mutex`.
pub struct Database {
    conn: ConnectionManager<PgConnector>,
    registry: Arc<ModelRegistry>,
}

impl Database {
    /// Create a closed handle. Nothing is opened until the first call.
    pub fn new(options: PgConnectOptions, registry: Arc<ModelRegistry>) -> Self {
        Self {
            conn: ConnectionManager::new(PgConnector::new(options)),
            registry,
        }
    }

    /// Create a handle from a `postgres://` URL.
    pub fn from_url(url: &str, registry: Arc<ModelRegistry>) -> Result<Self> {
        let options = PgConnectOptions::from_str(url)
            .map_err(|e| DbError::config(format!("invalid database url: {e}")))?;
        Ok(Self::new(options, registry))
    }

    pub fn from_config(config: &DatabaseConfig, registry: Arc<ModelRegistry>) -> Result<Self> {
        Ok(Self::new(config.connect_options()?, registry))
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    /// Physical connection opens so far.
    pub fn open_count(&self) -> u64 {
        self.conn.open_count()
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Open the connection if it is closed or broken. Executors call this
    /// themselves; it is public for callers that want to fail fast.
    pub async fn ensure_open(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.conn.ensure_open(cancel).await.map(|_| ())
    }

    /// Close the connection. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        self.conn.close().await
    }

    /// First column of the first row.
    ///
    /// `None` when the query returns no row, `Some(Value::Null)` when the
    /// value itself is NULL.
    pub async fn scalar(
        &mut self,
        sql: &str,
        params: &Params,
        cancel: &CancellationToken,
    ) -> Result<Option<Value>> {
        let conn = self.conn.ensure_open(cancel).await?;
        let command = Command::build(sql, params, None)?;
        log_command("scalar", &command);

        let result = race(cancel, async {
            let row = command.query().fetch_optional(&mut *conn).await?;
            row.map(|row| Value::from_column(&row, 0)).transpose()
        })
        .await;
        settle(&mut self.conn, result)
    }

    /// Typed [`Database::scalar`]; a NULL value reads as `None`.
    pub async fn scalar_as<T>(
        &mut self,
        sql: &str,
        params: &Params,
        cancel: &CancellationToken,
    ) -> Result<Option<T>>
    where
        T: for<'r> Decode<'r, Postgres> + Type<Postgres> + Send + Unpin,
    {
        let conn = self.conn.ensure_open(cancel).await?;
        let command = Command::build(sql, params, None)?;
        log_command("scalar_as", &command);

        let result = race(cancel, async {
            let row = command.query().fetch_optional(&mut *conn).await?;
            match row {
                Some(row) => Ok::<_, DbError>(row.try_get::<Option<T>, _>(0)?),
                None => Ok(None),
            }
        })
        .await;
        settle(&mut self.conn, result)
    }

    /// Materialize the first row as `model`; any further rows are read and
    /// discarded before returning.
    pub async fn object(
        &mut self,
        sql: &str,
        model: &str,
        params: &Params,
        cancel: &CancellationToken,
    ) -> Result<Option<Box<dyn Record>>> {
        let model = self.registry.resolve(model)?;
        let conn = self.conn.ensure_open(cancel).await?;
        let command = Command::build(sql, params, None)?;
        log_command("object", &command);

        let result = race(cancel, async {
            let mut rows = command.query().fetch(&mut *conn);
            let first = match rows.try_next().await? {
                Some(row) => Some(model.create(&row)?),
                None => None,
            };

            let mut discarded = 0u64;
            while rows.try_next().await?.is_some() {
                discarded += 1;
            }
            if discarded > 0 {
                trace!(discarded, "drained remaining rows");
            }
            Ok::<_, DbError>(first)
        })
        .await;
        settle(&mut self.conn, result)
    }

    /// [`Database::object`] for a registered [`Model`], downcast to `T`.
    pub async fn object_as<T: Model>(
        &mut self,
        sql: &str,
        params: &Params,
        cancel: &CancellationToken,
    ) -> Result<Option<T>> {
        self.object(sql, T::MODEL_NAME, params, cancel)
            .await?
            .map(downcast_model::<T>)
            .transpose()
    }

    /// Materialize every row as `model`, in result order.
    pub async fn object_list(
        &mut self,
        sql: &str,
        model: &str,
        params: &Params,
        cancel: &CancellationToken,
    ) -> Result<Vec<Box<dyn Record>>> {
        let model = self.registry.resolve(model)?;
        let conn = self.conn.ensure_open(cancel).await?;
        let command = Command::build(sql, params, None)?;
        log_command("object_list", &command);

        let result = race(cancel, async {
            let mut rows = command.query().fetch(&mut *conn);
            let mut records = Vec::new();
            while let Some(row) = rows.try_next().await? {
                records.push(model.create(&row)?);
            }
            Ok::<_, DbError>(records)
        })
        .await;
        settle(&mut self.conn, result)
    }

    /// [`Database::object_list`] for a registered [`Model`].
    pub async fn object_list_as<T: Model>(
        &mut self,
        sql: &str,
        params: &Params,
        cancel: &CancellationToken,
    ) -> Result<Vec<T>> {
        self.object_list(sql, T::MODEL_NAME, params, cancel)
            .await?
            .into_iter()
            .map(downcast_model::<T>)
            .collect()
    }

    /// First column of every row, rendered as text. NULL renders as "".
    pub async fn scalar_list(
        &mut self,
        sql: &str,
        params: &Params,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let conn = self.conn.ensure_open(cancel).await?;
        let command = Command::build(sql, params, None)?;
        log_command("scalar_list", &command);

        let result = race(cancel, async {
            let mut rows = command.query().fetch(&mut *conn);
            let mut values = Vec::new();
            while let Some(row) = rows.try_next().await? {
                values.push(Value::from_column(&row, 0)?.to_string());
            }
            Ok::<_, DbError>(values)
        })
        .await;
        settle(&mut self.conn, result)
    }

    /// Materialize every row, keyed by its `key_columns` values joined
    /// with `_`. A later row with the same key replaces the earlier one.
    pub async fn keyed_object_list(
        &mut self,
        sql: &str,
        key_columns: &[&str],
        model: &str,
        params: &Params,
        cancel: &CancellationToken,
    ) -> Result<IndexMap<String, Box<dyn Record>>> {
        if key_columns.is_empty() {
            return Err(DbError::invalid_argument("key_columns must not be empty"));
        }
        let model = self.registry.resolve(model)?;
        let conn = self.conn.ensure_open(cancel).await?;
        let command = Command::build(sql, params, None)?;
        log_command("keyed_object_list", &command);

        let result = race(cancel, async {
            let mut rows = command.query().fetch(&mut *conn);
            let mut records = IndexMap::new();
            while let Some(row) = rows.try_next().await? {
                let key = composite_key(&row, key_columns)?;
                records.insert(key, model.create(&row)?);
            }
            Ok::<_, DbError>(records)
        })
        .await;
        settle(&mut self.conn, result)
    }

    /// `INSERT INTO table (..) VALUES (..)` from `params`, in map order.
    #[instrument(skip_all, fields(table = %table))]
    pub async fn insert(
        &mut self,
        table: &str,
        params: &Params,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let conn = self.conn.ensure_open(cancel).await?;
        let sql = statement::insert_sql(table, params)?;
        let command = Command::build(&sql, params, None)?;
        let result = execute(conn, &command, cancel).await;
        settle(&mut self.conn, result)
    }

    /// `UPDATE table SET .. WHERE ..`. The two maps must not share names.
    #[instrument(skip_all, fields(table = %table))]
    pub async fn update(
        &mut self,
        table: &str,
        params: &Params,
        where_params: &Params,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let conn = self.conn.ensure_open(cancel).await?;
        let sql = statement::update_sql(table, params, where_params)?;
        let command = Command::build(&sql, params, Some(where_params))?;
        let result = execute(conn, &command, cancel).await;
        settle(&mut self.conn, result)
    }

    /// `DELETE FROM table WHERE ..`. An empty filter is rejected.
    #[instrument(skip_all, fields(table = %table))]
    pub async fn delete(
        &mut self,
        table: &str,
        where_params: &Params,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let conn = self.conn.ensure_open(cancel).await?;
        let sql = statement::delete_sql(table, where_params)?;
        let command = Command::build(&sql, where_params, None)?;
        let result = execute(conn, &command, cancel).await;
        settle(&mut self.conn, result)
    }

    /// Run caller-written SQL verbatim with bound parameters.
    pub async fn custom_bulk_update(
        &mut self,
        sql: &str,
        params: &Params,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let conn = self.conn.ensure_open(cancel).await?;
        let command = Command::build(sql, params, None)?;
        let result = execute(conn, &command, cancel).await;
        settle(&mut self.conn, result)
    }

    /// Not provided by this layer.
    pub async fn insert_ignoring_duplicates(
        &mut self,
        _table: &str,
        _params: &Params,
        _cancel: &CancellationToken,
    ) -> Result<u64> {
        Err(DbError::Unsupported {
            operation: "insert_ignoring_duplicates",
        })
    }

    /// Not provided by this layer.
    pub async fn process_transition(&mut self, _cancel: &CancellationToken) -> Result<u64> {
        Err(DbError::Unsupported {
            operation: "process_transition",
        })
    }

    /// Insert `row_count` rows in one statement, one array parameter per
    /// column.
    ///
    /// Every column must hold exactly `row_count` values; this is checked
    /// before anything is sent.
    #[instrument(skip_all, fields(table = %table, rows = row_count))]
    pub async fn bulk_insert(
        &mut self,
        table: &str,
        row_count: usize,
        data: BulkData,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let conn = self.conn.ensure_open(cancel).await?;
        data.validate(row_count)?;
        let sql = statement::bulk_insert_sql(table, &data)?;
        let command = Command::build_owned(&sql, data.into_params(), None)?;
        let result = execute(conn, &command, cancel).await;
        settle(&mut self.conn, result)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("state", &self.conn.state())
            .field("opens", &self.conn.open_count())
            .field("registry", &self.registry)
            .finish()
    }
}

fn log_command(operation: &'static str, command: &Command) {
    debug!(operation, sql = command.sql(), params = command.len(), "executing");
}

async fn execute(conn: &mut PgConnection, command: &Command, cancel: &CancellationToken) -> Result<u64> {
    log_command("execute", command);
    race(cancel, async {
        let done = command.query().execute(&mut *conn).await?;
        debug!(rows_affected = done.rows_affected(), "statement complete");
        Ok::<_, DbError>(done.rows_affected())
    })
    .await
}

/// Run `fut` unless `cancel` fires first. Dropping `fut` drops its cursor.
async fn race<T>(cancel: &CancellationToken, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DbError::Cancelled),
        res = fut => res,
    }
}

/// Mark the connection broken when `result` left it unusable.
fn settle<T>(conn: &mut ConnectionManager<PgConnector>, result: Result<T>) -> Result<T> {
    if let Err(err) = &result {
        if leaves_connection_broken(err) {
            debug!(error = %err, "marking connection broken");
            conn.mark_broken();
        }
    }
    result
}

/// Cancellation interrupts the protocol mid-exchange; transport errors
/// mean the socket is gone. Anything else leaves the connection usable.
fn leaves_connection_broken(err: &DbError) -> bool {
    match err {
        DbError::Cancelled => true,
        DbError::Driver(source) => is_transport_failure(source),
        _ => false,
    }
}

fn downcast_model<T: Model>(record: Box<dyn Record>) -> Result<T> {
    record.downcast::<T>().map(|boxed| *boxed).map_err(|_| {
        DbError::invalid_argument(format!(
            "model '{}' is registered with a different record type",
            T::MODEL_NAME
        ))
    })
}

fn composite_key(row: &PgRow, key_columns: &[&str]) -> Result<String> {
    let mut values = Vec::with_capacity(key_columns.len());
    for column in key_columns {
        let index = row.try_column(*column)?.ordinal();
        values.push(Value::from_column(row, index)?);
    }
    join_key(key_columns, &values)
}

/// Join key values with [`KEY_SEPARATOR`]. NULL parts are rejected.
pub(crate) fn join_key(columns: &[&str], values: &[Value]) -> Result<String> {
    let mut key = String::new();
    for (i, (column, value)) in columns.iter().zip(values).enumerate() {
        if value.is_null() {
            return Err(DbError::NullKeyColumn {
                column: column.to_string(),
            });
        }
        if i > 0 {
            key.push_str(KEY_SEPARATOR);
        }
        key.push_str(&value.to_string());
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn registry() -> Arc<ModelRegistry> {
        Arc::new(ModelRegistry::new())
    }

    #[test]
    fn composite_key_joins_with_underscore() {
        let key = join_key(&["A", "B"], &[Value::from("x"), Value::from("y")]).unwrap();
        assert_eq!(key, "x_y");

        let key = join_key(&["GCC4", "NAME_ID", "ROLE"], &[Value::from("SCS"), Value::from(68), Value::from("P")])
            .unwrap();
        assert_eq!(key, "SCS_68_P");
    }

    #[test]
    fn single_column_key_has_no_separator() {
        assert_eq!(join_key(&["PID"], &[Value::from(267763)]).unwrap(), "267763");
    }

    #[test]
    fn null_key_part_is_rejected() {
        let err = join_key(&["A", "B"], &[Value::from("x"), Value::Null]).unwrap_err();
        assert!(matches!(err, DbError::NullKeyColumn { column } if column == "B"));
    }

    #[test]
    fn broken_connection_classification() {
        assert!(leaves_connection_broken(&DbError::Cancelled));
        assert!(leaves_connection_broken(&DbError::Driver(sqlx::Error::Io(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "reset"
        )))));
        assert!(!leaves_connection_broken(&DbError::Driver(sqlx::Error::RowNotFound)));
        assert!(!leaves_connection_broken(&DbError::UnknownModel { model: "x".into() }));
        assert!(!leaves_connection_broken(&DbError::MissingParameter { name: "a".into() }));
    }

    #[tokio::test]
    async fn race_prefers_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res = race(&cancel, async { Ok::<_, DbError>(1) }).await;
        assert!(matches!(res, Err(DbError::Cancelled)));

        let res = race(&CancellationToken::new(), async { Ok::<_, DbError>(1) }).await;
        assert_eq!(res.unwrap(), 1);
    }

    #[test]
    fn invalid_url_is_config_error() {
        let err = Database::from_url("not a url", registry()).unwrap_err();
        assert!(matches!(err, DbError::Config { .. }));
    }

    #[test]
    fn new_database_starts_closed() {
        let db = Database::from_url("postgres://user:pw@localhost:5432/app", registry()).unwrap();
        assert_eq!(db.state(), ConnectionState::Closed);
        assert_eq!(db.open_count(), 0);
    }

    #[tokio::test]
    async fn unsupported_operations_fail_without_connecting() {
        let mut db = Database::from_url("postgres://user:pw@localhost:5432/app", registry()).unwrap();
        let cancel = CancellationToken::new();

        let err = db
            .insert_ignoring_duplicates("PLANNER", &Params::new().with("A", 1), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Unsupported { operation: "insert_ignoring_duplicates" }));

        let err = db.process_transition(&cancel).await.unwrap_err();
        assert!(matches!(err, DbError::Unsupported { operation: "process_transition" }));
        assert_eq!(db.open_count(), 0);
    }

    #[tokio::test]
    async fn empty_key_columns_fail_without_connecting() {
        let mut db = Database::from_url("postgres://user:pw@localhost:5432/app", registry()).unwrap();
        let err = db
            .keyed_object_list("SELECT 1", &[], "planner", &Params::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn unknown_model_fails_before_connecting() {
        let mut db = Database::from_url("postgres://user:pw@localhost:5432/app", registry()).unwrap();
        let err = db
            .object("SELECT 1", "missing", &Params::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::UnknownModel { .. }));
        assert_eq!(db.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn unreachable_server_surfaces_connection_error() {
        // nothing listens on port 1
        let mut db = Database::from_url("postgres://u@127.0.0.1:1/x", registry()).unwrap();
        let cancel = CancellationToken::new();

        let err = db.scalar("SELECT 1", &Params::new(), &cancel).await.unwrap_err();
        assert!(matches!(err, DbError::Connection { .. }));
        assert_eq!(db.state(), ConnectionState::Closed);

        let err = db
            .insert("PLANNER", &Params::new().with("PID", 1), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Connection { .. }));
        assert_eq!(db.state(), ConnectionState::Closed);
        assert_eq!(db.open_count(), 0);
    }
}
