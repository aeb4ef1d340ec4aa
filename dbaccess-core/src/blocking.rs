//! Synchronous facade over [`crate::Database`].
//!
//! Owns a current-thread tokio runtime and blocks on the async executors,
//! so both paths share one implementation. Calls are never cancelled.
//! Calling into this type from inside an async runtime is an error.

use std::future::Future;
use std::sync::Arc;

use indexmap::IndexMap;
use sqlx::postgres::{PgConnectOptions, Postgres};
use sqlx::{Decode, Type};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bulk::BulkData;
use crate::config::DatabaseConfig;
use crate::connection::ConnectionState;
use crate::database;
use crate::error::{DbError, Result};
use crate::params::Params;
use crate::registry::{Model, ModelRegistry, Record};
use crate::value::Value;

/// Blocking database handle. Closes its connection on drop.
pub struct Database {
    /// Taken on drop
    runtime: Option<Runtime>,
    inner: database::Database,
    cancel: CancellationToken,
}

impl Database {
    pub fn new(options: PgConnectOptions, registry: Arc<ModelRegistry>) -> Result<Self> {
        Self::wrap(database::Database::new(options, registry))
    }

    pub fn from_url(url: &str, registry: Arc<ModelRegistry>) -> Result<Self> {
        Self::wrap(database::Database::from_url(url, registry)?)
    }

    pub fn from_config(config: &DatabaseConfig, registry: Arc<ModelRegistry>) -> Result<Self> {
        Self::wrap(database::Database::from_config(config, registry)?)
    }

    /// Wrap an existing async handle. Fails inside an async runtime.
    pub fn wrap(inner: database::Database) -> Result<Self> {
        if Handle::try_current().is_ok() {
            return Err(inside_runtime());
        }
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| DbError::config(format!("failed to create runtime: {e}")))?;
        Ok(Self {
            runtime: Some(runtime),
            inner,
            cancel: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn open_count(&self) -> u64 {
        self.inner.open_count()
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        self.inner.registry()
    }

    pub fn ensure_open(&mut self) -> Result<()> {
        let Self { runtime, inner, cancel } = self;
        block_on(runtime.as_ref(), inner.ensure_open(cancel))
    }

    pub fn close(&mut self) -> Result<()> {
        block_on(self.runtime.as_ref(), self.inner.close())
    }

    pub fn scalar(&mut self, sql: &str, params: &Params) -> Result<Option<Value>> {
        let Self { runtime, inner, cancel } = self;
        block_on(runtime.as_ref(), inner.scalar(sql, params, cancel))
    }

    pub fn scalar_as<T>(&mut self, sql: &str, params: &Params) -> Result<Option<T>>
    where
        T: for<'r> Decode<'r, Postgres> + Type<Postgres> + Send + Unpin,
    {
        let Self { runtime, inner, cancel } = self;
        block_on(runtime.as_ref(), inner.scalar_as(sql, params, cancel))
    }

    pub fn object(&mut self, sql: &str, model: &str, params: &Params) -> Result<Option<Box<dyn Record>>> {
        let Self { runtime, inner, cancel } = self;
        block_on(runtime.as_ref(), inner.object(sql, model, params, cancel))
    }

    pub fn object_as<T: Model>(&mut self, sql: &str, params: &Params) -> Result<Option<T>> {
        let Self { runtime, inner, cancel } = self;
        block_on(runtime.as_ref(), inner.object_as(sql, params, cancel))
    }

    pub fn object_list(&mut self, sql: &str, model: &str, params: &Params) -> Result<Vec<Box<dyn Record>>> {
        let Self { runtime, inner, cancel } = self;
        block_on(runtime.as_ref(), inner.object_list(sql, model, params, cancel))
    }

    pub fn object_list_as<T: Model>(&mut self, sql: &str, params: &Params) -> Result<Vec<T>> {
        let Self { runtime, inner, cancel } = self;
        block_on(runtime.as_ref(), inner.object_list_as(sql, params, cancel))
    }

    pub fn scalar_list(&mut self, sql: &str, params: &Params) -> Result<Vec<String>> {
        let Self { runtime, inner, cancel } = self;
        block_on(runtime.as_ref(), inner.scalar_list(sql, params, cancel))
    }

    pub fn keyed_object_list(
        &mut self,
        sql: &str,
        key_columns: &[&str],
        model: &str,
        params: &Params,
    ) -> Result<IndexMap<String, Box<dyn Record>>> {
        let Self { runtime, inner, cancel } = self;
        block_on(runtime.as_ref(), inner.keyed_object_list(sql, key_columns, model, params, cancel))
    }

    pub fn insert(&mut self, table: &str, params: &Params) -> Result<u64> {
        let Self { runtime, inner, cancel } = self;
        block_on(runtime.as_ref(), inner.insert(table, params, cancel))
    }

    pub fn update(&mut self, table: &str, params: &Params, where_params: &Params) -> Result<u64> {
        let Self { runtime, inner, cancel } = self;
        block_on(runtime.as_ref(), inner.update(table, params, where_params, cancel))
    }

    pub fn delete(&mut self, table: &str, where_params: &Params) -> Result<u64> {
        let Self { runtime, inner, cancel } = self;
        block_on(runtime.as_ref(), inner.delete(table, where_params, cancel))
    }

    pub fn custom_bulk_update(&mut self, sql: &str, params: &Params) -> Result<u64> {
        let Self { runtime, inner, cancel } = self;
        block_on(runtime.as_ref(), inner.custom_bulk_update(sql, params, cancel))
    }

    pub fn insert_ignoring_duplicates(&mut self, table: &str, params: &Params) -> Result<u64> {
        let Self { runtime, inner, cancel } = self;
        block_on(runtime.as_ref(), inner.insert_ignoring_duplicates(table, params, cancel))
    }

    pub fn process_transition(&mut self) -> Result<u64> {
        let Self { runtime, inner, cancel } = self;
        block_on(runtime.as_ref(), inner.process_transition(cancel))
    }

    pub fn bulk_insert(&mut self, table: &str, row_count: usize, data: BulkData) -> Result<u64> {
        let Self { runtime, inner, cancel } = self;
        block_on(runtime.as_ref(), inner.bulk_insert(table, row_count, data, cancel))
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        if Handle::try_current().is_ok() {
            // a runtime dropped inside another one panics
            runtime.shutdown_background();
            return;
        }
        if self.inner.state() == ConnectionState::Closed {
            return;
        }
        if let Err(err) = runtime.block_on(self.inner.close()) {
            debug!(error = %err, "close on drop failed");
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("blocking::Database").field(&self.inner).finish()
    }
}

fn inside_runtime() -> DbError {
    DbError::config("blocking::Database cannot be used from within an async runtime")
}

fn block_on<F, T>(runtime: Option<&Runtime>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if Handle::try_current().is_ok() {
        return Err(inside_runtime());
    }
    let runtime = runtime.ok_or_else(|| DbError::config("blocking::Database runtime is gone"))?;
    runtime.block_on(fut)
}
