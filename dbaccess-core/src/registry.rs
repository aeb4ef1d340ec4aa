//! Model registry: builds caller-chosen record types from result rows.
//!
//! Record types are registered once at startup under a stable name. An
//! executor is handed that name, resolves it once per call and invokes the
//! factory for each row. Field layout is the record type's business; the
//! registry only maps names to constructors.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use sqlx::postgres::PgRow;
use sqlx::FromRow;
use tracing::trace;

use crate::error::{DbError, Result};

/// Any materialized record.
pub trait Record: Any + Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;
}

impl<T: Any + Debug + Send + Sync> Record for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }
}

impl dyn Record {
    pub fn is<T: Record>(&self) -> bool {
        self.as_any().is::<T>()
    }

    pub fn downcast_ref<T: Record>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Recover the concrete record; on a mismatch the value comes back as `dyn Any`.
    pub fn downcast<T: Record>(
        self: Box<Self>,
    ) -> std::result::Result<Box<T>, Box<dyn Any + Send + Sync>> {
        Record::into_any(self).downcast::<T>()
    }
}

/// A record type with a stable registry name.
pub trait Model: Record {
    const MODEL_NAME: &'static str;
}

type Factory<R> = Arc<dyn Fn(&R) -> std::result::Result<Box<dyn Record>, sqlx::Error> + Send + Sync>;

/// Name to factory map over row type `R`.
pub struct ModelRegistry<R = PgRow> {
    factories: HashMap<String, Factory<R>>,
}

impl<R: 'static> ModelRegistry<R> {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register `T` under `T::MODEL_NAME`, built with its `FromRow` impl.
    pub fn register<T>(&mut self) -> Result<&mut Self>
    where
        R: sqlx::Row,
        T: Model + for<'r> FromRow<'r, R>,
    {
        self.register_with(T::MODEL_NAME, |row: &R| T::from_row(row))
    }

    /// Register a hand-written constructor under `name`.
    pub fn register_with<T, F>(&mut self, name: impl Into<String>, factory: F) -> Result<&mut Self>
    where
        T: Record,
        F: Fn(&R) -> std::result::Result<T, sqlx::Error> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(DbError::DuplicateModel { model: name });
        }
        let factory: Factory<R> =
            Arc::new(move |row: &R| factory(row).map(|record| Box::new(record) as Box<dyn Record>));
        self.factories.insert(name, factory);
        Ok(self)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Look up a factory. Unknown names are a configuration error.
    pub fn resolve(&self, name: &str) -> Result<ResolvedModel<'_, R>> {
        self.factories
            .get_key_value(name)
            .map(|(name, factory)| ResolvedModel { name, factory })
            .ok_or_else(|| DbError::UnknownModel {
                model: name.to_string(),
            })
    }

    /// Resolve and build in one step.
    pub fn create(&self, name: &str, row: &R) -> Result<Box<dyn Record>> {
        self.resolve(name)?.create(row)
    }
}

impl<R: 'static> Default for ModelRegistry<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Debug for ModelRegistry<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("models", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A factory resolved for one executor call.
pub struct ResolvedModel<'a, R> {
    name: &'a str,
    factory: &'a Factory<R>,
}

impl<R> ResolvedModel<'_, R> {
    pub fn name(&self) -> &str {
        self.name
    }

    /// Build one record from the current row.
    pub fn create(&self, row: &R) -> Result<Box<dyn Record>> {
        trace!(model = self.name, "materializing row");
        (self.factory)(row).map_err(|source| DbError::Materialization {
            model: self.name.to_string(),
            source,
        })
    }
}
