//! Connection lifecycle - one owned connection, opened lazily
//!
//! States: closed -> open -> broken -> (reopen) open -> closed.
//! There is no pooling here: the manager owns exactly one handle and
//! reopens it when a transport failure left it broken.

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::Connection;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{DbError, Result};

/// Opens and closes physical connections.
#[async_trait]
pub trait Connector: Send + Sync {
    type Connection: Send;

    async fn connect(&self) -> std::result::Result<Self::Connection, sqlx::Error>;

    async fn close(&self, conn: Self::Connection) -> std::result::Result<(), sqlx::Error>;
}

/// PostgreSQL connector over `sqlx`.
#[derive(Debug, Clone)]
pub struct PgConnector {
    options: PgConnectOptions,
}

impl PgConnector {
    pub fn new(options: PgConnectOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &PgConnectOptions {
        &self.options
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Connection = PgConnection;

    async fn connect(&self) -> std::result::Result<PgConnection, sqlx::Error> {
        PgConnection::connect_with(&self.options).await
    }

    async fn close(&self, conn: PgConnection) -> std::result::Result<(), sqlx::Error> {
        conn.close().await
    }
}

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Open,
    Broken,
}

/// Owns the single connection and its state transitions.
pub struct ConnectionManager<C: Connector> {
    connector: C,
    conn: Option<C::Connection>,
    broken: bool,
    opens: u64,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            conn: None,
            broken: false,
            opens: 0,
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn state(&self) -> ConnectionState {
        match (&self.conn, self.broken) {
            (None, _) => ConnectionState::Closed,
            (Some(_), true) => ConnectionState::Broken,
            (Some(_), false) => ConnectionState::Open,
        }
    }

    /// Physical opens performed so far.
    pub fn open_count(&self) -> u64 {
        self.opens
    }

    /// Make sure the connection is open and return it.
    ///
    /// Open: no-op. Closed: open. Broken: close, then open. Open failures
    /// are reported as [`DbError::Connection`] and not retried.
    pub async fn ensure_open(&mut self, cancel: &CancellationToken) -> Result<&mut C::Connection> {
        if self.broken {
            self.broken = false;
            if let Some(conn) = self.conn.take() {
                debug!("connection broken, reopening");
                if let Err(err) = self.connector.close(conn).await {
                    debug!(error = %err, "close of broken connection failed");
                }
            }
        }

        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => self.connect(cancel).await?,
        };
        Ok(self.conn.insert(conn))
    }

    async fn connect(&mut self, cancel: &CancellationToken) -> Result<C::Connection> {
        let conn = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DbError::Cancelled),
            res = self.connector.connect() => res.map_err(|source| DbError::Connection { source })?,
        };
        self.opens += 1;
        debug!(opens = self.opens, "connection opened");
        Ok(conn)
    }

    /// Flag the open connection as unusable; the next `ensure_open` reopens.
    pub fn mark_broken(&mut self) {
        if self.conn.is_some() {
            self.broken = true;
        }
    }

    /// Close the connection. Idempotent; the manager ends up closed even
    /// when the close handshake fails.
    pub async fn close(&mut self) -> Result<()> {
        let broken = std::mem::take(&mut self.broken);
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };

        debug!("closing connection");
        match self.connector.close(conn).await {
            Ok(()) => Ok(()),
            Err(err) if broken => {
                debug!(error = %err, "close of broken connection failed");
                Ok(())
            }
            Err(err) => Err(DbError::Driver(err)),
        }
    }
}
