// ABOUTME: Pooled database handle with lifetime/idle policy and health checks
// ABOUTME: Provides the scoped transaction helper every schema change runs through

use super::connection;
use crate::config::{DbConfig, DEFAULT_HEALTH_CHECK_TIMEOUT};
use crate::error::{DbError, ProvisionError, TxError};
use deadpool_postgres::{
    Manager, ManagerConfig, Object, Pool, PoolError, RecyclingMethod, Runtime,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::cell::Cell;
use std::ops::{Deref, DerefMut};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::{Client, Transaction};
use tokio_util::sync::CancellationToken;

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub max_open: usize,
    pub open: usize,
    pub idle: usize,
    pub in_use: usize,
}

struct PoolInner {
    config: DbConfig,
    pool: Pool,
}

impl PoolInner {
    /// Drop idle connections past their lifetime or idle time, and any beyond max idle
    fn sweep(&self) {
        let config = &self.config;
        let kept = Cell::new(0usize);
        let swept = self.pool.retain(|_, metrics| {
            let keep = metrics.age() < config.conn_max_lifetime
                && metrics.last_used() < config.conn_max_idle_time
                && kept.get() < config.max_idle_conns;
            if keep {
                kept.set(kept.get() + 1);
            }
            keep
        });
        if !swept.removed.is_empty() {
            tracing::debug!("Retired {} idle connection(s)", swept.removed.len());
        }
    }
}

fn checkout_error(error: PoolError, timeout: Duration) -> DbError {
    match error {
        PoolError::Backend(source) => DbError::Connect {
            hint: connection::connection_hint(&source.to_string()),
            source,
        },
        PoolError::Timeout(_) => DbError::Timeout {
            operation: "connect",
            timeout,
        },
        PoolError::Closed => DbError::PoolClosed,
        other => DbError::Other(other.to_string()),
    }
}

/// A connection checked out of the pool; returns itself on drop
pub struct PooledClient {
    conn: Option<Object>,
    pool: Arc<PoolInner>,
    broken: bool,
}

impl PooledClient {
    /// Discard this connection instead of returning it to the pool
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Run `f` inside a transaction on this connection
    ///
    /// Commits when `f` succeeds and rolls back otherwise. A failed rollback is
    /// reported together with the original cause and the connection is discarded.
    /// If the token fires while `f` is running, the transaction is rolled back before
    /// returning [`TxError::Cancelled`]. A panic inside `f` rolls back, then resumes.
    pub async fn transaction_scope<T, E, F>(
        &mut self,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T, TxError<E>>
    where
        F: for<'t> FnOnce(&'t Transaction<'t>) -> BoxFuture<'t, Result<T, E>>,
    {
        enum Step<T, E> {
            Finished(Result<T, E>),
            Cancelled,
            Panicked(Box<dyn std::any::Any + Send>),
        }

        if cancel.is_cancelled() {
            return Err(TxError::Cancelled);
        }

        let tx = self
            .transaction()
            .await
            .map_err(|e| TxError::Begin(e.into()))?;

        let step = {
            let work = AssertUnwindSafe(f(&tx)).catch_unwind();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                outcome = work => match outcome {
                    Ok(result) => Step::Finished(result),
                    Err(panic) => Step::Panicked(panic),
                },
            }
        };

        match step {
            Step::Finished(Ok(value)) => {
                tx.commit().await.map_err(|e| TxError::Commit(e.into()))?;
                Ok(value)
            }
            Step::Finished(Err(cause)) => match tx.rollback().await {
                Ok(()) => Err(TxError::Aborted(cause)),
                Err(rollback) => {
                    self.mark_broken();
                    Err(TxError::RollbackFailed {
                        cause,
                        rollback: rollback.into(),
                    })
                }
            },
            Step::Cancelled => {
                if let Err(e) = tx.rollback().await {
                    tracing::warn!("Rollback after cancellation failed: {}", e);
                    self.mark_broken();
                }
                Err(TxError::Cancelled)
            }
            Step::Panicked(payload) => {
                if let Err(e) = tx.rollback().await {
                    tracing::warn!("Rollback after panic failed: {}", e);
                    self.mark_broken();
                }
                std::panic::resume_unwind(payload)
            }
        }
    }
}

impl Deref for PooledClient {
    type Target = Client;

    fn deref(&self) -> &Client {
        self.conn
            .as_ref()
            .expect("pooled connection is present until drop")
    }
}

impl DerefMut for PooledClient {
    fn deref_mut(&mut self) -> &mut Client {
        self.conn
            .as_mut()
            .expect("pooled connection is present until drop")
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.broken {
                // Detached from the pool, so the session closes with it
                drop(Object::take(conn));
            } else {
                drop(conn);
                self.pool.sweep();
            }
        }
    }
}

/// Pooled handle to the shared database
///
/// Cloning is cheap; clones share one pool.
#[derive(Clone)]
pub struct Database {
    inner: Arc<PoolInner>,
}

impl Database {
    /// Open the pool and verify liveness with a bounded ping
    ///
    /// No handle is returned unless the ping succeeds within `connect_timeout`.
    pub async fn open(config: DbConfig) -> Result<Self, ProvisionError> {
        let config = config.with_defaults();
        let tls = connection::make_tls(&config).map_err(ProvisionError::Connection)?;

        let manager = Manager::from_config(
            config.to_pg_config(),
            tls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(config.max_open_conns)
            .runtime(Runtime::Tokio1)
            .create_timeout(Some(config.connect_timeout))
            .recycle_timeout(Some(config.connect_timeout))
            .build()
            .map_err(|e| ProvisionError::Connection(DbError::Other(e.to_string())))?;

        let db = Database {
            inner: Arc::new(PoolInner { config, pool }),
        };

        let timeout = db.inner.config.connect_timeout;
        if let Err(e) = db.ping(timeout).await {
            db.close();
            return Err(ProvisionError::Connection(e));
        }

        tracing::info!(
            "✓ Connected to {} (sslmode={}, max {} connections)",
            db.inner.config.display_target(),
            db.inner.config.ssl_mode,
            db.inner.config.max_open_conns
        );
        Ok(db)
    }

    pub fn config(&self) -> &DbConfig {
        &self.inner.config
    }

    /// Check a connection out of the pool, opening one if none is idle
    pub async fn acquire(&self) -> Result<PooledClient, DbError> {
        let inner = &self.inner;
        if inner.pool.is_closed() {
            return Err(DbError::PoolClosed);
        }
        inner.sweep();

        let conn = inner
            .pool
            .get()
            .await
            .map_err(|e| checkout_error(e, inner.config.connect_timeout))?;

        Ok(PooledClient {
            conn: Some(conn),
            pool: inner.clone(),
            broken: false,
        })
    }

    /// Acquire a connection and round-trip an empty statement within `timeout`
    pub async fn ping(&self, timeout: Duration) -> Result<(), DbError> {
        tokio::time::timeout(timeout, async {
            let client = self.acquire().await?;
            client.batch_execute("").await?;
            Ok(())
        })
        .await
        .map_err(|_| DbError::Timeout {
            operation: "ping",
            timeout,
        })?
    }

    /// Ping plus a trivial query, both inside `timeout` (2s when `None`)
    pub async fn health_check(&self, timeout: Option<Duration>) -> Result<(), DbError> {
        let timeout = timeout.unwrap_or(DEFAULT_HEALTH_CHECK_TIMEOUT);
        tokio::time::timeout(timeout, async {
            let client = self.acquire().await?;
            client.batch_execute("").await?;
            let row = client.query_one("SELECT 1", &[]).await?;
            let value: i32 = row.try_get(0)?;
            if value != 1 {
                return Err(DbError::Other(format!(
                    "health check query returned {} instead of 1",
                    value
                )));
            }
            Ok(())
        })
        .await
        .map_err(|_| DbError::Timeout {
            operation: "health check",
            timeout,
        })?
    }

    /// Run `f` in a transaction on a pooled connection
    ///
    /// See [`PooledClient::transaction_scope`] for the commit/rollback contract.
    pub async fn with_transaction<T, E, F>(
        &self,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T, TxError<E>>
    where
        F: for<'t> FnOnce(&'t Transaction<'t>) -> BoxFuture<'t, Result<T, E>>,
    {
        if cancel.is_cancelled() {
            return Err(TxError::Cancelled);
        }
        let mut conn = self.acquire().await.map_err(TxError::Begin)?;
        conn.transaction_scope(cancel, f).await
    }

    pub fn stats(&self) -> PoolStats {
        let status = self.inner.pool.status();
        PoolStats {
            max_open: status.max_size,
            open: status.size,
            idle: status.available,
            in_use: status.size.saturating_sub(status.available),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.pool.is_closed()
    }

    /// Release every idle connection and refuse new checkouts
    ///
    /// Connections still checked out are discarded when returned. Calling this more
    /// than once is harmless.
    pub fn close(&self) {
        if self.inner.pool.is_closed() {
            return;
        }
        self.inner.pool.close();
        tracing::debug!("Connection pool closed");
    }
}
