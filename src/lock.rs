use sea_orm::{ConnectionTrait, DbBackend, Statement, Value};
use tokio::sync::{Mutex, MutexGuard};

use crate::config::AdvisoryLockStrategy;
use crate::error::TreeError;

/// Serializes structural mutations of one engine instance.
///
/// The in-process mutex is held for the whole mutation. On PostgreSQL the
/// caller's transaction additionally takes a transaction-scoped advisory lock,
/// released by the database on commit or rollback.
#[derive(Debug)]
pub struct MutationLock {
    inner: Mutex<()>,
    strategy: AdvisoryLockStrategy,
}

/// Held while a mutation runs.
#[must_use = "the mutation lock is released as soon as the guard is dropped"]
pub struct MutationGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl MutationLock {
    pub fn new(strategy: AdvisoryLockStrategy) -> Self {
        Self {
            inner: Mutex::new(()),
            strategy,
        }
    }

    pub fn strategy(&self) -> &AdvisoryLockStrategy {
        &self.strategy
    }

    pub async fn acquire<C: ConnectionTrait>(
        &self,
        conn: &C,
    ) -> Result<MutationGuard<'_>, TreeError> {
        let guard = self.inner.lock().await;

        if let Some(key) = self.strategy.key() {
            if conn.get_database_backend() == DbBackend::Postgres {
                acquire_xact_lock(conn, key.as_str()).await?;
            }
        }

        Ok(MutationGuard { _guard: guard })
    }
}

async fn acquire_xact_lock<C: ConnectionTrait>(conn: &C, key: &str) -> Result<(), TreeError> {
    conn.execute(Statement::from_sql_and_values(
        DbBackend::Postgres,
        "SELECT pg_advisory_xact_lock(hashtext($1))",
        vec![Value::from(key)],
    ))
    .await?;
    tracing::trace!(key, "advisory lock acquired");
    Ok(())
}
