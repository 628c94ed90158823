//! Scope locks: the single place the "lock every row for one coordination
//! scope" rule lives.
//!
//! A scope lock opens a transaction and immediately upserts the scope's row in
//! `scope_locks`, taking the store's writer lock. Every reader and writer for
//! the same scope goes through the same upsert, so a second holder blocks
//! until the first transaction commits or rolls back, across processes as well
//! as tasks. Callers must finish all network I/O before acquiring a lock and
//! must not start any while holding one.

use chrono::{SecondsFormat, Utc};
use sqlx::{Sqlite, SqliteConnection, Transaction};

use crate::repositories::RepositoryError;
use crate::DbPool;

/// Coordinator scope: all queued-message rows for one (project, client).
pub fn client_scope(project_id: &str, client_id: &str) -> String {
    format!("client:{project_id}:{client_id}")
}

/// Allocator scope: all booking rows for one (project, specialist, date).
pub fn calendar_scope(project_id: &str, specialist: &str, date: chrono::NaiveDate) -> String {
    format!("calendar:{project_id}:{specialist}:{date}")
}

pub struct ScopeLock {
    tx: Transaction<'static, Sqlite>,
}

impl ScopeLock {
    /// Acquires one transaction holding every listed scope. Keys are locked in
    /// sorted order so two holders wanting overlapping scope sets cannot
    /// deadlock each other.
    pub async fn acquire(pool: &DbPool, scope_keys: &[String]) -> Result<Self, RepositoryError> {
        let mut keys: Vec<&str> = scope_keys.iter().map(String::as_str).collect();
        keys.sort_unstable();
        keys.dedup();

        let mut tx = pool.begin().await?;
        let locked_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        for key in keys {
            sqlx::query(
                "INSERT INTO scope_locks (scope_key, locked_at) VALUES (?, ?)
                 ON CONFLICT(scope_key) DO UPDATE SET locked_at = excluded.locked_at",
            )
            .bind(key)
            .bind(&locked_at)
            .execute(&mut *tx)
            .await?;
        }

        Ok(Self { tx })
    }

    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    pub async fn commit(self) -> Result<(), RepositoryError> {
        self.tx.commit().await?;
        Ok(())
    }

    /// Dropping without commit rolls the transaction back, releasing the lock
    /// and discarding any writes made under it.
    pub async fn rollback(self) -> Result<(), RepositoryError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
