//! Inbound-message coordination. Guarantees that rapid-fire or duplicated
//! deliveries from one client collapse into a single visible reply: retried
//! deliveries are skipped, overlapping turns are folded together, and winner
//! arbitration picks the latest-created item.
//!
//! All decisions run inside a client-scope lock so they hold across worker
//! processes, not just tasks in this one.

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use bookline_core::domain::message::{
    ClaimOutcome, InboundEvent, MessageStatus, QueuedMessage, QueuedMessageId, SubmitOutcome,
};
use bookline_core::errors::{CoordinatorError, DomainError};
use bookline_db::repositories::{queue, RepositoryError};
use bookline_db::{client_scope, DbPool, ScopeLock};

pub struct MessageCoordinator {
    pool: DbPool,
}

impl MessageCoordinator {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Accepts one inbound event. Retried deliveries of an already-handled
    /// turn are skipped before any lock is taken. Otherwise every open row for
    /// the client is superseded and its text folded into the new item.
    pub async fn submit(&self, event: InboundEvent) -> Result<SubmitOutcome, CoordinatorError> {
        if event.retry && event.delivery_count == 0 {
            info!(
                event_name = "coordinator.submit_skipped",
                project_id = %event.project_id,
                client_id = %event.client_id,
                "retried delivery of a handled turn, skipping"
            );
            return Ok(SubmitOutcome::Skipped);
        }

        let scope = client_scope(&event.project_id, &event.client_id);
        let mut lock = ScopeLock::acquire(&self.pool, &[scope]).await.map_err(store_err)?;

        let open = queue::list_for_client(
            lock.conn(),
            &event.project_id,
            &event.client_id,
            &[MessageStatus::Pending, MessageStatus::Processing],
        )
        .await
        .map_err(store_err)?;

        let now = Utc::now();
        let mut parts = Vec::with_capacity(open.len() + 1);
        for row in &open {
            queue::set_status(lock.conn(), &row.id, MessageStatus::Superseded, now)
                .await
                .map_err(store_err)?;
            parts.push(row.aggregated_text.clone());
        }
        parts.push(event.text.clone());

        let message = QueuedMessage {
            id: QueuedMessageId(Uuid::new_v4().to_string()),
            project_id: event.project_id,
            client_id: event.client_id,
            original_text: event.text,
            aggregated_text: parts.join(" "),
            status: MessageStatus::Pending,
            retry_count: event.delivery_count,
            created_at: now,
            updated_at: now,
        };
        queue::insert(lock.conn(), &message).await.map_err(store_err)?;
        lock.commit().await.map_err(store_err)?;

        info!(
            event_name = "coordinator.submitted",
            item_id = %message.id,
            project_id = %message.project_id,
            client_id = %message.client_id,
            superseded = open.len(),
            "inbound turn queued"
        );
        Ok(SubmitOutcome::Queued(message))
    }

    /// Marks an item picked up by the turn processor. A superseded item is
    /// left alone: its computation may proceed but will lose arbitration.
    pub async fn mark_processing(&self, id: &QueuedMessageId) -> Result<(), CoordinatorError> {
        let Some(item) = self.locate(id).await? else {
            return Err(CoordinatorError::ItemNotFound(id.clone()));
        };

        let scope = client_scope(&item.project_id, &item.client_id);
        let mut lock = ScopeLock::acquire(&self.pool, &[scope]).await.map_err(store_err)?;

        let current = queue::find_by_id(lock.conn(), id)
            .await
            .map_err(store_err)?
            .ok_or_else(|| CoordinatorError::ItemNotFound(id.clone()))?;
        if current.status == MessageStatus::Superseded {
            lock.rollback().await.map_err(store_err)?;
            return Ok(());
        }
        transition(lock.conn(), &current, MessageStatus::Processing, Utc::now()).await?;
        lock.commit().await.map_err(store_err)?;
        Ok(())
    }

    /// Last-writer-wins arbitration over every row for the item's client,
    /// terminal and superseded rows included. The row with the latest
    /// `created_at` wins; everything else open is superseded.
    pub async fn claim_winner(&self, id: &QueuedMessageId) -> Result<ClaimOutcome, CoordinatorError> {
        let Some(item) = self.locate(id).await? else {
            return Err(CoordinatorError::ItemNotFound(id.clone()));
        };

        let scope = client_scope(&item.project_id, &item.client_id);
        let mut lock = ScopeLock::acquire(&self.pool, &[scope]).await.map_err(store_err)?;

        let all = queue::list_all_for_client(lock.conn(), &item.project_id, &item.client_id)
            .await
            .map_err(store_err)?;
        let current = all
            .iter()
            .find(|row| row.id == *id)
            .ok_or_else(|| CoordinatorError::ItemNotFound(id.clone()))?;
        // Rows come back in creation order, so the winner is the last one.
        let latest = all.last().ok_or_else(|| CoordinatorError::ItemNotFound(id.clone()))?;

        let now = Utc::now();
        if latest.id == *id {
            transition(lock.conn(), current, MessageStatus::Completed, now).await?;
            for row in &all {
                if row.id != *id && !row.status.is_terminal() {
                    transition(lock.conn(), row, MessageStatus::Superseded, now).await?;
                }
            }
            lock.commit().await.map_err(store_err)?;
            info!(
                event_name = "coordinator.claim_won",
                item_id = %id,
                client_id = %item.client_id,
                "turn won delivery arbitration"
            );
            Ok(ClaimOutcome::Win)
        } else {
            if !current.status.is_terminal() {
                transition(lock.conn(), current, MessageStatus::Superseded, now).await?;
            }
            lock.commit().await.map_err(store_err)?;
            info!(
                event_name = "coordinator.claim_lost",
                item_id = %id,
                latest_id = %latest.id,
                client_id = %item.client_id,
                "turn lost delivery arbitration"
            );
            Ok(ClaimOutcome::Lose)
        }
    }

    /// Cancels a failed turn. Terminal items are left untouched so a late
    /// failure report on a superseded turn is harmless.
    pub async fn mark_failed(&self, id: &QueuedMessageId) -> Result<(), CoordinatorError> {
        let Some(item) = self.locate(id).await? else {
            return Err(CoordinatorError::ItemNotFound(id.clone()));
        };

        let scope = client_scope(&item.project_id, &item.client_id);
        let mut lock = ScopeLock::acquire(&self.pool, &[scope]).await.map_err(store_err)?;

        let current = queue::find_by_id(lock.conn(), id)
            .await
            .map_err(store_err)?
            .ok_or_else(|| CoordinatorError::ItemNotFound(id.clone()))?;
        if current.status.is_terminal() {
            lock.rollback().await.map_err(store_err)?;
            return Ok(());
        }
        transition(lock.conn(), &current, MessageStatus::Cancelled, Utc::now()).await?;
        lock.commit().await.map_err(store_err)?;

        info!(
            event_name = "coordinator.turn_failed",
            item_id = %id,
            client_id = %item.client_id,
            "turn cancelled after processing failure"
        );
        Ok(())
    }

    async fn locate(&self, id: &QueuedMessageId) -> Result<Option<QueuedMessage>, CoordinatorError> {
        queue::find_by_id(&self.pool, id).await.map_err(store_err)
    }
}

async fn transition(
    conn: &mut sqlx::SqliteConnection,
    row: &QueuedMessage,
    to: MessageStatus,
    now: DateTime<Utc>,
) -> Result<(), CoordinatorError> {
    if !row.status.can_transition(to) {
        return Err(DomainError::InvalidStatusTransition { from: row.status, to }.into());
    }
    queue::set_status(conn, &row.id, to, now).await.map_err(store_err)
}

fn store_err(error: RepositoryError) -> CoordinatorError {
    CoordinatorError::Store(error.to_string())
}
