//! Turn processing boundary. The engine does not understand language; it
//! hands an aggregated turn to a [`TurnProcessor`] and routes the computed
//! reply through winner arbitration so a client never sees more than one
//! answer per turn. Processor and delivery calls run with no lock held.

use async_trait::async_trait;
use tracing::warn;

use bookline_core::domain::message::{
    ClaimOutcome, InboundEvent, QueuedMessage, QueuedMessageId, SubmitOutcome,
};
use bookline_core::errors::CoordinatorError;

use crate::coordinator::MessageCoordinator;

/// Computes a reply for one aggregated turn. Implementations typically call
/// a language-model service and the slot allocator.
#[async_trait]
pub trait TurnProcessor: Send + Sync {
    async fn process(&self, message: &QueuedMessage) -> anyhow::Result<String>;
}

/// Sends a winning reply back through the originating channel.
#[async_trait]
pub trait ReplyDelivery: Send + Sync {
    async fn deliver(&self, project_id: &str, client_id: &str, reply: &str) -> anyhow::Result<()>;
}

/// How one inbound event ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Retried delivery of an already-handled turn; nothing happened.
    Skipped,
    /// This turn won arbitration and its reply went out.
    Delivered { item_id: QueuedMessageId, reply: String },
    /// A newer turn superseded this one; the computed reply was dropped.
    Discarded { item_id: QueuedMessageId },
    /// Processing failed; the item was cancelled.
    Failed { item_id: QueuedMessageId, error: String },
}

/// Drives one turn end to end: submit, process, claim, deliver.
pub struct TurnDriver<P, D> {
    coordinator: MessageCoordinator,
    processor: P,
    delivery: D,
}

impl<P, D> TurnDriver<P, D>
where
    P: TurnProcessor,
    D: ReplyDelivery,
{
    pub fn new(coordinator: MessageCoordinator, processor: P, delivery: D) -> Self {
        Self { coordinator, processor, delivery }
    }

    pub fn coordinator(&self) -> &MessageCoordinator {
        &self.coordinator
    }

    pub async fn run_turn(&self, event: InboundEvent) -> Result<TurnOutcome, CoordinatorError> {
        let message = match self.coordinator.submit(event).await? {
            SubmitOutcome::Skipped => return Ok(TurnOutcome::Skipped),
            SubmitOutcome::Queued(message) => message,
        };
        self.coordinator.mark_processing(&message.id).await?;

        let reply = match self.processor.process(&message).await {
            Ok(reply) => reply,
            Err(error) => {
                self.coordinator.mark_failed(&message.id).await?;
                return Ok(TurnOutcome::Failed {
                    item_id: message.id,
                    error: error.to_string(),
                });
            }
        };

        match self.coordinator.claim_winner(&message.id).await? {
            ClaimOutcome::Win => {
                if let Err(error) = self
                    .delivery
                    .deliver(&message.project_id, &message.client_id, &reply)
                    .await
                {
                    warn!(
                        event_name = "turn.delivery_failed",
                        item_id = %message.id,
                        error = %error,
                        "reply delivery failed after winning arbitration"
                    );
                }
                Ok(TurnOutcome::Delivered { item_id: message.id, reply })
            }
            ClaimOutcome::Lose => Ok(TurnOutcome::Discarded { item_id: message.id }),
        }
    }
}

/// Stand-in processor that echoes the aggregated turn text. Useful while a
/// real language-model integration is wired up, and in tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct EchoTurnProcessor;

#[async_trait]
impl TurnProcessor for EchoTurnProcessor {
    async fn process(&self, message: &QueuedMessage) -> anyhow::Result<String> {
        Ok(format!("received: {}", message.aggregated_text))
    }
}

/// Delivery for channels where the reply travels back in the webhook response
/// itself, so there is nothing to push.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopDelivery;

#[async_trait]
impl ReplyDelivery for NoopDelivery {
    async fn deliver(&self, _project_id: &str, _client_id: &str, _reply: &str) -> anyhow::Result<()> {
        Ok(())
    }
}
