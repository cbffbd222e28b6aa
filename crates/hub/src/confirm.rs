//! Operator confirmation desk. The growth coordinator parks a proposal here;
//! the web API answers it.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use time::OffsetDateTime;
use tokio::sync::oneshot;

use crate::growth::{Confirmation, Confirmer, GrowthStage};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnswerError {
    #[error("no stage change is awaiting confirmation")]
    NothingPending,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PendingProposal {
    pub stage: GrowthStage,
    #[serde(with = "time::serde::rfc3339")]
    pub since: OffsetDateTime,
}

struct Slot {
    proposal: PendingProposal,
    reply: oneshot::Sender<Confirmation>,
}

#[derive(Clone, Default)]
pub struct ConfirmationDesk {
    slot: Arc<Mutex<Option<Slot>>>,
}

impl ConfirmationDesk {
    fn lock(&self) -> MutexGuard<'_, Option<Slot>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pending(&self) -> Option<PendingProposal> {
        self.lock().as_ref().map(|s| s.proposal)
    }

    /// Hands `answer` to whoever is waiting. Whether a `Confirmed` stage
    /// matches the proposal is the waiter's call.
    pub fn answer(&self, answer: Confirmation) -> Result<(), AnswerError> {
        let slot = self.lock().take().ok_or(AnswerError::NothingPending)?;
        // the waiter may have just timed out
        let _ = slot.reply.send(answer);
        Ok(())
    }
}

/// Clears the slot when the waiting future finishes or is dropped.
struct ClearOnExit<'a>(&'a ConfirmationDesk);

impl Drop for ClearOnExit<'_> {
    fn drop(&mut self) {
        self.0.lock().take();
    }
}

#[async_trait]
impl Confirmer for ConfirmationDesk {
    async fn request_confirmation(&self, proposed: GrowthStage) -> Confirmation {
        let (tx, rx) = oneshot::channel();
        *self.lock() = Some(Slot {
            proposal: PendingProposal {
                stage: proposed,
                since: OffsetDateTime::now_utc(),
            },
            reply: tx,
        });
        let _clear = ClearOnExit(self);
        tracing::info!(stage = %proposed, "waiting for operator confirmation");
        rx.await.unwrap_or(Confirmation::TimedOut)
    }
}
