/***************************************/
/*        3rd party libraries          */
/***************************************/
use crossbeam_channel as cbc;
use log::warn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/***************************************/
/*           Local modules             */
/***************************************/
use crate::shared::{BusError, ElevatorId, ElevatorState};

#[cfg(test)]
pub mod memory;
pub mod redis;
pub mod retry;

#[cfg(test)]
pub use memory::InMemoryBus;
pub use redis::RedisBus;
pub use retry::RetryPolicy;

/***************************************/
/*       Public data structures        */
/***************************************/

/// One message handed out by a consumer group. `message_id` is the ack token.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message_id: String,
    pub payload: String,
}

/**
 * Live subscription to a broadcast channel.
 *
 * Messages arrive on `receiver()`. Delivery is best-effort: anything published while
 * the underlying connection is down is lost. Dropping the subscription tells the
 * producing side to stop.
 */
#[derive(Debug)]
pub struct Subscription {
    rx: cbc::Receiver<String>,
    closed: Arc<AtomicBool>,
}

impl Subscription {
    pub fn new(rx: cbc::Receiver<String>, closed: Arc<AtomicBool>) -> Subscription {
        Subscription { rx, closed }
    }

    pub fn receiver(&self) -> &cbc::Receiver<String> {
        &self.rx
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/***************************************/
/*             Public API              */
/***************************************/

/// Durable request queue with consumer groups plus lossy broadcast channels.
pub trait MessageBus: Send {
    /// Creates the consumer group if it does not exist yet.
    fn ensure_group(&mut self, queue: &str, group: &str) -> Result<(), BusError>;

    fn enqueue(&mut self, queue: &str, message: &str) -> Result<String, BusError>;

    /// Blocks up to `block_timeout` for the next message of `group`.
    ///
    /// Messages delivered earlier but never acknowledged are handed out again once
    /// they have been idle for the bus' redelivery window.
    fn consume(
        &mut self,
        queue: &str,
        group: &str,
        consumer: &str,
        block_timeout: Duration,
    ) -> Result<Option<Delivery>, BusError>;

    fn ack(&mut self, queue: &str, group: &str, ack_token: &str) -> Result<(), BusError>;

    /// Fire-and-forget broadcast. Succeeds even when nobody listens.
    fn publish(&mut self, channel: &str, message: &str) -> Result<(), BusError>;

    fn subscribe(&mut self, channel: &str) -> Result<Subscription, BusError>;
}

/// Keyed `ElevatorId -> ElevatorState` table. No cross-key transactions.
pub trait StateStore: Send {
    fn get_state(&mut self, id: ElevatorId) -> Result<Option<ElevatorState>, BusError>;

    fn put_state(&mut self, id: ElevatorId, state: &ElevatorState) -> Result<(), BusError>;

    /// States of `ids` that exist and decode. Any other failure aborts the whole read.
    fn list_states(&mut self, ids: &[ElevatorId]) -> Result<Vec<ElevatorState>, BusError> {
        let mut states = Vec::with_capacity(ids.len());
        for &id in ids {
            match self.get_state(id) {
                Ok(Some(state)) => states.push(state),
                Ok(None) => {}
                Err(BusError::Malformed(reason)) => {
                    warn!("unreadable_state: elevator_id={}, {}", id, reason)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(states)
    }
}
