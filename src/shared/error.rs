/***************************************/
/*        3rd party libraries          */
/***************************************/
use thiserror::Error;

/***************************************/
/*       Public data structures        */
/***************************************/
#[derive(Debug, Error)]
pub enum BusError {
    /// Network hiccup or timeout, worth retrying.
    #[error("transient bus error: {0}")]
    Transient(String),

    /// Payload violates the message schema. Never retried.
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("state store unavailable: {0}")]
    StateStoreUnavailable(String),

    /// The broker rejected the call for a reason retrying will not fix.
    #[error("bus protocol error: {0}")]
    Protocol(String),

    #[error("bus connection lost during {operation} after {attempts} attempts: {source}")]
    ConnectionLost {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: Box<BusError>,
    },
}

impl BusError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BusError::Transient(_) | BusError::StateStoreUnavailable(_))
    }
}
