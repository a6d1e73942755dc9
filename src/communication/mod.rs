//! Broker backed communication between stages.

mod receiver;
mod sender;
#[cfg(test)]
mod receiver_test;
#[cfg(test)]
mod sender_test;

use async_trait::async_trait;

use crate::eof::ClientCounts;
use crate::error::ShutdownResult;
use crate::record::Record;

pub use self::receiver::Receiver;
pub use self::sender::Sender;

/// The outcome of handling a batch of records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchOutcome {
    /// The batch was handled and its outputs published.
    Handled,
    /// The batch had been handled before and was discarded.
    Duplicate,
    /// The batch can not be handled yet and must be redelivered later.
    NotReady,
}

/// A handler of the input of a stage replica.
///
/// Errors returned by a handler are fatal to the replica.
#[async_trait]
pub trait InputHandler: Send + 'static {
    /// Handle a batch of records of a client.
    async fn on_batch(&mut self, client_id: u32, message_id: u64, records: Vec<Record>) -> ShutdownResult<BatchOutcome>;

    /// Flush the processing of a client whose input has ended.
    async fn on_eof(&mut self, client_id: u32) -> ShutdownResult<()>;

    /// The counters of a client.
    fn counts(&self, client_id: u32) -> ClientCounts;

    /// Propagate the end of a client's data downstream, given the stage's reconciled sent count.
    async fn on_drained(&mut self, client_id: u32, messages_sent: u64) -> ShutdownResult<()>;

    /// Drop everything held for a client.
    async fn evict(&mut self, client_id: u32) -> ShutdownResult<()>;
}
