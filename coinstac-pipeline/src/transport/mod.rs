//! Result exchange between participants and the aggregator
//!
//! A transport is bound to one node. Participants publish [`LocalResult`]s
//! that reach the aggregator of the run; the aggregator publishes
//! [`RemoteResult`]s that reach every participant named in them.
//!
//! [`LocalResult`]: coinstac_core::dto::transport::LocalResult
//! [`RemoteResult`]: coinstac_core::dto::transport::RemoteResult

pub mod files;
mod memory;

pub use memory::{MemoryBroker, MemoryTransport};

use async_trait::async_trait;
use coinstac_core::dto::transport::TransportMessage;
use tokio::sync::mpsc;

use crate::error::Result;

/// Messages of one run, in the order they were published
///
/// Bounded: a publisher waits while the receiving run is behind.
pub type Subscription = mpsc::Receiver<TransportMessage>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a message for `run_id`
    async fn publish(&self, run_id: &str, message: TransportMessage) -> Result<()>;

    /// Starts receiving this node's messages for `run_id`
    ///
    /// Messages published before the subscription are delivered first.
    async fn subscribe(&self, run_id: &str) -> Result<Subscription>;

    /// Stops receiving messages for `run_id`
    async fn unsubscribe(&self, run_id: &str) -> Result<()>;

    /// Closes the connection, later calls fail
    async fn close(&self) -> Result<()>;
}
