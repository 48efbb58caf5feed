//! Data Transfer Objects
//!
//! DTOs are the records that leave a pipeline: messages exchanged between
//! participants and the aggregator, and state snapshots published to
//! observers.

pub mod state;
pub mod transport;
