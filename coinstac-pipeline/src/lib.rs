//! COINSTAC Pipeline
//!
//! The engine that runs decentralized COINSTAC pipelines on one node.
//!
//! Architecture:
//! - Manager: registry of active runs, start/stop/suspend, state streams
//! - Pipeline: executes a specification's steps in order against a cache
//! - Controllers: decide per iteration whether a step repeats, waits or is done
//! - Plugins: typed hooks selected per step (group-step synchronisation)
//! - Driver: runs one computation and parses its output
//! - Transport: exchanges results between participants and the aggregator
//!
//! A node is either a local participant or the remote aggregator; a
//! decentralized run is one manager of each kind sharing a transport.

pub mod cache;
pub mod config;
pub mod context;
pub mod controller;
pub mod driver;
pub mod error;
pub mod manager;
pub mod pipeline;
pub mod plugin;
pub mod transport;
pub mod validation;

pub use cache::{Cache, CacheError};
pub use config::ManagerConfig;
pub use driver::{ComputationOutput, ContainerDriver, Invocation, PodmanDriver};
pub use error::{PipelineError, Result};
pub use manager::{ManagerState, PipelineManager, RunHandle, RunResult, ShutdownMode, StartRequest};
pub use transport::{MemoryBroker, MemoryTransport, Transport};
