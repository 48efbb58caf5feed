//! Core domain types
//!
//! This module contains the structures every COINSTAC node agrees on: the
//! pipeline specification, the computations it references and the run
//! lifecycle. They are shared between the remote aggregator and local
//! participants and carry no runtime behaviour.

pub mod computation;
pub mod pipeline;
pub mod run;
