//! COINSTAC Core
//!
//! Core types for decentralized COINSTAC pipelines.
//!
//! This crate contains:
//! - Domain types: pipeline specifications, computations, run lifecycle
//! - DTOs: wire messages and state snapshots

pub mod domain;
pub mod dto;
