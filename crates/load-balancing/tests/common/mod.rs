//! Test infrastructure for the load balancing layer.
//!
//! In-memory nodes, node factories and resolvers that behave like a primary
//! with streaming replicas, plus builders for wiring them together.

#![allow(dead_code)]

pub mod fakes;
pub mod harness;

pub use fakes::*;
pub use harness::*;
