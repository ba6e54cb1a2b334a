//! Broker service library crate.
//!
//! # Purpose
//! Hosts the message kernel as a process: configuration, the admin HTTP
//! surface with tracing and metrics, and the background transaction sweeper.
pub mod config;
pub mod observability;
pub mod sweeper;

#[cfg(test)]
mod test_support;
