//! Lottery round watchdog.
//!
//! Polls the lottery contract, closes expired rounds that sold tickets by
//! calling `endRound()`, and reports its state over HTTP. The binary in
//! `main.rs` wires these modules together; integration tests drive them
//! against `chain::MockChainClient`.

pub mod api;
pub mod chain;
pub mod clock;
pub mod config;
pub mod context;
pub mod guard;
pub mod health;
pub mod monitor;
pub mod scheduler;
pub mod submitter;
