//! Support library for ETH-like chain clients
//!
//! Wraps an `ethers` provider with nonce management, fee escalation for stuck
//! transactions, rate limiting, resubscription with backoff, time bounded
//! caches, block height tracking and disk persistence.

pub mod cache;
pub mod chain;
pub mod config;
pub mod error;
pub mod metrics;
pub mod persistence;
pub mod subscription;
pub mod tx;

pub use error::{ChainError, ChainResult};
