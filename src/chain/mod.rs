//! Chain module - the RPC surface the rest of the library talks through
//!
//! This module provides:
//! - `ChainClient` / `HeadSubscriber` traits with an `ethers` adapter
//! - Rate limiting and concurrency bounding for every outbound call
//! - Block height tracking with wait-for-height primitives

pub mod block_counter;
pub mod client;
pub mod rate_limit;

pub use block_counter::BlockCounter;
pub use client::{BlockHeader, ChainClient, EthersClient, HeadSubscriber, Receipt};
pub use rate_limit::{Permit, RateLimitedClient, RateLimiter, DEFAULT_ACQUIRE_PERMIT_TIMEOUT};
