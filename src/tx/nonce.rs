//! Nonce management for reliable transaction submission
//!
//! Reconciles a locally tracked nonce with the pending nonce a node reports:
//! - The node wins when it has seen more transactions than we sent from here
//! - The local value wins while the node lags behind our latest submission

use crate::chain::ChainClient;
use crate::error::ChainResult;
use crate::metrics;

use ethers::types::Address;
use tracing::{debug, info, info_span, Span};

/// Tracks the next nonce for one account.
///
/// Not synchronized: callers submitting concurrently must hold one lock across
/// `current_nonce`, the broadcast and `increment_nonce`, e.g. by keeping the
/// manager inside a `tokio::sync::Mutex`.
pub struct NonceManager<C> {
    client: C,
    account: Address,
    local_nonce: u64,
    span: Span,
}

impl<C: ChainClient> NonceManager<C> {
    /// Create a new nonce manager
    pub fn new(client: C, account: Address) -> Self {
        Self {
            client,
            account,
            local_nonce: 0,
            span: info_span!("nonce_manager", account = ?account),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn account(&self) -> Address {
        self.account
    }

    /// Nonce to use for the next transaction.
    ///
    /// Raises the local value to the node's pending nonce when the node is ahead
    /// and keeps it otherwise. Fails only if the node query fails.
    pub async fn current_nonce(&mut self) -> ChainResult<u64> {
        let pending = self.client.pending_nonce_at(self.account).await?;

        let _guard = self.span.enter();
        if pending > self.local_nonce {
            info!(
                "Local nonce {} behind node pending nonce {}, catching up",
                self.local_nonce, pending
            );
            self.local_nonce = pending;
        } else {
            debug!(
                "Keeping local nonce {} (node pending nonce {})",
                self.local_nonce, pending
            );
        }

        metrics::record_nonce(self.local_nonce);
        Ok(self.local_nonce)
    }

    /// Advance past a nonce that was just handed to the node for broadcast.
    ///
    /// Call exactly once per successful broadcast, never after a failed one.
    pub fn increment_nonce(&mut self) -> u64 {
        self.local_nonce += 1;

        let _guard = self.span.enter();
        debug!("Incremented local nonce to {}", self.local_nonce);
        metrics::record_nonce(self.local_nonce);
        self.local_nonce
    }
}
