//! Outbound RPC pacing and concurrency bounding

use super::client::{BlockHeader, ChainClient, HeadSubscriber, Receipt};
use crate::config::RateLimitConfig;
use crate::error::{ChainError, ChainResult};
use crate::metrics;
use crate::subscription::TaskSubscription;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota,
};
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info_span, warn, Instrument, Span};

/// Default time `acquire_permit` waits before failing
pub const DEFAULT_ACQUIRE_PERMIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

type DirectLimiter = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Right to issue one outbound call.
///
/// Dropping the permit releases its concurrency slot, so holding it for the
/// duration of the call releases it on both the success and the failure path.
#[derive(Debug)]
pub struct Permit {
    _slot: Option<OwnedSemaphorePermit>,
}

impl Permit {
    /// Give the concurrency slot back
    pub fn release(self) {}
}

impl Drop for Permit {
    fn drop(&mut self) {
        metrics::RPC_IN_FLIGHT.dec();
    }
}

/// Bounds requests per second and simultaneous in-flight calls.
///
/// Either control is disabled when its limit is zero.
pub struct RateLimiter {
    limiter: Option<DirectLimiter>,
    semaphore: Option<Arc<Semaphore>>,
    acquire_permit_timeout: Duration,
    span: Span,
}

impl RateLimiter {
    pub fn new(
        requests_per_second: u32,
        concurrency_limit: usize,
        acquire_permit_timeout: Option<Duration>,
    ) -> Self {
        // Burst of one paces calls evenly instead of letting a second's quota through at once
        let limiter = NonZeroU32::new(requests_per_second).map(|rps| {
            let quota = Quota::per_second(rps).allow_burst(NonZeroU32::MIN);
            governor::RateLimiter::direct(quota)
        });

        let semaphore = (concurrency_limit > 0).then(|| Arc::new(Semaphore::new(concurrency_limit)));

        Self {
            limiter,
            semaphore,
            acquire_permit_timeout: acquire_permit_timeout.unwrap_or(DEFAULT_ACQUIRE_PERMIT_TIMEOUT),
            span: info_span!("rate_limiter", requests_per_second, concurrency_limit),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(
            config.requests_per_second,
            config.concurrency_limit,
            config.acquire_permit_timeout(),
        )
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn acquire_permit_timeout(&self) -> Duration {
        self.acquire_permit_timeout
    }

    /// Wait until both the rate limit and the concurrency limit allow one more call.
    ///
    /// Fails with `PermitTimeout` once `acquire_permit_timeout` elapses.
    pub async fn acquire_permit(&self) -> ChainResult<Permit> {
        let acquire = async {
            if let Some(limiter) = &self.limiter {
                limiter.until_ready().await;
            }

            match &self.semaphore {
                Some(semaphore) => semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map(Some)
                    .map_err(|_| ChainError::Internal("Concurrency semaphore closed".to_string())),
                None => Ok(None),
            }
        };

        match tokio::time::timeout(self.acquire_permit_timeout, acquire)
            .instrument(self.span.clone())
            .await
        {
            Ok(slot) => {
                let slot = slot?;
                metrics::RPC_IN_FLIGHT.inc();
                Ok(Permit { _slot: slot })
            }
            Err(_) => {
                let _guard = self.span.enter();
                warn!(
                    "Failed to acquire RPC permit within {:?}",
                    self.acquire_permit_timeout
                );
                metrics::record_permit_timeout();
                Err(ChainError::PermitTimeout {
                    timeout: self.acquire_permit_timeout,
                })
            }
        }
    }

    /// Release a permit obtained from `acquire_permit`
    pub fn release_permit(&self, permit: Permit) {
        permit.release();
    }
}

/// `ChainClient` wrapper that takes a permit around every call
pub struct RateLimitedClient<C> {
    inner: C,
    limiter: Arc<RateLimiter>,
}

impl<C> RateLimitedClient<C> {
    pub fn new(inner: C, limiter: Arc<RateLimiter>) -> Self {
        Self { inner, limiter }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    async fn limited<T, F>(&self, method: &'static str, call: F) -> ChainResult<T>
    where
        F: Future<Output = ChainResult<T>>,
    {
        let permit = self.limiter.acquire_permit().await?;
        metrics::record_rpc_call(method);
        debug!("Calling {}", method);

        let result = call.await;
        permit.release();
        result
    }
}

#[async_trait]
impl<C: ChainClient> ChainClient for RateLimitedClient<C> {
    async fn block_number(&self) -> ChainResult<u64> {
        self.limited("eth_blockNumber", self.inner.block_number())
            .await
    }

    async fn latest_block(&self) -> ChainResult<BlockHeader> {
        self.limited("eth_getBlockByNumber", self.inner.latest_block())
            .await
    }

    async fn pending_nonce_at(&self, account: Address) -> ChainResult<u64> {
        self.limited("eth_getTransactionCount", self.inner.pending_nonce_at(account))
            .await
    }

    async fn transaction_receipt(&self, tx_hash: H256) -> ChainResult<Option<Receipt>> {
        self.limited(
            "eth_getTransactionReceipt",
            self.inner.transaction_receipt(tx_hash),
        )
        .await
    }

    async fn suggest_gas_price(&self) -> ChainResult<U256> {
        self.limited("eth_gasPrice", self.inner.suggest_gas_price())
            .await
    }

    async fn balance_at(&self, account: Address) -> ChainResult<U256> {
        self.limited("eth_getBalance", self.inner.balance_at(account))
            .await
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> ChainResult<H256> {
        self.limited("eth_sendRawTransaction", self.inner.send_raw_transaction(raw))
            .await
    }
}

#[async_trait]
impl<C: HeadSubscriber> HeadSubscriber for RateLimitedClient<C> {
    /// Only establishing the subscription is rate limited, not its lifetime
    async fn subscribe_new_heads(
        &self,
        sink: mpsc::Sender<BlockHeader>,
    ) -> ChainResult<TaskSubscription> {
        self.limited("eth_subscribe", self.inner.subscribe_new_heads(sink))
            .await
    }
}
