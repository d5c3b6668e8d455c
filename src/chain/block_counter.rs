//! Block height tracking and wait-for-height primitives

use super::client::ChainClient;
use crate::error::{ChainError, ChainResult};
use crate::metrics;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument, Span};

/// Tracks the latest block height seen by a node
pub struct BlockCounter {
    latest: watch::Receiver<u64>,
    span: Span,
}

impl BlockCounter {
    /// Fetch the current height and keep polling the node every `poll_interval`
    /// until `cancel` fires or the counter is dropped.
    pub async fn start<C>(
        client: Arc<C>,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> ChainResult<Self>
    where
        C: ChainClient + ?Sized + 'static,
    {
        Self::start_with_span(client, poll_interval, cancel, info_span!("block_counter")).await
    }

    pub async fn start_with_span<C>(
        client: Arc<C>,
        poll_interval: Duration,
        cancel: CancellationToken,
        span: Span,
    ) -> ChainResult<Self>
    where
        C: ChainClient + ?Sized + 'static,
    {
        let initial = client.block_number().await?;
        metrics::record_block_height(initial);
        let (tx, rx) = watch::channel(initial);

        tokio::spawn(poll_heights(client, poll_interval, tx, cancel).instrument(span.clone()));

        Ok(Self { latest: rx, span })
    }

    pub fn current_block(&self) -> u64 {
        *self.latest.borrow()
    }

    /// Receiver that observes every height change
    pub fn watch_blocks(&self) -> watch::Receiver<u64> {
        self.latest.clone()
    }

    /// Resolve once the chain reaches `height`, returning the height observed
    pub async fn wait_for_block_height(&self, height: u64) -> ChainResult<u64> {
        let mut latest = self.latest.clone();
        let reached = latest
            .wait_for(|current| *current >= height)
            .await
            .map(|current| *current)
            .map_err(|_| ChainError::Internal("Block counter stopped".to_string()))?;

        let _guard = self.span.enter();
        debug!("Reached block {} (waited for {})", reached, height);
        Ok(reached)
    }

    /// Channel that fires once the chain reaches `height`.
    ///
    /// The sender is dropped without a value if the counter stops first.
    pub fn block_height_waiter(&self, height: u64) -> oneshot::Receiver<u64> {
        let (tx, rx) = oneshot::channel();
        let mut latest = self.latest.clone();

        tokio::spawn(async move {
            if let Ok(current) = latest.wait_for(|current| *current >= height).await {
                let _ = tx.send(*current);
            }
        });

        rx
    }

    /// Resolve once `block` is buried under `depth` further blocks
    pub async fn wait_for_confirmations(&self, block: u64, depth: u64) -> ChainResult<u64> {
        self.wait_for_block_height(block.saturating_add(depth)).await
    }
}

async fn poll_heights<C>(
    client: Arc<C>,
    poll_interval: Duration,
    tx: watch::Sender<u64>,
    cancel: CancellationToken,
) where
    C: ChainClient + ?Sized,
{
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tx.closed() => break,
            _ = ticker.tick() => {}
        }

        match client.block_number().await {
            Ok(height) => {
                // Heights only move forward; a lagging node must not rewind waiters
                let advanced = tx.send_if_modified(|current| {
                    if height > *current {
                        *current = height;
                        true
                    } else {
                        false
                    }
                });
                if advanced {
                    metrics::record_block_height(height);
                }
            }
            Err(e) => warn!("Failed to get block number: {}", e),
        }
    }

    debug!("Block counter stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::client::MockChainClient;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn chain_at(height: Arc<AtomicU64>) -> Arc<MockChainClient> {
        let mut client = MockChainClient::new();
        client
            .expect_block_number()
            .returning(move || Ok(height.load(Ordering::SeqCst)));
        Arc::new(client)
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_confirmations() {
        let height = Arc::new(AtomicU64::new(100));
        let cancel = CancellationToken::new();
        let counter = BlockCounter::start(chain_at(height.clone()), Duration::from_secs(1), cancel.clone())
            .await
            .unwrap();

        assert_eq!(counter.current_block(), 100);
        let waiter = counter.block_height_waiter(103);

        let setter = tokio::spawn({
            let height = height.clone();
            async move {
                for h in 101..=104 {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    height.store(h, Ordering::SeqCst);
                }
            }
        });

        let reached = counter.wait_for_confirmations(100, 3).await.unwrap();
        assert!(reached >= 103);
        assert!(waiter.await.unwrap() >= 103);

        setter.await.unwrap();
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_height_never_moves_backwards() {
        let height = Arc::new(AtomicU64::new(50));
        let cancel = CancellationToken::new();
        let counter = BlockCounter::start(chain_at(height.clone()), Duration::from_secs(1), cancel.clone())
            .await
            .unwrap();

        height.store(40, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(counter.current_block(), 50);

        height.store(60, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(counter.current_block(), 60);

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_fail_after_stop() {
        let height = Arc::new(AtomicU64::new(1));
        let cancel = CancellationToken::new();
        let counter = BlockCounter::start(chain_at(height), Duration::from_secs(1), cancel.clone())
            .await
            .unwrap();

        let waiter = counter.block_height_waiter(10);
        cancel.cancel();

        assert!(counter.wait_for_block_height(10).await.is_err());
        assert!(waiter.await.is_err());
    }
}
