//! Waits for transactions to be mined and escalates fees of stuck ones
//!
//! A stuck transaction is replaced (same nonce) with a higher priced one every
//! `check_interval` until it is mined or the price ceiling is reached:
//! - Legacy transactions raise the gas price by 20%
//! - Dynamic fee transactions raise the tip by 20% and rebuild the fee cap from
//!   the latest base fee, never bumping it by less than 10%

use super::gas::{escalate_dynamic, escalate_legacy, DynamicEscalation, GasPrice};
use super::{GasOptions, PendingTransaction};
use crate::chain::{ChainClient, Receipt};
use crate::config::MiningConfig;
use crate::error::{ChainError, ChainResult};
use crate::metrics;

use ethers::types::U256;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

/// How often the node is asked for a receipt while waiting
pub const DEFAULT_RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Why a waiter stopped escalating without seeing the transaction mined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    /// The submitted transaction was already priced at or above the ceiling
    OriginalAtCeiling,
    /// The last replacement was priced at the ceiling and still not mined
    CeilingReached,
    /// The ceiling is below the minimum fee cap a replacement needs
    FloorAboveCeiling,
}

impl GiveUpReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            GiveUpReason::OriginalAtCeiling => "original_at_ceiling",
            GiveUpReason::CeilingReached => "ceiling_reached",
            GiveUpReason::FloorAboveCeiling => "floor_above_ceiling",
        }
    }
}

/// Final state of `force_mining`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MiningOutcome {
    /// `transaction` is the submission that got mined
    Mined {
        transaction: PendingTransaction,
        receipt: Receipt,
    },
    /// Escalation stopped; `last` is the latest broadcast and may still be mined later
    GaveUp {
        reason: GiveUpReason,
        last: PendingTransaction,
    },
}

enum Escalation {
    Resubmit(GasPrice),
    GiveUp(GiveUpReason),
}

/// Drives a transaction to inclusion by resubmitting it with escalating fees
pub struct MiningWaiter<C> {
    client: C,
    check_interval: Duration,
    max_gas_price: U256,
    receipt_poll_interval: Duration,
    span: Span,
}

impl<C: ChainClient> MiningWaiter<C> {
    /// `max_gas_price` caps the legacy gas price and the dynamic fee cap alike
    pub fn new(client: C, check_interval: Duration, max_gas_price: U256) -> Self {
        Self {
            client,
            check_interval,
            max_gas_price,
            receipt_poll_interval: DEFAULT_RECEIPT_POLL_INTERVAL,
            span: info_span!("mining_waiter"),
        }
    }

    pub fn from_config(client: C, config: &MiningConfig) -> Self {
        Self::new(client, config.check_interval(), config.max_gas_price())
            .with_receipt_poll_interval(config.receipt_poll_interval())
    }

    pub fn with_receipt_poll_interval(mut self, interval: Duration) -> Self {
        self.receipt_poll_interval = interval;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn max_gas_price(&self) -> U256 {
        self.max_gas_price
    }

    /// Wait for `original` to be mined, replacing it through `resubmit` with a
    /// higher priced transaction each time `check_interval` passes without a
    /// receipt.
    ///
    /// Receipt lookup failures are logged and polling continues. Reaching the
    /// ceiling is not an error and yields `MiningOutcome::GaveUp`. A failing
    /// `resubmit` stops the waiter with `ChainError::Resubmission`, and a
    /// dynamic fee transaction on a chain without base fee fails with
    /// `ChainError::BaseFeeUnavailable`.
    ///
    /// Runs until an outcome is reached; spawn it on its own task per transaction.
    pub async fn force_mining<F, Fut>(
        &self,
        original: PendingTransaction,
        resubmit: F,
    ) -> ChainResult<MiningOutcome>
    where
        F: FnMut(GasOptions) -> Fut,
        Fut: Future<Output = ChainResult<PendingTransaction>>,
    {
        let span = info_span!(parent: &self.span, "force_mining", tx = ?original.hash(), nonce = %original.nonce());
        self.escalate_until_mined(original, resubmit)
            .instrument(span)
            .await
    }

    async fn escalate_until_mined<F, Fut>(
        &self,
        original: PendingTransaction,
        mut resubmit: F,
    ) -> ChainResult<MiningOutcome>
    where
        F: FnMut(GasOptions) -> Fut,
        Fut: Future<Output = ChainResult<PendingTransaction>>,
    {
        let original_price = match original.gas_price() {
            GasPrice::Legacy(price) => *price,
            GasPrice::Eip1559 { max_fee_per_gas, .. } => *max_fee_per_gas,
        };
        if original_price >= self.max_gas_price {
            info!(
                "Original {} price {} already at or above ceiling {}, not escalating",
                original.gas_price().kind(),
                original_price,
                self.max_gas_price
            );
            return Ok(self.give_up(GiveUpReason::OriginalAtCeiling, original));
        }

        let nonce = original.nonce();
        let gas_limit = original.gas_limit();
        let mut transaction = original;

        loop {
            if let Some(receipt) = self.wait_for_receipt(&transaction).await {
                info!(
                    "Transaction {:?} mined in block {:?}",
                    transaction.hash(),
                    receipt.block_number
                );
                metrics::record_mined();
                return Ok(MiningOutcome::Mined {
                    transaction,
                    receipt,
                });
            }

            if transaction.gas_price().ceiling_price() >= self.max_gas_price {
                warn!(
                    "Transaction {:?} not mined and price already at ceiling {}",
                    transaction.hash(),
                    self.max_gas_price
                );
                return Ok(self.give_up(GiveUpReason::CeilingReached, transaction));
            }

            let gas_price = match self.next_gas_price(transaction.gas_price()).await? {
                Escalation::Resubmit(gas_price) => gas_price,
                Escalation::GiveUp(reason) => return Ok(self.give_up(reason, transaction)),
            };

            info!(
                "Transaction {:?} not mined within {:?}, resubmitting with {:?} (max cost {} wei)",
                transaction.hash(),
                self.check_interval,
                gas_price,
                gas_price.max_cost(gas_limit)
            );
            metrics::record_escalation(gas_price.kind());

            let options = GasOptions {
                nonce,
                gas_limit,
                gas_price,
            };
            let replacement = match resubmit(options).await {
                Ok(replacement) => replacement,
                Err(e) => {
                    error!("Failed to resubmit transaction {:?}: {}", transaction.hash(), e);
                    metrics::record_give_up("resubmission_failed");
                    return Err(match e {
                        ChainError::Resubmission(_) => e,
                        other => ChainError::Resubmission(other.to_string()),
                    });
                }
            };

            if replacement.nonce() != nonce {
                warn!(
                    "Replacement {:?} uses nonce {} instead of {}",
                    replacement.hash(),
                    replacement.nonce(),
                    nonce
                );
            }
            debug!(
                "Replaced {:?} with {:?}",
                transaction.hash(),
                replacement.hash()
            );
            transaction = replacement;
        }
    }

    /// Poll for a receipt until one shows up or `check_interval` passes
    async fn wait_for_receipt(&self, transaction: &PendingTransaction) -> Option<Receipt> {
        let poll = async {
            let mut ticker = tokio::time::interval(self.receipt_poll_interval);
            loop {
                ticker.tick().await;
                match self.client.transaction_receipt(transaction.hash()).await {
                    Ok(Some(receipt)) => return receipt,
                    Ok(None) => debug!("Transaction {:?} not mined yet", transaction.hash()),
                    Err(e) => warn!(
                        "Failed to get receipt for {:?}: {}",
                        transaction.hash(),
                        e
                    ),
                }
            }
        };

        tokio::time::timeout(self.check_interval, poll).await.ok()
    }

    async fn next_gas_price(&self, current: &GasPrice) -> ChainResult<Escalation> {
        match current {
            GasPrice::Legacy(price) => Ok(Escalation::Resubmit(GasPrice::Legacy(escalate_legacy(
                *price,
                self.max_gas_price,
            )))),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let block = self.client.latest_block().await?;
                let base_fee = block.base_fee_per_gas.ok_or_else(|| {
                    error!("Block {} has no base fee, cannot escalate dynamic fee", block.number);
                    ChainError::BaseFeeUnavailable
                })?;

                match escalate_dynamic(
                    *max_fee_per_gas,
                    *max_priority_fee_per_gas,
                    base_fee,
                    self.max_gas_price,
                ) {
                    DynamicEscalation::Bump {
                        max_fee_per_gas,
                        max_priority_fee_per_gas,
                    } => Ok(Escalation::Resubmit(GasPrice::Eip1559 {
                        max_fee_per_gas,
                        max_priority_fee_per_gas,
                    })),
                    DynamicEscalation::FloorAboveCeiling { floor } => {
                        warn!(
                            "Replacement needs a fee cap of at least {} but the ceiling is {}",
                            floor, self.max_gas_price
                        );
                        Ok(Escalation::GiveUp(GiveUpReason::FloorAboveCeiling))
                    }
                }
            }
        }
    }

    fn give_up(&self, reason: GiveUpReason, last: PendingTransaction) -> MiningOutcome {
        info!("Giving up on escalating {:?}: {}", last.hash(), reason.as_str());
        metrics::record_give_up(reason.as_str());
        MiningOutcome::GaveUp { reason, last }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::client::MockChainClient;
    use crate::chain::BlockHeader;
    use ethers::types::H256;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    const CHECK_INTERVAL: Duration = Duration::from_secs(60);

    fn gwei(n: u64) -> U256 {
        U256::from(n) * U256::exp10(9)
    }

    fn mwei(n: u64) -> U256 {
        U256::from(n) * U256::exp10(6)
    }

    fn hash(n: u64) -> H256 {
        H256::from_low_u64_be(n)
    }

    /// Records every request; the n-th replacement gets hash n + 1
    fn recording_resubmit(
        calls: Arc<Mutex<Vec<GasOptions>>>,
    ) -> impl FnMut(GasOptions) -> futures::future::Ready<ChainResult<PendingTransaction>> {
        move |options| {
            let mut calls = calls.lock().unwrap();
            calls.push(options);
            let tx = PendingTransaction::new(
                hash(calls.len() as u64 + 1),
                options.nonce,
                options.gas_limit,
                options.gas_price,
            );
            futures::future::ready(Ok(tx))
        }
    }

    /// Chain that mines `mined` (if any) and reports `base_fee` on the latest block
    fn chain(mined: Option<H256>, base_fee: Option<U256>) -> MockChainClient {
        let mut client = MockChainClient::new();
        client.expect_transaction_receipt().returning(move |tx_hash| {
            Ok((Some(tx_hash) == mined).then(|| Receipt {
                transaction_hash: tx_hash,
                block_number: Some(42),
                status: Some(1),
                ..Default::default()
            }))
        });
        client.expect_latest_block().returning(move || {
            Ok(BlockHeader {
                number: 42,
                hash: None,
                base_fee_per_gas: base_fee,
            })
        });
        client
    }

    fn legacy(price: U256) -> PendingTransaction {
        PendingTransaction::new(hash(1), 9u64, 21_000u64, GasPrice::Legacy(price))
    }

    fn dynamic(fee_cap: U256, tip: U256) -> PendingTransaction {
        PendingTransaction::new(
            hash(1),
            9u64,
            21_000u64,
            GasPrice::Eip1559 {
                max_fee_per_gas: fee_cap,
                max_priority_fee_per_gas: tip,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_legacy_escalates_by_a_fifth_up_to_ceiling() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let waiter = MiningWaiter::new(chain(None, None), CHECK_INTERVAL, gwei(45));

        let outcome = waiter
            .force_mining(legacy(gwei(20)), recording_resubmit(calls.clone()))
            .await
            .unwrap();

        let prices: Vec<U256> = calls
            .lock()
            .unwrap()
            .iter()
            .map(|options| options.gas_price.ceiling_price())
            .collect();
        assert_eq!(
            prices,
            vec![gwei(24), mwei(28_800), mwei(34_560), mwei(41_472), gwei(45)]
        );

        match outcome {
            MiningOutcome::GaveUp { reason, last } => {
                assert_eq!(reason, GiveUpReason::CeilingReached);
                assert_eq!(last.hash(), hash(6));
                assert_eq!(*last.gas_price(), GasPrice::Legacy(gwei(45)));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tiny_legacy_price_still_reaches_ceiling() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let waiter = MiningWaiter::new(chain(None, None), CHECK_INTERVAL, U256::from(10));

        let outcome = waiter
            .force_mining(legacy(U256::from(3)), recording_resubmit(calls.clone()))
            .await
            .unwrap();

        let prices: Vec<u64> = calls
            .lock()
            .unwrap()
            .iter()
            .map(|options| options.gas_price.ceiling_price().as_u64())
            .collect();
        assert_eq!(prices, vec![4, 5, 6, 7, 8, 10]);

        match outcome {
            MiningOutcome::GaveUp { reason, last } => {
                assert_eq!(reason, GiveUpReason::CeilingReached);
                assert_eq!(last.hash(), hash(7));
                assert_eq!(*last.gas_price(), GasPrice::Legacy(U256::from(10)));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_escalates_only_after_check_interval_without_receipt() {
        const RECEIPT_POLL: Duration = Duration::from_secs(5);

        let lookups = Arc::new(AtomicUsize::new(0));
        let mut client = MockChainClient::new();
        client.expect_transaction_receipt().returning({
            let lookups = lookups.clone();
            move |_| {
                lookups.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
        });

        let resubmitted_at = Arc::new(Mutex::new(Vec::new()));
        let waiter = MiningWaiter::new(client, CHECK_INTERVAL, gwei(30))
            .with_receipt_poll_interval(RECEIPT_POLL);
        let start = tokio::time::Instant::now();

        let outcome = waiter
            .force_mining(legacy(gwei(20)), {
                let resubmitted_at = resubmitted_at.clone();
                let mut replacements = 0u64;
                move |options: GasOptions| {
                    resubmitted_at.lock().unwrap().push(tokio::time::Instant::now());
                    replacements += 1;
                    futures::future::ready(Ok(PendingTransaction::new(
                        hash(replacements + 1),
                        options.nonce,
                        options.gas_limit,
                        options.gas_price,
                    )))
                }
            })
            .await
            .unwrap();
        let finished = start.elapsed();

        // 24, 28.8 and then 30 gwei, one per window, and a last window at the ceiling
        let resubmitted_at = resubmitted_at.lock().unwrap();
        assert_eq!(resubmitted_at.len(), 3);
        let first = resubmitted_at[0].duration_since(start);
        assert!(first >= CHECK_INTERVAL, "escalated after {:?}", first);
        assert!(first < CHECK_INTERVAL + RECEIPT_POLL, "escalated after {:?}", first);
        for pair in resubmitted_at.windows(2) {
            let gap = pair[1].duration_since(pair[0]);
            assert!(gap >= CHECK_INTERVAL, "escalations {:?} apart", gap);
            assert!(gap < CHECK_INTERVAL + RECEIPT_POLL, "escalations {:?} apart", gap);
        }
        assert!(finished >= CHECK_INTERVAL * 4);
        assert!(matches!(
            outcome,
            MiningOutcome::GaveUp {
                reason: GiveUpReason::CeilingReached,
                ..
            }
        ));

        // One lookup per receipt poll tick, 12 or 13 per window
        let lookups = lookups.load(Ordering::SeqCst);
        assert!((48..=52).contains(&lookups), "{} receipt lookups", lookups);
    }

    #[tokio::test(start_paused = true)]
    async fn test_original_at_ceiling_is_never_escalated() {
        let mut client = MockChainClient::new();
        client.expect_transaction_receipt().times(0);
        client.expect_latest_block().times(0);
        let waiter = MiningWaiter::new(client, CHECK_INTERVAL, gwei(45));

        for original in [legacy(gwei(45)), legacy(gwei(50)), dynamic(gwei(45), gwei(2))] {
            let calls = Arc::new(Mutex::new(Vec::new()));
            let outcome = waiter
                .force_mining(original.clone(), recording_resubmit(calls.clone()))
                .await
                .unwrap();

            assert!(calls.lock().unwrap().is_empty());
            assert_eq!(
                outcome,
                MiningOutcome::GaveUp {
                    reason: GiveUpReason::OriginalAtCeiling,
                    last: original,
                }
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_once_replacement_is_mined() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let waiter = MiningWaiter::new(chain(Some(hash(3)), None), CHECK_INTERVAL, gwei(500));

        let outcome = waiter
            .force_mining(legacy(gwei(20)), recording_resubmit(calls.clone()))
            .await
            .unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls
            .iter()
            .all(|options| options.nonce == U256::from(9) && options.gas_limit == U256::from(21_000)));

        match outcome {
            MiningOutcome::Mined { transaction, receipt } => {
                assert_eq!(transaction.hash(), hash(3));
                assert_eq!(receipt.transaction_hash, hash(3));
                assert!(receipt.succeeded());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_receipt_errors_are_tolerated() {
        let lookups = Arc::new(AtomicUsize::new(0));
        let mut client = MockChainClient::new();
        client.expect_transaction_receipt().returning({
            let lookups = lookups.clone();
            move |tx_hash| {
                if lookups.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(ChainError::rpc("eth_getTransactionReceipt", "bad gateway"))
                } else {
                    Ok(Some(Receipt {
                        transaction_hash: tx_hash,
                        status: Some(1),
                        ..Default::default()
                    }))
                }
            }
        });

        let calls = Arc::new(Mutex::new(Vec::new()));
        let waiter = MiningWaiter::new(client, CHECK_INTERVAL, gwei(45));
        let outcome = waiter
            .force_mining(legacy(gwei(20)), recording_resubmit(calls.clone()))
            .await
            .unwrap();

        assert!(matches!(outcome, MiningOutcome::Mined { .. }));
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(lookups.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dynamic_fee_cap_never_below_floor() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        // Base fee of 1 gwei keeps 2 * base + tip far below the 1.1x floor
        let waiter = MiningWaiter::new(chain(Some(hash(4)), Some(gwei(1))), CHECK_INTERVAL, gwei(1_000));

        let outcome = waiter
            .force_mining(dynamic(gwei(100), gwei(2)), recording_resubmit(calls.clone()))
            .await
            .unwrap();
        assert!(matches!(outcome, MiningOutcome::Mined { .. }));

        let fees: Vec<GasPrice> = calls
            .lock()
            .unwrap()
            .iter()
            .map(|options| options.gas_price)
            .collect();
        assert_eq!(
            fees,
            vec![
                GasPrice::Eip1559 {
                    max_fee_per_gas: gwei(110),
                    max_priority_fee_per_gas: mwei(2_400),
                },
                GasPrice::Eip1559 {
                    max_fee_per_gas: gwei(121),
                    max_priority_fee_per_gas: mwei(2_880),
                },
                GasPrice::Eip1559 {
                    max_fee_per_gas: mwei(133_100),
                    max_priority_fee_per_gas: U256::from(3_456_000_000u64),
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dynamic_gives_up_when_floor_exceeds_ceiling() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let waiter = MiningWaiter::new(chain(None, Some(gwei(30))), CHECK_INTERVAL, gwei(105));

        let outcome = waiter
            .force_mining(dynamic(gwei(100), gwei(2)), recording_resubmit(calls.clone()))
            .await
            .unwrap();

        assert!(calls.lock().unwrap().is_empty());
        assert!(matches!(
            outcome,
            MiningOutcome::GaveUp {
                reason: GiveUpReason::FloorAboveCeiling,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_base_fee_is_fatal() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let waiter = MiningWaiter::new(chain(None, None), CHECK_INTERVAL, gwei(1_000));

        let err = waiter
            .force_mining(dynamic(gwei(100), gwei(2)), recording_resubmit(calls.clone()))
            .await
            .unwrap_err();

        assert!(matches!(err, ChainError::BaseFeeUnavailable));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_resubmission_stops_waiter() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let waiter = MiningWaiter::new(chain(None, None), CHECK_INTERVAL, gwei(45));

        let err = waiter
            .force_mining(legacy(gwei(20)), {
                let attempts = attempts.clone();
                move |_| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async { Err(ChainError::rpc("eth_sendRawTransaction", "replacement underpriced")) }
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ChainError::Resubmission(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
