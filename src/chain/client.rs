//! Chain RPC surface consumed by the rest of the library, with an `ethers` adapter

use crate::error::{ChainError, ChainResult};
use crate::subscription::TaskSubscription;

use async_trait::async_trait;
use ethers::providers::{JsonRpcClient, Middleware, Provider, PubsubClient};
use ethers::types::{Address, Block, BlockNumber, Bytes, TransactionReceipt, H256, U256};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Minimal view of a block header
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: Option<H256>,
    /// Absent on chains or blocks predating EIP-1559
    pub base_fee_per_gas: Option<U256>,
}

impl From<&Block<H256>> for BlockHeader {
    fn from(block: &Block<H256>) -> Self {
        Self {
            number: block.number.map(|n| n.as_u64()).unwrap_or_default(),
            hash: block.hash,
            base_fee_per_gas: block.base_fee_per_gas,
        }
    }
}

/// Receipt of a mined transaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Receipt {
    pub transaction_hash: H256,
    pub block_number: Option<u64>,
    pub status: Option<u64>,
    pub gas_used: Option<U256>,
    pub effective_gas_price: Option<U256>,
}

impl Receipt {
    pub fn succeeded(&self) -> bool {
        self.status == Some(1)
    }
}

impl From<TransactionReceipt> for Receipt {
    fn from(receipt: TransactionReceipt) -> Self {
        Self {
            transaction_hash: receipt.transaction_hash,
            block_number: receipt.block_number.map(|n| n.as_u64()),
            status: receipt.status.map(|s| s.as_u64()),
            gas_used: receipt.gas_used,
            effective_gas_price: receipt.effective_gas_price,
        }
    }
}

/// Request/response RPC operations against an ETH-like node
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn block_number(&self) -> ChainResult<u64>;

    async fn latest_block(&self) -> ChainResult<BlockHeader>;

    /// Next nonce for the account as seen by the node, pending transactions included
    async fn pending_nonce_at(&self, account: Address) -> ChainResult<u64>;

    /// `Ok(None)` means the transaction is not mined yet
    async fn transaction_receipt(&self, tx_hash: H256) -> ChainResult<Option<Receipt>>;

    async fn suggest_gas_price(&self) -> ChainResult<U256>;

    async fn balance_at(&self, account: Address) -> ChainResult<U256>;

    async fn send_raw_transaction(&self, raw: Bytes) -> ChainResult<H256>;
}

/// Push-based new head notifications
#[async_trait]
pub trait HeadSubscriber: Send + Sync {
    /// Stream new heads into `sink` until the returned subscription ends
    async fn subscribe_new_heads(
        &self,
        sink: mpsc::Sender<BlockHeader>,
    ) -> ChainResult<TaskSubscription>;
}

#[async_trait]
impl<T: ChainClient + ?Sized> ChainClient for Arc<T> {
    async fn block_number(&self) -> ChainResult<u64> {
        (**self).block_number().await
    }

    async fn latest_block(&self) -> ChainResult<BlockHeader> {
        (**self).latest_block().await
    }

    async fn pending_nonce_at(&self, account: Address) -> ChainResult<u64> {
        (**self).pending_nonce_at(account).await
    }

    async fn transaction_receipt(&self, tx_hash: H256) -> ChainResult<Option<Receipt>> {
        (**self).transaction_receipt(tx_hash).await
    }

    async fn suggest_gas_price(&self) -> ChainResult<U256> {
        (**self).suggest_gas_price().await
    }

    async fn balance_at(&self, account: Address) -> ChainResult<U256> {
        (**self).balance_at(account).await
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> ChainResult<H256> {
        (**self).send_raw_transaction(raw).await
    }
}

/// `ChainClient` backed by an `ethers` provider
pub struct EthersClient<P> {
    provider: Arc<Provider<P>>,
}

impl<P> Clone for EthersClient<P> {
    fn clone(&self) -> Self {
        Self {
            provider: self.provider.clone(),
        }
    }
}

impl<P: JsonRpcClient> EthersClient<P> {
    pub fn new(provider: Provider<P>) -> Self {
        Self {
            provider: Arc::new(provider),
        }
    }

    /// Underlying provider, for calls outside the `ChainClient` surface
    pub fn provider(&self) -> &Provider<P> {
        &self.provider
    }
}

#[async_trait]
impl<P: JsonRpcClient + 'static> ChainClient for EthersClient<P> {
    async fn block_number(&self) -> ChainResult<u64> {
        self.provider
            .get_block_number()
            .await
            .map(|n| n.as_u64())
            .map_err(|e| ChainError::rpc("eth_blockNumber", e))
    }

    async fn latest_block(&self) -> ChainResult<BlockHeader> {
        let block = self
            .provider
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| ChainError::rpc("eth_getBlockByNumber", e))?
            .ok_or_else(|| ChainError::rpc("eth_getBlockByNumber", "No latest block"))?;

        Ok(BlockHeader::from(&block))
    }

    async fn pending_nonce_at(&self, account: Address) -> ChainResult<u64> {
        let nonce = self
            .provider
            .get_transaction_count(account, Some(BlockNumber::Pending.into()))
            .await
            .map_err(|e| ChainError::rpc("eth_getTransactionCount", e))?;

        Ok(nonce.as_u64())
    }

    async fn transaction_receipt(&self, tx_hash: H256) -> ChainResult<Option<Receipt>> {
        self.provider
            .get_transaction_receipt(tx_hash)
            .await
            .map(|r| r.map(Receipt::from))
            .map_err(|e| ChainError::rpc("eth_getTransactionReceipt", e))
    }

    async fn suggest_gas_price(&self) -> ChainResult<U256> {
        self.provider
            .get_gas_price()
            .await
            .map_err(|e| ChainError::rpc("eth_gasPrice", e))
    }

    async fn balance_at(&self, account: Address) -> ChainResult<U256> {
        self.provider
            .get_balance(account, None)
            .await
            .map_err(|e| ChainError::rpc("eth_getBalance", e))
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> ChainResult<H256> {
        let pending = self
            .provider
            .send_raw_transaction(raw)
            .await
            .map_err(|e| ChainError::rpc("eth_sendRawTransaction", e))?;

        Ok(pending.tx_hash())
    }
}

#[async_trait]
impl<P: PubsubClient + 'static> HeadSubscriber for EthersClient<P> {
    async fn subscribe_new_heads(
        &self,
        sink: mpsc::Sender<BlockHeader>,
    ) -> ChainResult<TaskSubscription> {
        let provider = self.provider.clone();
        let (ready_tx, ready_rx) = oneshot::channel();

        let subscription = TaskSubscription::spawn(move |cancel| async move {
            let stream = match provider.subscribe_blocks().await {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    // The error is handed to the caller, not to the subscription
                    let _ = ready_tx.send(Err(ChainError::rpc("eth_subscribe", e)));
                    return Ok(());
                }
            };
            tokio::pin!(stream);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    block = stream.next() => match block {
                        Some(block) => {
                            let header = BlockHeader::from(&block);
                            debug!("New head {}", header.number);
                            if sink.send(header).await.is_err() {
                                debug!("Head receiver dropped, ending subscription");
                                return Ok(());
                            }
                        }
                        None => {
                            warn!("New heads stream ended");
                            return Err(ChainError::SubscriptionClosed);
                        }
                    }
                }
            }
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok(subscription),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ChainError::Internal(
                "Head subscription task ended before reporting readiness".to_string(),
            )),
        }
    }
}
