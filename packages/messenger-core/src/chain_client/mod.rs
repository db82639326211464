use std::sync::Arc;
use std::time::Duration;

use alloy::rpc::types::Log;
use alloy_primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    config::ChainConfig,
    signer::SigningContext,
    types::{BlockHeader, TxReceipt},
    Error, Result,
};

pub mod evm;

pub use evm::EvmClient;

/// 新区块头订阅流，流结束即表示订阅断开
pub type HeadStream = BoxStream<'static, BlockHeader>;

/// 链客户端特征，定义了中继与一条链交互所需的全部能力
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// 连接时从节点读取的链 ID
    fn chain_id(&self) -> u64;

    /// 订阅新区块头
    async fn subscribe_new_heads(&self) -> Result<HeadStream>;

    /// 按合约地址过滤 [from_block, to_block] 区间内的日志，按区块号、日志序号排列
    async fn filter_logs(
        &self,
        from_block: u64,
        to_block: u64,
        address: Address,
    ) -> Result<Vec<Log>>;

    /// 只读合约调用
    async fn call(&self, to: Address, input: Bytes) -> Result<Bytes>;

    /// 使用签名上下文签名并广播交易，返回交易哈希
    async fn send_transaction(
        &self,
        ctx: &SigningContext,
        to: Address,
        input: Bytes,
    ) -> Result<B256>;

    /// 查询交易回执，尚未上链时返回 None
    async fn transaction_receipt(&self, tx_hash: B256) -> Result<Option<TxReceipt>>;
}

/// 链客户端工厂，按链配置建立连接
#[async_trait]
pub trait ChainClientFactory: Send + Sync {
    async fn dial(&self, chain: &ChainConfig) -> Result<Arc<dyn ChainClient>>;
}

pub struct EvmClientFactory;

#[async_trait]
impl ChainClientFactory for EvmClientFactory {
    async fn dial(&self, chain: &ChainConfig) -> Result<Arc<dyn ChainClient>> {
        let client = EvmClient::dial(&chain.rpc_url, Some(chain.chain_id)).await?;
        Ok(Arc::new(client))
    }
}

/// 以固定间隔轮询交易回执，直到上链、超时或取消
pub async fn wait_for_receipt(
    client: &dyn ChainClient,
    tx_hash: B256,
    poll_interval: Duration,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<TxReceipt> {
    let deadline = timeout.map(|t| Instant::now() + t);

    loop {
        match client.transaction_receipt(tx_hash).await {
            Ok(Some(receipt)) => return Ok(receipt),
            Ok(None) => debug!(%tx_hash, "receipt not available yet"),
            Err(e) => warn!(%tx_hash, error = %e, "failed to fetch receipt, polling again"),
        }

        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err(Error::ReceiptTimeout(tx_hash));
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = sleep(poll_interval) => {}
        }
    }
}
