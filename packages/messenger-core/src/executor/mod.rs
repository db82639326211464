use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy::sol_types::{SolCall, SolValue};
use alloy_primitives::{Address, B256, U256};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    chain_client::{wait_for_receipt, ChainClient},
    config::RelayerConfig,
    contracts::DestinationMessenger,
    pipeline::MessageReceiver,
    signer::Signer,
    store::MessageStore,
    types::{CrossChainMessage, MessageStatus, TxReceipt},
    Error, Result,
};

const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// 一条目标链的投递路由
#[derive(Clone)]
pub struct Route {
    pub name: String,
    pub client: Arc<dyn ChainClient>,
    pub contract: Address,
}

/// chain_id -> 路由，启动时构建后只读
pub type Routes = HashMap<u64, Route>;

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub gas_limit: u64,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub poll_interval: Duration,
    pub receipt_timeout: Option<Duration>,
}

impl From<&RelayerConfig> for ExecutorSettings {
    fn from(config: &RelayerConfig) -> Self {
        Self {
            gas_limit: config.gas_limit,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
            poll_interval: config.poll_interval(),
            receipt_timeout: Some(config.receipt_timeout()),
        }
    }
}

impl ExecutorSettings {
    /// retry_delay * 2^(n-1)，上限五分钟
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(16);
        self.retry_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }
}

/// 从通道中逐条取出消息并投递到目标链
pub struct Executor {
    routes: Arc<Routes>,
    signer: Arc<Signer>,
    store: Arc<dyn MessageStore>,
    settings: ExecutorSettings,
    receiver: MessageReceiver,
}

impl Executor {
    pub fn new(
        routes: Arc<Routes>,
        signer: Arc<Signer>,
        store: Arc<dyn MessageStore>,
        settings: ExecutorSettings,
        receiver: MessageReceiver,
    ) -> Self {
        Self {
            routes,
            signer,
            store,
            settings,
            receiver,
        }
    }

    /// 消费消息直到取消或所有发布方关闭
    pub async fn start(&mut self, cancel: CancellationToken) -> Result<()> {
        info!("Starting executor...");

        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                message = self.receiver.next() => message,
            };

            let Some(message) = message else {
                info!("Message pipeline closed, executor exiting");
                break;
            };

            match self.handle(message, &cancel).await {
                Ok(()) => {}
                Err(Error::Cancelled) => break,
                Err(e) => error!(error = %e, "Failed to handle message"),
            }
        }

        info!("Executor stopped");
        Ok(())
    }

    /// 对单条消息执行完整的状态机：去重、重试、落库
    pub async fn handle(
        &self,
        message: CrossChainMessage,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut message = match self.store.get_message(&message.message_hash)? {
            Some(stored) if stored.status.is_terminal() => {
                debug!(
                    message_hash = %stored.message_hash,
                    status = ?stored.status,
                    "message already finished, skipping"
                );
                return Ok(());
            }
            Some(stored) => stored,
            None => message,
        };

        if message.status == MessageStatus::Pending {
            message.mark_relaying()?;
            self.store.put_message(&message)?;
        }

        loop {
            match self.process_message(&mut message, cancel).await {
                Ok(()) => {
                    self.store.put_message(&message)?;
                    return Ok(());
                }
                Err(Error::Cancelled) => {
                    self.store.put_message(&message)?;
                    return Err(Error::Cancelled);
                }
                Err(e) if e.is_transient() && message.retry_count < self.settings.max_retries => {
                    message.record_retry(e.to_string());
                    self.store.put_message(&message)?;

                    let delay = self.settings.backoff(message.retry_count);
                    warn!(
                        message_hash = %message.message_hash,
                        retry = message.retry_count,
                        max_retries = self.settings.max_retries,
                        delay_secs = delay.as_secs_f64(),
                        error = %e,
                        "Relay attempt failed, retrying"
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = sleep(delay) => {}
                    }
                }
                Err(e) => {
                    error!(
                        message_hash = %message.message_hash,
                        dest_chain_id = message.dest_chain_id,
                        retries = message.retry_count,
                        error = %e,
                        "Message failed"
                    );
                    message.mark_failed(e.to_string())?;
                    self.store.put_message(&message)?;
                    return Ok(());
                }
            }
        }
    }

    /// 单次投递尝试：查路由、链上去重、签名发送、等待回执
    pub async fn process_message(
        &self,
        message: &mut CrossChainMessage,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let dest_chain_id = message.dest_chain_id;
        let route = self
            .routes
            .get(&dest_chain_id)
            .ok_or(Error::UnknownDestinationChain(dest_chain_id))?;

        // 上一次尝试已发出交易时先等它的回执，避免重复投递
        if let Some(previous) = message.dest_tx_hash {
            match self.wait_receipt(route, previous, cancel).await {
                Ok(receipt) if receipt.success => {
                    info!(
                        message_hash = %message.message_hash,
                        tx_hash = %previous,
                        "Earlier delivery confirmed"
                    );
                    message.mark_completed(Some(previous))?;
                    return Ok(());
                }
                Ok(_) => {
                    warn!(
                        message_hash = %message.message_hash,
                        tx_hash = %previous,
                        "Earlier delivery reverted"
                    );
                    message.dest_tx_hash = None;
                }
                Err(Error::ReceiptTimeout(_)) => {
                    warn!(
                        message_hash = %message.message_hash,
                        tx_hash = %previous,
                        "Earlier delivery has no receipt yet"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        if self.is_processed(route, message).await? {
            info!(
                message_hash = %message.message_hash,
                dest_chain_id,
                "Message already processed on destination"
            );
            message.mark_completed(None)?;
            return Ok(());
        }

        // 链上仍未处理，之前的交易视为已丢弃
        message.dest_tx_hash = None;

        let ctx = self
            .signer
            .transactor_for(dest_chain_id)?
            .with_gas_limit(self.settings.gas_limit);

        let input = DestinationMessenger::receiveMessageCall {
            nonce: message.nonce,
            sourceChainId: U256::from(message.source_chain_id),
            sender: message.sender,
            payload: message.payload.clone(),
            timestamp: U256::from(message.timestamp),
        }
        .abi_encode();

        info!(
            message_hash = %message.message_hash,
            dest_chain = %route.name,
            dest_chain_id,
            "Relaying message"
        );
        let tx_hash = route
            .client
            .send_transaction(&ctx, route.contract, input.into())
            .await?;
        info!(
            message_hash = %message.message_hash,
            %tx_hash,
            "Message relayed, waiting for receipt"
        );

        message.dest_tx_hash = Some(tx_hash);
        self.store.put_message(message)?;

        let receipt = self.wait_receipt(route, tx_hash, cancel).await?;

        if !receipt.success {
            message.dest_tx_hash = None;
            // 另一个中继者抢先投递时 receiveMessage 会回滚，此时按已完成处理
            if self.is_processed(route, message).await? {
                info!(
                    message_hash = %message.message_hash,
                    %tx_hash,
                    "Delivery reverted but message is processed"
                );
                message.mark_completed(None)?;
                return Ok(());
            }
            return Err(Error::DeliveryReverted { chain_id: dest_chain_id, tx_hash });
        }

        info!(
            message_hash = %message.message_hash,
            %tx_hash,
            block = ?receipt.block_number,
            "Message confirmed on destination"
        );
        message.mark_completed(Some(tx_hash))?;
        Ok(())
    }

    async fn wait_receipt(
        &self,
        route: &Route,
        tx_hash: B256,
        cancel: &CancellationToken,
    ) -> Result<TxReceipt> {
        wait_for_receipt(
            route.client.as_ref(),
            tx_hash,
            self.settings.poll_interval,
            self.settings.receipt_timeout,
            cancel,
        )
        .await
    }

    async fn is_processed(&self, route: &Route, message: &CrossChainMessage) -> Result<bool> {
        let input = DestinationMessenger::isProcessedCall {
            messageHash: message.message_hash,
        }
        .abi_encode();
        let output = route.client.call(route.contract, input.into()).await?;
        bool::abi_decode(&output)
            .map_err(|e| Error::Decode(format!("isProcessed returned malformed data: {}", e)))
    }
}
