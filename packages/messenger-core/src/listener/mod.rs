use std::sync::Arc;

use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;
use alloy_primitives::Address;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    chain_client::ChainClient,
    config::ChainConfig,
    contracts::SourceMessenger::MessageSent,
    pipeline::MessagePublisher,
    store::MessageStore,
    types::CrossChainMessage,
    Error, Result,
};

/// 单条源链的事件监听器
///
/// 每个新区块头到达后，扫描已满足确认数的区块区间，把 `MessageSent` 事件翻译成消息并发布。
/// 游标只在整个区间扫描成功后前移，扫描失败的区间在下一个区块头到达时重试。
pub struct Listener {
    client: Arc<dyn ChainClient>,
    chain: ChainConfig,
    source_contract: Address,
    publisher: MessagePublisher,
    store: Arc<dyn MessageStore>,
    from_block: u64,
}

impl Listener {
    /// 起始区块优先取持久化的游标，没有时使用配置的 start_block
    pub fn new(
        client: Arc<dyn ChainClient>,
        chain: ChainConfig,
        publisher: MessagePublisher,
        store: Arc<dyn MessageStore>,
    ) -> Result<Self> {
        let source_contract = chain
            .source_contract
            .ok_or_else(|| Error::Config(format!("Chain {} has no source contract", chain.name)))?;
        let from_block = store.load_cursor(chain.chain_id)?.unwrap_or(chain.start_block);

        Ok(Self {
            client,
            chain,
            source_contract,
            publisher,
            store,
            from_block,
        })
    }

    pub fn chain(&self) -> &ChainConfig {
        &self.chain
    }

    pub fn from_block(&self) -> u64 {
        self.from_block
    }

    /// 运行直到取消（返回 Ok）或区块头订阅断开（返回错误）
    pub async fn start(&mut self, cancel: CancellationToken) -> Result<()> {
        info!(
            chain = %self.chain.name,
            chain_id = self.chain.chain_id,
            from_block = self.from_block,
            "Starting listener"
        );

        let mut heads = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            heads = self.client.subscribe_new_heads() => heads?,
        };

        loop {
            let head = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(chain = %self.chain.name, "Listener stopped");
                    return Ok(());
                }
                head = heads.next() => head,
            };

            let Some(head) = head else {
                return Err(Error::Subscription(format!(
                    "head subscription closed on chain {}",
                    self.chain.name
                )));
            };

            match self.on_new_head(head.number, &cancel).await {
                Ok(()) => {}
                Err(Error::Cancelled) => {
                    info!(chain = %self.chain.name, "Listener stopped");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        chain = %self.chain.name,
                        from_block = self.from_block,
                        error = %e,
                        "Error processing blocks, retrying on next head"
                    );
                }
            }
        }
    }

    /// 链高为 head 时可以扫描的区间；区块数不足确认数或没有新确认区块时为 None
    pub fn confirmed_range(&self, head: u64) -> Option<(u64, u64)> {
        let confirmed = head.checked_sub(self.chain.confirmations)?;
        if confirmed < self.from_block {
            return None;
        }
        Some((self.from_block, confirmed))
    }

    /// 处理一个新区块头，按 max_block_range 分段扫描，每段成功后推进游标
    pub async fn on_new_head(&mut self, head: u64, cancel: &CancellationToken) -> Result<()> {
        let Some((from, confirmed)) = self.confirmed_range(head) else {
            debug!(chain = %self.chain.name, head, "no newly confirmed blocks");
            return Ok(());
        };

        let span = self.chain.max_block_range.unwrap_or(u64::MAX).max(1);
        let mut start = from;
        while start <= confirmed {
            let end = start.saturating_add(span - 1).min(confirmed);
            self.scan_range(start, end, cancel).await?;

            self.from_block = end + 1;
            if let Err(e) = self.store.save_cursor(self.chain.chain_id, self.from_block) {
                warn!(chain = %self.chain.name, error = %e, "failed to persist scan cursor");
            }

            if end == u64::MAX {
                break;
            }
            start = end + 1;
        }

        Ok(())
    }

    async fn scan_range(&self, from: u64, to: u64, cancel: &CancellationToken) -> Result<()> {
        let logs = self.client.filter_logs(from, to, self.source_contract).await?;
        debug!(chain = %self.chain.name, from, to, count = logs.len(), "scanned block range");

        for log in &logs {
            let message = match self.translate(log) {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(e) => {
                    warn!(
                        chain = %self.chain.name,
                        tx_hash = ?log.transaction_hash,
                        log_index = ?log.log_index,
                        error = %e,
                        "Skipping undecodable log"
                    );
                    continue;
                }
            };
            self.publish(message, cancel).await?;
        }

        Ok(())
    }

    /// 把日志翻译成消息；不是 MessageSent 事件的日志返回 None
    pub fn translate(&self, log: &Log) -> Result<Option<CrossChainMessage>> {
        if log.inner.data.topics().first() != Some(&MessageSent::SIGNATURE_HASH) {
            return Ok(None);
        }

        let event = MessageSent::decode_log_data(&log.inner.data)
            .map_err(|e| Error::Decode(format!("failed to parse MessageSent: {}", e)))?;

        let dest_chain_id = u64::try_from(event.destinationChainId).map_err(|_| {
            Error::Decode(format!(
                "destination chain id {} out of range",
                event.destinationChainId
            ))
        })?;
        let timestamp = u64::try_from(event.timestamp)
            .map_err(|_| Error::Decode(format!("timestamp {} out of range", event.timestamp)))?;

        let message = CrossChainMessage::new(
            event.nonce,
            self.chain.chain_id,
            dest_chain_id,
            event.sender,
            event.payload,
            timestamp,
        )
        .with_source(log.transaction_hash, log.block_number);

        Ok(Some(message))
    }

    /// 先落库再发布；存储中已是终态的消息不再发布
    async fn publish(&self, message: CrossChainMessage, cancel: &CancellationToken) -> Result<()> {
        if !self.store.insert_if_absent(&message)? {
            if let Some(existing) = self.store.get_message(&message.message_hash)? {
                if existing.status.is_terminal() {
                    debug!(
                        message_hash = %message.message_hash,
                        "message already finished, not republishing"
                    );
                    return Ok(());
                }
            }
        }

        info!(
            message_hash = %message.message_hash,
            nonce = %message.nonce,
            sender = %message.sender,
            dest_chain_id = message.dest_chain_id,
            "New message detected"
        );
        self.publisher.publish(message, cancel).await
    }
}
