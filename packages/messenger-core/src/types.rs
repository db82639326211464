use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// 跨链消息，中继的基本工作单元
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossChainMessage {
    pub nonce: U256,
    pub source_chain_id: u64,
    pub dest_chain_id: u64,
    pub sender: Address,
    pub payload: Bytes,
    pub timestamp: u64,
    pub message_hash: B256,
    pub source_tx_hash: Option<B256>,
    pub source_block: Option<u64>,
    pub dest_tx_hash: Option<B256>,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Relaying,
    Completed,
    Failed,
}

impl MessageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Completed | MessageStatus::Failed)
    }

    /// 状态只能前进: Pending -> Relaying -> Completed | Failed
    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Pending, Relaying) | (Pending, Failed) | (Relaying, Completed) | (Relaying, Failed)
        )
    }
}

impl CrossChainMessage {
    /// 根据源链事件字段创建待处理消息，同时计算消息哈希
    pub fn new(
        nonce: U256,
        source_chain_id: u64,
        dest_chain_id: u64,
        sender: Address,
        payload: Bytes,
        timestamp: u64,
    ) -> Self {
        let message_hash = compute_message_hash(
            nonce,
            source_chain_id,
            dest_chain_id,
            sender,
            &payload,
            timestamp,
        );
        Self {
            nonce,
            source_chain_id,
            dest_chain_id,
            sender,
            payload,
            timestamp,
            message_hash,
            source_tx_hash: None,
            source_block: None,
            dest_tx_hash: None,
            status: MessageStatus::Pending,
            created_at: Utc::now(),
            processed_at: None,
            retry_count: 0,
            last_retry_at: None,
            last_error: None,
        }
    }

    pub fn with_source(mut self, tx_hash: Option<B256>, block: Option<u64>) -> Self {
        self.source_tx_hash = tx_hash;
        self.source_block = block;
        self
    }

    fn advance(&mut self, next: MessageStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition { from: self.status, to: next });
        }
        self.status = next;
        Ok(())
    }

    pub fn mark_relaying(&mut self) -> Result<()> {
        self.advance(MessageStatus::Relaying)
    }

    /// 目标链确认投递成功；链上已处理的情况不带交易哈希，保留原有的 dest_tx_hash
    pub fn mark_completed(&mut self, dest_tx_hash: Option<B256>) -> Result<()> {
        self.advance(MessageStatus::Completed)?;
        if dest_tx_hash.is_some() {
            self.dest_tx_hash = dest_tx_hash;
        }
        self.processed_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) -> Result<()> {
        self.advance(MessageStatus::Failed)?;
        self.last_error = Some(reason.into());
        self.processed_at = Some(Utc::now());
        Ok(())
    }

    pub fn record_retry(&mut self, reason: impl Into<String>) {
        self.retry_count += 1;
        self.last_retry_at = Some(Utc::now());
        self.last_error = Some(reason.into());
    }
}

/// keccak256(abi.encodePacked(nonce, sourceChainId, destChainId, sender, payload, timestamp))
///
/// 与目标合约 `getMessageHash` 的编码一致：整数按 32 字节大端，地址 20 字节，payload 原样拼接。
pub fn compute_message_hash(
    nonce: U256,
    source_chain_id: u64,
    dest_chain_id: u64,
    sender: Address,
    payload: &[u8],
    timestamp: u64,
) -> B256 {
    let mut packed = Vec::with_capacity(32 * 4 + 20 + payload.len());
    packed.extend_from_slice(&nonce.to_be_bytes::<32>());
    packed.extend_from_slice(&U256::from(source_chain_id).to_be_bytes::<32>());
    packed.extend_from_slice(&U256::from(dest_chain_id).to_be_bytes::<32>());
    packed.extend_from_slice(sender.as_slice());
    packed.extend_from_slice(payload);
    packed.extend_from_slice(&U256::from(timestamp).to_be_bytes::<32>());
    keccak256(packed)
}

/// 新区块头，只保留中继需要的字段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: B256,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: B256,
    pub block_number: Option<u64>,
    pub success: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    fn sample() -> CrossChainMessage {
        CrossChainMessage::new(
            U256::from(1),
            11155111,
            80001,
            address!("00000000000000000000000000000000000000aa"),
            Bytes::from_static(b"hi"),
            1000,
        )
    }

    #[test]
    fn test_hash_is_deterministic() {
        let a = sample();
        let b = sample();
        assert_eq!(a.message_hash, b.message_hash);
        assert_eq!(
            a.message_hash,
            compute_message_hash(
                a.nonce,
                a.source_chain_id,
                a.dest_chain_id,
                a.sender,
                &a.payload,
                a.timestamp,
            )
        );
    }

    #[test]
    fn test_hash_uses_packed_encoding() {
        let msg = sample();
        let mut expected = Vec::new();
        expected.extend_from_slice(&[0u8; 31]);
        expected.push(1);
        expected.extend_from_slice(&U256::from(11155111u64).to_be_bytes::<32>());
        expected.extend_from_slice(&U256::from(80001u64).to_be_bytes::<32>());
        expected.extend_from_slice(&[0u8; 19]);
        expected.push(0xaa);
        expected.extend_from_slice(b"hi");
        expected.extend_from_slice(&U256::from(1000u64).to_be_bytes::<32>());
        assert_eq!(expected.len(), 32 * 4 + 20 + 2);
        assert_eq!(msg.message_hash, keccak256(&expected));
    }

    #[test]
    fn test_hash_changes_with_any_field() {
        let base = sample();
        let other_payload = CrossChainMessage::new(
            base.nonce,
            base.source_chain_id,
            base.dest_chain_id,
            base.sender,
            Bytes::from_static(b"ho"),
            base.timestamp,
        );
        let other_source = CrossChainMessage::new(
            base.nonce,
            1,
            base.dest_chain_id,
            base.sender,
            base.payload.clone(),
            base.timestamp,
        );
        assert_ne!(base.message_hash, other_payload.message_hash);
        assert_ne!(base.message_hash, other_source.message_hash);
    }

    #[test]
    fn test_status_only_moves_forward() {
        let mut msg = sample();
        assert_eq!(msg.status, MessageStatus::Pending);
        assert!(msg.mark_completed(None).is_err());

        msg.mark_relaying().unwrap();
        let tx = B256::repeat_byte(0x11);
        msg.mark_completed(Some(tx)).unwrap();
        assert_eq!(msg.status, MessageStatus::Completed);
        assert_eq!(msg.dest_tx_hash, Some(tx));
        assert!(msg.processed_at.is_some());

        assert!(msg.mark_relaying().is_err());
        assert!(msg.mark_failed("late").is_err());
        assert!(msg.mark_completed(None).is_err());
        assert_eq!(msg.dest_tx_hash, Some(tx));
    }

    #[test]
    fn test_completed_without_tx_keeps_previous_hash() {
        let mut msg = sample();
        let tx = B256::repeat_byte(0x22);
        msg.dest_tx_hash = Some(tx);
        msg.mark_relaying().unwrap();
        msg.mark_completed(None).unwrap();
        assert_eq!(msg.dest_tx_hash, Some(tx));
    }

    #[test]
    fn test_record_retry() {
        let mut msg = sample();
        msg.record_retry("rpc timeout");
        msg.record_retry("rpc timeout");
        assert_eq!(msg.retry_count, 2);
        assert!(msg.last_retry_at.is_some());
        assert_eq!(msg.last_error.as_deref(), Some("rpc timeout"));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&MessageStatus::Relaying).unwrap();
        assert_eq!(json, "\"relaying\"");
    }
}
