//! 消息与扫描游标的持久化
//!
//! 监听器在发布前写入消息，执行器在每次状态变化后更新；重启时把未完成的消息重新放回通道。

use std::collections::HashMap;
use std::sync::Mutex;

use alloy_primitives::B256;

use crate::{types::CrossChainMessage, Error, Result};

pub mod rocks;

pub use rocks::RocksStore;

pub trait MessageStore: Send + Sync {
    /// 仅当消息哈希尚不存在时写入，返回是否写入
    fn insert_if_absent(&self, message: &CrossChainMessage) -> Result<bool>;

    fn put_message(&self, message: &CrossChainMessage) -> Result<()>;

    fn get_message(&self, message_hash: &B256) -> Result<Option<CrossChainMessage>>;

    /// 状态为 Pending 或 Relaying 的消息，按创建时间排序
    fn unfinished_messages(&self) -> Result<Vec<CrossChainMessage>>;

    /// 下一次扫描的起始区块
    fn load_cursor(&self, chain_id: u64) -> Result<Option<u64>>;

    fn save_cursor(&self, chain_id: u64, next_block: u64) -> Result<()>;
}

fn sort_unfinished(mut messages: Vec<CrossChainMessage>) -> Vec<CrossChainMessage> {
    messages.retain(|m| !m.status.is_terminal());
    messages.sort_by_key(|m| m.created_at);
    messages
}

/// 进程内存储，未配置 db_path 时使用
#[derive(Default)]
pub struct MemoryStore {
    messages: Mutex<HashMap<B256, CrossChainMessage>>,
    cursors: Mutex<HashMap<u64, u64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> Error {
    Error::Storage("store lock poisoned".to_string())
}

impl MessageStore for MemoryStore {
    fn insert_if_absent(&self, message: &CrossChainMessage) -> Result<bool> {
        let mut messages = self.messages.lock().map_err(poisoned)?;
        if messages.contains_key(&message.message_hash) {
            return Ok(false);
        }
        messages.insert(message.message_hash, message.clone());
        Ok(true)
    }

    fn put_message(&self, message: &CrossChainMessage) -> Result<()> {
        self.messages
            .lock()
            .map_err(poisoned)?
            .insert(message.message_hash, message.clone());
        Ok(())
    }

    fn get_message(&self, message_hash: &B256) -> Result<Option<CrossChainMessage>> {
        Ok(self.messages.lock().map_err(poisoned)?.get(message_hash).cloned())
    }

    fn unfinished_messages(&self) -> Result<Vec<CrossChainMessage>> {
        let all = self.messages.lock().map_err(poisoned)?.values().cloned().collect();
        Ok(sort_unfinished(all))
    }

    fn load_cursor(&self, chain_id: u64) -> Result<Option<u64>> {
        Ok(self.cursors.lock().map_err(poisoned)?.get(&chain_id).copied())
    }

    fn save_cursor(&self, chain_id: u64, next_block: u64) -> Result<()> {
        self.cursors.lock().map_err(poisoned)?.insert(chain_id, next_block);
        Ok(())
    }
}
