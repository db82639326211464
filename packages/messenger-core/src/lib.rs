pub mod config;
pub mod types;
pub mod contracts;
pub mod chain_client;
pub mod signer;
pub mod pipeline;
pub mod store;
pub mod listener;
pub mod executor;
pub mod relayer;

pub use config::Config;
pub use types::{CrossChainMessage, MessageStatus};

use alloy_primitives::B256;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Chain error: {0}")]
    Chain(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Unknown destination chain: {0}")]
    UnknownDestinationChain(u64),

    #[error("Delivery reverted on chain {chain_id}, tx {tx_hash}")]
    DeliveryReverted { chain_id: u64, tx_hash: B256 },

    #[error("Timed out waiting for receipt of tx {0}")]
    ReceiptTimeout(B256),

    #[error("Invalid status transition: {from:?} -> {to:?}")]
    InvalidTransition { from: MessageStatus, to: MessageStatus },

    #[error("Message pipeline closed")]
    PipelineClosed,

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// 网络类错误可以退避重试，其余错误对当前消息是终态
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::Chain(_) | Error::Subscription(_) | Error::ReceiptTimeout(_)
        )
    }
}
