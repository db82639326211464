use std::fmt;

use alloy::network::EthereumWallet;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer as _;
use alloy_primitives::Address;
use tracing::debug;

use crate::{Error, Result};

/// 持有中继账户私钥，为每条目标链生成签名上下文
#[derive(Clone)]
pub struct Signer {
    key: PrivateKeySigner,
    address: Address,
}

impl Signer {
    /// 私钥为 32 字节十六进制串，可带 0x 前缀；无效私钥在构造时即报错
    pub fn new(private_key: &str) -> Result<Self> {
        let trimmed = private_key.trim();
        let raw = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let bytes = hex::decode(raw)
            .map_err(|e| Error::InvalidCredential(format!("private key is not valid hex: {}", e)))?;
        if bytes.len() != 32 {
            return Err(Error::InvalidCredential(format!(
                "private key must be 32 bytes, got {}",
                bytes.len()
            )));
        }

        let key = PrivateKeySigner::from_slice(&bytes)
            .map_err(|e| Error::InvalidCredential(e.to_string()))?;
        let address = key.address();

        Ok(Self { key, address })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// 生成绑定到 chain_id 的签名上下文，同一把私钥可以安全地为多条链签名
    pub fn transactor_for(&self, chain_id: u64) -> Result<SigningContext> {
        let mut key = self.key.clone();
        key.set_chain_id(Some(chain_id));
        debug!(chain_id, address = %self.address, "created signing context");

        Ok(SigningContext {
            chain_id,
            from: self.address,
            nonce: None,
            gas_limit: None,
            wallet: EthereumWallet::from(key),
        })
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer").field("address", &self.address).finish()
    }
}

/// 单次交易的签名参数：链 ID、发送方、nonce 与 gas 上限
///
/// nonce 为 None 时由链客户端按 pending 状态填充。
#[derive(Clone)]
pub struct SigningContext {
    pub chain_id: u64,
    pub from: Address,
    pub nonce: Option<u64>,
    pub gas_limit: Option<u64>,
    wallet: EthereumWallet,
}

impl SigningContext {
    pub fn with_gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = Some(gas_limit);
        self
    }

    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.nonce = Some(nonce);
        self
    }

    pub fn wallet(&self) -> &EthereumWallet {
        &self.wallet
    }
}

impl fmt::Debug for SigningContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningContext")
            .field("chain_id", &self.chain_id)
            .field("from", &self.from)
            .field("nonce", &self.nonce)
            .field("gas_limit", &self.gas_limit)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloy::consensus::Transaction as _;
    use alloy::network::TransactionBuilder;
    use alloy::rpc::types::TransactionRequest;
    use alloy_primitives::{address, Bytes};

    // anvil 默认账户 #0
    pub(crate) const ANVIL_KEY: &str =
        "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    #[test]
    fn test_address_derivation() {
        let signer = Signer::new(ANVIL_KEY).unwrap();
        assert_eq!(signer.address(), address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266"));

        let without_prefix = Signer::new(ANVIL_KEY.trim_start_matches("0x")).unwrap();
        assert_eq!(signer.address(), without_prefix.address());
    }

    #[test]
    fn test_invalid_credentials() {
        assert!(matches!(Signer::new("not-hex"), Err(Error::InvalidCredential(_))));
        assert!(matches!(Signer::new("0xabcd"), Err(Error::InvalidCredential(_))));
        assert!(matches!(Signer::new(&"00".repeat(32)), Err(Error::InvalidCredential(_))));
    }

    #[test]
    fn test_debug_hides_key() {
        let signer = Signer::new(ANVIL_KEY).unwrap();
        let rendered = format!("{:?}", signer);
        assert!(!rendered.contains("ac0974bec39a17e3"));
        assert!(rendered.contains("address"));
    }

    #[test]
    fn test_context_binds_chain() {
        let signer = Signer::new(ANVIL_KEY).unwrap();
        let sepolia = signer.transactor_for(11155111).unwrap();
        let amoy = signer.transactor_for(80002).unwrap().with_gas_limit(300_000).with_nonce(7);

        assert_eq!(sepolia.chain_id, 11155111);
        assert_eq!(amoy.chain_id, 80002);
        assert_eq!(sepolia.from, amoy.from);
        assert_eq!(amoy.gas_limit, Some(300_000));
        assert_eq!(amoy.nonce, Some(7));
        assert!(sepolia.gas_limit.is_none());
    }

    #[tokio::test]
    async fn test_signed_transaction_carries_chain_id() {
        let signer = Signer::new(ANVIL_KEY).unwrap();
        let ctx = signer.transactor_for(80002).unwrap().with_gas_limit(100_000);

        let tx = TransactionRequest::default()
            .with_from(ctx.from)
            .with_to(Address::repeat_byte(0x22))
            .with_input(Bytes::from_static(b"\x01\x02"))
            .with_chain_id(ctx.chain_id)
            .with_nonce(0)
            .with_gas_limit(100_000)
            .with_max_fee_per_gas(2_000_000_000)
            .with_max_priority_fee_per_gas(1_000_000_000);

        let envelope = tx.build(ctx.wallet()).await.unwrap();
        assert_eq!(envelope.chain_id(), Some(80002));
    }
}
