use alloy::network::TransactionBuilder;
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, Log, TransactionRequest};
use alloy_primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info};

use super::{ChainClient, HeadStream};
use crate::{
    signer::SigningContext,
    types::{BlockHeader, TxReceipt},
    Error, Result,
};

/// 基于 alloy provider 的 EVM 链客户端，rpc_url 为 ws(s):// 时支持区块头订阅
pub struct EvmClient {
    chain_id: u64,
    provider: DynProvider,
}

impl EvmClient {
    pub async fn dial(rpc_url: &str, expected_chain_id: Option<u64>) -> Result<Self> {
        let provider = ProviderBuilder::new()
            .connect(rpc_url)
            .await
            .map_err(|e| Error::Network(format!("Failed to connect to {}: {}", rpc_url, e)))?
            .erased();

        let chain_id = provider
            .get_chain_id()
            .await
            .map_err(|e| Error::Network(format!("Failed to query chain id: {}", e)))?;

        if let Some(expected) = expected_chain_id {
            if expected != chain_id {
                return Err(Error::Config(format!(
                    "Chain id mismatch for {}: configured {}, node reports {}",
                    rpc_url, expected, chain_id
                )));
            }
        }

        info!(chain_id, "connected to chain");
        Ok(Self { chain_id, provider })
    }

    /// 不做握手，直接使用已有 provider
    pub fn from_provider(chain_id: u64, provider: DynProvider) -> Self {
        Self { chain_id, provider }
    }
}

#[async_trait]
impl ChainClient for EvmClient {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn subscribe_new_heads(&self) -> Result<HeadStream> {
        let sub = self
            .provider
            .subscribe_blocks()
            .await
            .map_err(|e| Error::Subscription(format!("Failed to subscribe to new heads: {}", e)))?;

        let stream = sub
            .into_stream()
            .map(|header| BlockHeader {
                number: header.inner.number,
                hash: header.hash,
                timestamp: header.inner.timestamp,
            })
            .boxed();
        Ok(stream)
    }

    async fn filter_logs(
        &self,
        from_block: u64,
        to_block: u64,
        address: Address,
    ) -> Result<Vec<Log>> {
        let filter = Filter::new()
            .address(address)
            .from_block(from_block)
            .to_block(to_block);

        self.provider
            .get_logs(&filter)
            .await
            .map_err(|e| Error::Network(format!("Failed to filter logs: {}", e)))
    }

    async fn call(&self, to: Address, input: Bytes) -> Result<Bytes> {
        let tx = TransactionRequest::default().with_to(to).with_input(input);
        self.provider
            .call(tx)
            .await
            .map_err(|e| Error::Network(format!("eth_call failed: {}", e)))
    }

    async fn send_transaction(
        &self,
        ctx: &SigningContext,
        to: Address,
        input: Bytes,
    ) -> Result<B256> {
        if ctx.chain_id != self.chain_id {
            return Err(Error::Config(format!(
                "Signing context bound to chain {} used on chain {}",
                ctx.chain_id, self.chain_id
            )));
        }

        let nonce = match ctx.nonce {
            Some(nonce) => nonce,
            None => self
                .provider
                .get_transaction_count(ctx.from)
                .pending()
                .await
                .map_err(|e| Error::Network(format!("Failed to fetch nonce: {}", e)))?,
        };

        let fees = self
            .provider
            .estimate_eip1559_fees()
            .await
            .map_err(|e| Error::Network(format!("Failed to estimate fees: {}", e)))?;

        let mut tx = TransactionRequest::default()
            .with_from(ctx.from)
            .with_to(to)
            .with_input(input)
            .with_chain_id(ctx.chain_id)
            .with_nonce(nonce)
            .with_max_fee_per_gas(fees.max_fee_per_gas)
            .with_max_priority_fee_per_gas(fees.max_priority_fee_per_gas);

        let gas_limit = match ctx.gas_limit {
            Some(limit) => limit,
            None => self
                .provider
                .estimate_gas(tx.clone())
                .await
                .map_err(|e| Error::Chain(format!("Failed to estimate gas: {}", e)))?,
        };
        tx.set_gas_limit(gas_limit);

        let envelope = tx
            .build(ctx.wallet())
            .await
            .map_err(|e| Error::InvalidCredential(format!("Failed to sign transaction: {}", e)))?;

        let pending = self
            .provider
            .send_tx_envelope(envelope)
            .await
            .map_err(|e| Error::Network(format!("Failed to send transaction: {}", e)))?;

        let tx_hash = *pending.tx_hash();
        debug!(chain_id = self.chain_id, %tx_hash, nonce, gas_limit, "transaction broadcast");
        Ok(tx_hash)
    }

    async fn transaction_receipt(&self, tx_hash: B256) -> Result<Option<TxReceipt>> {
        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| Error::Network(format!("Failed to fetch receipt: {}", e)))?;

        Ok(receipt.map(|r| TxReceipt {
            tx_hash: r.transaction_hash,
            block_number: r.block_number,
            success: r.status(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::sol_types::{SolCall, SolValue};
    use crate::contracts::DestinationMessenger;

    fn rpc_result(result: &str) -> String {
        format!(r#"{{"jsonrpc":"2.0","id":0,"result":{}}}"#, result)
    }

    fn http_client(url: &str, chain_id: u64) -> EvmClient {
        let provider = ProviderBuilder::new()
            .connect_http(url.parse().unwrap())
            .erased();
        EvmClient::from_provider(chain_id, provider)
    }

    #[tokio::test]
    async fn test_call_decodes_is_processed() {
        let mut server = mockito::Server::new_async().await;
        let encoded = format!("\"0x{}\"", hex::encode(true.abi_encode()));
        let mock = server
            .mock("POST", "/")
            .match_body(mockito::Matcher::Regex("eth_call".to_string()))
            .with_header("content-type", "application/json")
            .with_body(rpc_result(&encoded))
            .create_async()
            .await;

        let client = http_client(&server.url(), 80002);
        let input = DestinationMessenger::isProcessedCall {
            messageHash: B256::repeat_byte(0xab),
        }
        .abi_encode();
        let output = client
            .call(Address::repeat_byte(0x22), input.into())
            .await
            .unwrap();

        assert!(bool::abi_decode(&output).unwrap());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_receipt_not_found() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .match_body(mockito::Matcher::Regex("eth_getTransactionReceipt".to_string()))
            .with_header("content-type", "application/json")
            .with_body(rpc_result("null"))
            .create_async()
            .await;

        let client = http_client(&server.url(), 80002);
        let receipt = client.transaction_receipt(B256::repeat_byte(0x01)).await.unwrap();

        assert!(receipt.is_none());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rpc_error_maps_to_network() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/")
            .with_status(503)
            .create_async()
            .await;

        let client = http_client(&server.url(), 80002);
        let err = client.call(Address::ZERO, Bytes::new()).await.unwrap_err();
        assert!(matches!(err, Error::Network(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_rejects_context_for_other_chain() {
        let client = http_client("http://127.0.0.1:1", 80002);
        let signer = crate::signer::Signer::new(crate::signer::tests::ANVIL_KEY).unwrap();
        let ctx = signer.transactor_for(1).unwrap();

        let err = client
            .send_transaction(&ctx, Address::ZERO, Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
