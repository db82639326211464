use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    chain_client::{ChainClient, ChainClientFactory, EvmClientFactory},
    config::Config,
    executor::{Executor, ExecutorSettings, Route, Routes},
    listener::Listener,
    pipeline::{self, MessagePublisher},
    signer::Signer,
    store::{MemoryStore, MessageStore, RocksStore},
    types::CrossChainMessage,
    Error, Result,
};

/// 中继器：持有所有链客户端、签名器和存储，负责启动监听器与执行器
pub struct Relayer {
    config: Config,
    signer: Arc<Signer>,
    store: Arc<dyn MessageStore>,
    clients: Vec<(u64, Arc<dyn ChainClient>)>,
    routes: Arc<Routes>,
}

impl Relayer {
    pub async fn new(config: Config) -> Result<Self> {
        Self::with_factory(config, &EvmClientFactory).await
    }

    pub async fn with_factory(config: Config, factory: &dyn ChainClientFactory) -> Result<Self> {
        config.validate()?;

        let signer = Arc::new(Signer::new(&config.relayer.private_key)?);
        info!(relayer = %signer.address(), "Relayer key loaded");

        let store: Arc<dyn MessageStore> = match &config.relayer.db_path {
            Some(path) => {
                info!(path = %path.display(), "Opening message store");
                Arc::new(RocksStore::open(path)?)
            }
            None => {
                warn!("No db_path configured, messages and cursors will not survive a restart");
                Arc::new(MemoryStore::new())
            }
        };

        let mut clients = Vec::with_capacity(config.chains.len());
        let mut routes = Routes::new();
        for chain in &config.chains {
            let client = factory.dial(chain).await?;
            info!(chain = %chain.name, chain_id = chain.chain_id, "Connected to chain");

            if let Some(contract) = chain.dest_contract {
                routes.insert(
                    chain.chain_id,
                    Route {
                        name: chain.name.clone(),
                        client: client.clone(),
                        contract,
                    },
                );
            }
            clients.push((chain.chain_id, client));
        }

        Ok(Self {
            config,
            signer,
            store,
            clients,
            routes: Arc::new(routes),
        })
    }

    pub fn store(&self) -> Arc<dyn MessageStore> {
        self.store.clone()
    }

    fn client(&self, chain_id: u64) -> Result<Arc<dyn ChainClient>> {
        self.clients
            .iter()
            .find(|(id, _)| *id == chain_id)
            .map(|(_, client)| client.clone())
            .ok_or_else(|| Error::Config(format!("No client for chain {}", chain_id)))
    }

    /// 运行直到取消信号到达，所有任务退出后返回
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        info!("Starting relayer...");
        let (publisher, receiver) = pipeline::channel(self.config.relayer.channel_capacity);
        let mut tasks = JoinSet::new();

        // 先构建全部监听器，配置错误在启动任何任务前暴露
        let mut listeners = Vec::new();
        for chain in self.config.source_chains() {
            let client = self.client(chain.chain_id)?;
            listeners.push(Listener::new(
                client,
                chain.clone(),
                publisher.clone(),
                self.store.clone(),
            )?);
        }

        let unfinished = self.store.unfinished_messages()?;
        if !unfinished.is_empty() {
            info!(count = unfinished.len(), "Replaying unfinished messages");
            tasks.spawn(replay(unfinished, publisher.clone(), cancel.clone()));
        }

        let restart_delay = self.config.relayer.restart_delay();
        for listener in listeners {
            tasks.spawn(supervise(listener, restart_delay, cancel.clone()));
        }
        drop(publisher);

        let mut executor = Executor::new(
            self.routes.clone(),
            self.signer.clone(),
            self.store.clone(),
            ExecutorSettings::from(&self.config.relayer),
            receiver,
        );
        let executor_cancel = cancel.clone();
        tasks.spawn(async move { executor.start(executor_cancel).await });

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Relayer task exited with error"),
                Err(e) => {
                    error!(error = %e, "Relayer task panicked");
                    cancel.cancel();
                }
            }
        }

        info!("Relayer stopped");
        Ok(())
    }
}

async fn replay(
    messages: Vec<CrossChainMessage>,
    publisher: MessagePublisher,
    cancel: CancellationToken,
) -> Result<()> {
    for message in messages {
        match publisher.publish(message, &cancel).await {
            Ok(()) => {}
            Err(Error::Cancelled) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// 监听器异常退出后按固定延迟重启，游标保留在监听器内
async fn supervise(
    mut listener: Listener,
    restart_delay: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        match listener.start(cancel.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(
                    chain = %listener.chain().name,
                    from_block = listener.from_block(),
                    error = %e,
                    delay_secs = restart_delay.as_secs(),
                    "Listener exited, restarting"
                );
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = sleep(restart_delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_client::{HeadStream, MockChainClient};
    use crate::config::{ChainConfig, RelayerConfig};
    use crate::signer::tests::ANVIL_KEY;
    use crate::types::{BlockHeader, MessageStatus};
    use alloy::sol_types::SolValue;
    use alloy_primitives::{address, Address, Bytes, B256, U256};
    use async_trait::async_trait;
    use futures::stream;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio_test::assert_ok;

    const SOURCE: Address = address!("1111111111111111111111111111111111111111");
    const DEST: Address = address!("2222222222222222222222222222222222222222");

    struct FixedFactory {
        clients: Mutex<HashMap<u64, Arc<dyn ChainClient>>>,
    }

    #[async_trait]
    impl ChainClientFactory for FixedFactory {
        async fn dial(&self, chain: &ChainConfig) -> Result<Arc<dyn ChainClient>> {
            self.clients
                .lock()
                .unwrap()
                .remove(&chain.chain_id)
                .ok_or_else(|| Error::Network(format!("cannot reach {}", chain.rpc_url)))
        }
    }

    fn chain(
        name: &str,
        chain_id: u64,
        source: Option<Address>,
        dest: Option<Address>,
    ) -> ChainConfig {
        ChainConfig {
            name: name.to_string(),
            chain_id,
            rpc_url: format!("http://{}.invalid", name),
            source_contract: source,
            dest_contract: dest,
            start_block: 0,
            confirmations: 0,
            max_block_range: None,
        }
    }

    fn config(private_key: &str) -> Config {
        Config {
            chains: vec![
                chain("sepolia", 11155111, Some(SOURCE), None),
                chain("mumbai", 80001, None, Some(DEST)),
            ],
            relayer: RelayerConfig {
                private_key: private_key.to_string(),
                poll_interval: Duration::from_secs(1),
                max_retries: 3,
                gas_limit: 300_000,
                db_path: None,
                retry_delay: 1,
                channel_capacity: 8,
                receipt_timeout: 5,
                restart_delay: 1,
            },
        }
    }

    fn idle_source() -> MockChainClient {
        let mut client = MockChainClient::new();
        client
            .expect_subscribe_new_heads()
            .returning(|| Ok(Box::pin(stream::pending::<BlockHeader>()) as HeadStream));
        client
    }

    fn factory(source: MockChainClient, dest: MockChainClient) -> FixedFactory {
        let mut clients: HashMap<u64, Arc<dyn ChainClient>> = HashMap::new();
        clients.insert(11155111, Arc::new(source));
        clients.insert(80001, Arc::new(dest));
        FixedFactory { clients: Mutex::new(clients) }
    }

    #[tokio::test]
    async fn test_invalid_key_is_fatal() {
        let factory = factory(MockChainClient::new(), MockChainClient::new());
        let result = Relayer::with_factory(config("0x1234"), &factory).await;
        assert!(matches!(result, Err(Error::InvalidCredential(_))));
    }

    #[tokio::test]
    async fn test_unreachable_chain_is_fatal() {
        let factory = FixedFactory { clients: Mutex::new(HashMap::new()) };
        let result = Relayer::with_factory(config(ANVIL_KEY), &factory).await;
        assert!(matches!(result, Err(Error::Network(_))));
    }

    #[tokio::test]
    async fn test_routes_only_destination_chains() {
        let factory = factory(MockChainClient::new(), MockChainClient::new());
        let relayer = assert_ok!(Relayer::with_factory(config(ANVIL_KEY), &factory).await);
        assert_eq!(relayer.routes.len(), 1);
        assert_eq!(relayer.routes.get(&80001).map(|r| r.contract), Some(DEST));
        assert!(relayer.routes.get(&11155111).is_none());
    }

    #[tokio::test]
    async fn test_run_replays_unfinished_and_stops_on_cancel() {
        let mut dest = MockChainClient::new();
        dest.expect_call().times(1).returning(|to, _| {
            assert_eq!(to, DEST);
            Ok(true.abi_encode().into())
        });

        let factory = factory(idle_source(), dest);
        let relayer = assert_ok!(Relayer::with_factory(config(ANVIL_KEY), &factory).await);

        let mut pending = CrossChainMessage::new(
            U256::from(1),
            11155111,
            80001,
            Address::repeat_byte(0xaa),
            Bytes::from_static(b"hi"),
            1000,
        );
        pending.mark_relaying().unwrap();
        let store = relayer.store();
        store.put_message(&pending).unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(relayer.run(cancel.clone()));

        let hash: B256 = pending.message_hash;
        let mut completed = false;
        for _ in 0..200 {
            let status = store.get_message(&hash).unwrap().map(|m| m.status);
            if status == Some(MessageStatus::Completed) {
                completed = true;
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(completed, "replayed message should be delivered");

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_ok!(result);
    }

    #[tokio::test]
    async fn test_listener_restarts_after_subscription_drop() {
        let mut source = MockChainClient::new();
        let mut attempts = 0;
        source.expect_subscribe_new_heads().times(2).returning(move || {
            attempts += 1;
            if attempts == 1 {
                Ok(Box::pin(stream::empty::<BlockHeader>()) as HeadStream)
            } else {
                Ok(Box::pin(stream::pending::<BlockHeader>()) as HeadStream)
            }
        });

        let store: Arc<dyn MessageStore> = Arc::new(MemoryStore::new());
        let (publisher, _receiver) = pipeline::channel(1);
        let listener = Listener::new(
            Arc::new(source),
            chain("sepolia", 11155111, Some(SOURCE), None),
            publisher,
            store,
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(supervise(listener, Duration::from_millis(10), cancel.clone()));

        sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        assert_ok!(handle.await.unwrap());
    }
}
