use alloy::sol_types::{SolCall, SolValue};
use alloy_primitives::{Address, Bytes, B256, U256};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use messenger_core::{
    chain_client::{wait_for_receipt, ChainClient, EvmClient},
    contracts::{DestinationMessenger, SourceMessenger},
    relayer::Relayer,
    signer::Signer,
    Config,
};
use std::path::PathBuf;
use std::time::Duration;
use tabled::{settings::Style, Table, Tabled};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 验证并解析配置文件
    ValidateConfig {
        /// 配置文件路径
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },
    /// 启动中继器服务
    Start {
        /// 配置文件路径
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },
    /// 在源链上发送一条跨链消息
    Send {
        /// 源链 RPC 地址
        #[arg(long)]
        rpc: String,
        /// 源链 Messenger 合约地址
        #[arg(long)]
        contract: Address,
        /// 发送方私钥（十六进制）
        #[arg(long)]
        key: String,
        /// 目标链 ID
        #[arg(long)]
        dest_chain: u64,
        /// 消息内容
        #[arg(long)]
        message: String,
    },
    /// 查询消息在目标链上是否已处理
    Status {
        /// 目标链 RPC 地址
        #[arg(long)]
        rpc: String,
        /// 目标链 Messenger 合约地址
        #[arg(long)]
        contract: Address,
        /// 消息哈希
        #[arg(long)]
        hash: B256,
    },
}

#[derive(Tabled)]
struct ChainRow {
    #[tabled(rename = "名称")]
    name: String,
    #[tabled(rename = "链 ID")]
    chain_id: u64,
    #[tabled(rename = "源合约")]
    source: String,
    #[tabled(rename = "目标合约")]
    dest: String,
    #[tabled(rename = "起始区块")]
    start_block: u64,
    #[tabled(rename = "确认数")]
    confirmations: u64,
}

#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "消息哈希")]
    hash: B256,
    #[tabled(rename = "状态")]
    status: &'static str,
}

fn or_dash(address: Option<Address>) -> String {
    address.map(|a| a.to_string()).unwrap_or_else(|| "-".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志，默认 info 级别，可用 RUST_LOG 覆盖
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::ValidateConfig { config } => validate_config(config),
        Commands::Start { config } => start(config).await,
        Commands::Send { rpc, contract, key, dest_chain, message } => {
            send(&rpc, contract, &key, dest_chain, message).await
        }
        Commands::Status { rpc, contract, hash } => status(&rpc, contract, hash).await,
    }
}

fn validate_config(path: PathBuf) -> Result<()> {
    info!("正在验证配置文件: {:?}", path);
    let config = Config::load(&path)?;
    println!("配置文件验证成功!");

    let rows: Vec<ChainRow> = config
        .chains
        .iter()
        .map(|chain| ChainRow {
            name: chain.name.clone(),
            chain_id: chain.chain_id,
            source: or_dash(chain.source_contract),
            dest: or_dash(chain.dest_contract),
            start_block: chain.start_block,
            confirmations: chain.confirmations,
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::modern());
    println!("{}", table);

    let relayer = &config.relayer;
    println!("- 中继器配置:");
    println!("  - 轮询间隔: {:?}", relayer.poll_interval());
    println!("  - 最大重试次数: {}", relayer.max_retries);
    println!("  - 重试延迟: {}秒", relayer.retry_delay);
    println!("  - Gas 上限: {}", relayer.gas_limit);
    println!("  - 通道容量: {}", relayer.channel_capacity);
    match &relayer.db_path {
        Some(path) => println!("  - 数据目录: {}", path.display()),
        None => println!("  - 数据目录: 未配置（使用内存存储）"),
    }
    Ok(())
}

async fn start(path: PathBuf) -> Result<()> {
    info!("正在启动中继器服务");
    info!("使用配置文件: {:?}", path);

    let config = Config::load(&path)?;
    let relayer = Relayer::new(config).await?;
    info!("中继器初始化成功，开始运行...");

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("收到退出信号，正在停止中继器");
        signal_cancel.cancel();
    });

    if let Err(e) = relayer.run(cancel).await {
        error!("中继器服务异常退出: {}", e);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            error!("无法注册 SIGTERM 处理: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn send(
    rpc: &str,
    contract: Address,
    key: &str,
    dest_chain: u64,
    message: String,
) -> Result<()> {
    let signer = Signer::new(key)?;
    let client = EvmClient::dial(rpc, None).await?;
    let ctx = signer.transactor_for(client.chain_id())?;

    let input = SourceMessenger::sendMessageCall {
        destChainId: U256::from(dest_chain),
        payload: Bytes::from(message.into_bytes()),
    }
    .abi_encode();

    let tx_hash = client.send_transaction(&ctx, contract, input.into()).await?;
    println!("交易已发送: {}", tx_hash);

    let receipt = wait_for_receipt(
        &client,
        tx_hash,
        Duration::from_secs(2),
        Some(Duration::from_secs(120)),
        &CancellationToken::new(),
    )
    .await?;
    if !receipt.success {
        bail!("交易执行失败: {}", tx_hash);
    }

    println!("发送方: {}", signer.address());
    println!("交易哈希: {}", receipt.tx_hash);
    if let Some(block) = receipt.block_number {
        println!("所在区块: {}", block);
    }
    Ok(())
}

async fn status(rpc: &str, contract: Address, hash: B256) -> Result<()> {
    let client = EvmClient::dial(rpc, None).await?;
    let input = DestinationMessenger::isProcessedCall { messageHash: hash }.abi_encode();
    let output = client.call(contract, input.into()).await?;
    let processed = bool::abi_decode(&output).context("isProcessed 返回数据无法解析")?;

    let row = StatusRow {
        hash,
        status: if processed { "Processed" } else { "Pending" },
    };
    let mut table = Table::new([row]);
    table.with(Style::modern());
    println!("{}", table);
    Ok(())
}
