use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::Error;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChainConfig {
    pub name: String,
    pub chain_id: u64,
    pub rpc_url: String,
    /// 源链 Messenger 合约，未配置时不在该链上监听
    #[serde(default)]
    pub source_contract: Option<Address>,
    /// 目标链 Messenger 合约，未配置时该链不能作为投递目标
    #[serde(default)]
    pub dest_contract: Option<Address>,
    #[serde(default)]
    pub start_block: u64,
    #[serde(default)]
    pub confirmations: u64,
    /// 单次 eth_getLogs 的最大区块跨度
    #[serde(default)]
    pub max_block_range: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RelayerConfig {
    pub private_key: String,
    /// 回执轮询间隔，整数秒或 "5s" / "500ms" 这类时长字符串
    #[serde(with = "duration_or_secs")]
    pub poll_interval: Duration,
    pub max_retries: u32,
    pub gas_limit: u64,
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    /// 重试基础延迟（秒）
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// 等待回执的超时时间（秒）
    #[serde(default = "default_receipt_timeout")]
    pub receipt_timeout: u64,
    /// 监听器异常退出后的重启延迟（秒）
    #[serde(default = "default_restart_delay")]
    pub restart_delay: u64,
}

fn default_retry_delay() -> u64 {
    2
}

fn default_channel_capacity() -> usize {
    100
}

fn default_receipt_timeout() -> u64 {
    300
}

fn default_restart_delay() -> u64 {
    5
}

impl RelayerConfig {
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay)
    }

    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_secs(self.receipt_timeout)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay)
    }
}

mod duration_or_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => {
                humantime::parse_duration(text.trim()).map_err(serde::de::Error::custom)
            }
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub chains: Vec<ChainConfig>,
    pub relayer: RelayerConfig,
}

impl Config {
    /// 加载配置文件，支持 yaml / toml / json，文件内容中的 `${VAR}` 会用环境变量替换
    pub fn load<P: AsRef<Path>>(config_path: P) -> Result<Self, Error> {
        // .env 不存在时忽略
        dotenvy::dotenv().ok();

        let path = config_path.as_ref();
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        let expanded = expand_env(&config_str);

        let config = Self::parse(&expanded, path)?;
        config.validate()?;

        Ok(config)
    }

    fn parse(content: &str, path: &Path) -> Result<Self, Error> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        match extension.as_deref() {
            Some("yaml") | Some("yml") => serde_yaml::from_str(content)
                .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e))),
            Some("toml") => toml::from_str(content)
                .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e))),
            _ => serde_json::from_str(content)
                .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e))),
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.chains.is_empty() {
            return Err(Error::Config("At least one chain must be configured".to_string()));
        }

        let mut seen = HashSet::new();
        for chain in &self.chains {
            if !seen.insert(chain.chain_id) {
                return Err(Error::Config(format!("Duplicate chain id: {}", chain.chain_id)));
            }
            if chain.name.trim().is_empty() {
                return Err(Error::Config(format!("Chain {} has an empty name", chain.chain_id)));
            }
            if chain.rpc_url.trim().is_empty() {
                return Err(Error::Config(format!("Chain {} has an empty rpc_url", chain.name)));
            }
            if chain.max_block_range == Some(0) {
                return Err(Error::Config(format!(
                    "Chain {} max_block_range must be greater than 0",
                    chain.name
                )));
            }
        }

        if self.source_chains().next().is_none() {
            return Err(Error::Config("No chain has a source_contract to listen on".to_string()));
        }

        if self.relayer.private_key.trim().is_empty() {
            return Err(Error::Config("Relayer private key is empty".to_string()));
        }
        if self.relayer.poll_interval.is_zero() {
            return Err(Error::Config("Relayer poll interval must be greater than 0".to_string()));
        }
        if self.relayer.max_retries == 0 {
            return Err(Error::Config("Relayer max retries must be greater than 0".to_string()));
        }
        if self.relayer.gas_limit == 0 {
            return Err(Error::Config("Relayer gas limit must be greater than 0".to_string()));
        }
        if self.relayer.channel_capacity == 0 {
            return Err(Error::Config(
                "Relayer channel capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn chain(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.chain_id == chain_id)
    }

    pub fn source_chains(&self) -> impl Iterator<Item = &ChainConfig> {
        self.chains.iter().filter(|c| c.source_contract.is_some())
    }

    pub fn destination_chains(&self) -> impl Iterator<Item = &ChainConfig> {
        self.chains.iter().filter(|c| c.dest_contract.is_some())
    }
}

/// 展开 `${VAR}` 与 `$VAR`，未设置的变量替换为空串
fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('{') => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for n in chars.by_ref() {
                    if n == '}' {
                        closed = true;
                        break;
                    }
                    name.push(n);
                }
                if closed {
                    out.push_str(&std::env::var(&name).unwrap_or_default());
                } else {
                    out.push_str("${");
                    out.push_str(&name);
                }
            }
            Some(n) if n.is_ascii_alphabetic() || *n == '_' => {
                let mut name = String::new();
                while let Some(&n) = chars.peek() {
                    if n.is_ascii_alphanumeric() || n == '_' {
                        name.push(n);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&std::env::var(&name).unwrap_or_default());
            }
            _ => out.push('$'),
        }
    }

    out
}
