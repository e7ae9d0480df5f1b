use std::{net::SocketAddr, time::Duration};

use serde::Deserialize;
use thiserror::Error;

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_READ_BUFFER: usize = 16 * 1024;

/// TCP 叶子传输的配置。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 将远端地址、建连超时与套接字选项集中在一个可序列化结构中，进程装配层可直接从 TOML 读取；
/// - 时间以毫秒整数表达，避免 TOML 中出现 `{ secs, nanos }` 形式的嵌套表。
///
/// ## 契约（What）
/// - `remote`：目标地址；未设置时建连会以 `Config` 类错误失败；
/// - `connect_timeout_ms`：单次建连的超时上限；
/// - `nodelay`：是否关闭 Nagle 算法，TLS 握手的多次小写入受益于此；
/// - `keepalive_secs`：TCP keepalive 空闲时间，`None` 表示沿用系统默认；
/// - `read_buffer_size`：每次读取预留的缓冲大小。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TcpTransportConfig {
    pub remote: Option<SocketAddr>,
    pub connect_timeout_ms: u64,
    pub nodelay: bool,
    pub keepalive_secs: Option<u64>,
    pub read_buffer_size: usize,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            remote: None,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            nodelay: true,
            keepalive_secs: None,
            read_buffer_size: DEFAULT_READ_BUFFER,
        }
    }
}

/// 解析 TCP 配置失败。
#[derive(Debug, Error)]
pub enum TcpConfigError {
    #[error("解析 TCP 传输配置失败: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("read_buffer_size 必须大于 0")]
    ZeroReadBuffer,
}

impl TcpTransportConfig {
    /// 以目标地址构造配置，其余字段取默认值。
    pub fn new(remote: SocketAddr) -> Self {
        Self {
            remote: Some(remote),
            ..Self::default()
        }
    }

    /// 从 TOML 文本解析配置。
    pub fn from_toml_str(text: &str) -> Result<Self, TcpConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_keepalive(mut self, idle: Option<Duration>) -> Self {
        self.keepalive_secs = idle.map(|idle| idle.as_secs());
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn keepalive(&self) -> Option<Duration> {
        self.keepalive_secs.map(Duration::from_secs)
    }

    pub(crate) fn validate(&self) -> Result<(), TcpConfigError> {
        if self.read_buffer_size == 0 {
            return Err(TcpConfigError::ZeroReadBuffer);
        }
        Ok(())
    }
}
