use std::rc::Rc;
use std::sync::Arc;

use rustls::{ClientConnection, ServerConnection};
use veil_transport::{Transport, TransportError};

use crate::{
    channel::DuplexChannel,
    config::{BuiltConfig, ConfigError, Role, TlsEngineConfig},
    error::{self, CREATE_CONTEXT},
    rustls_handle::RustlsHandle,
    session::{SessionCallbacks, TlsSession},
};

/// 会话工厂能力。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 组合传输只依赖“给定下层传输与回调，造出一个会话”这一项能力，
///   替换加密后端时实现本 trait 即可，会话状态机保持不变。
///
/// ## 契约（What）
/// - 返回的会话处于 `Idle`，调用方必须显式调用 [`TlsSession::handshake`]；
/// - 失败时返回 `Err`，不会触发任何回调；
/// - 会话只保存下层传输的弱引用，下层的生命周期仍由调用方掌控。
pub trait CryptoEngine {
    fn create_context(
        &self,
        lower: &Rc<dyn Transport>,
        callbacks: SessionCallbacks,
    ) -> Result<Rc<TlsSession>, TransportError>;
}

/// 基于 `rustls` 的加密引擎，进程内创建一次，供所有连接共享。
pub struct RustlsEngine {
    tls: BuiltConfig,
    channel_capacity: usize,
    read_chunk_size: usize,
}

impl RustlsEngine {
    /// 校验配置并构建引擎；证书与私钥文件在此时读取。
    pub fn create(config: &TlsEngineConfig) -> Result<Rc<Self>, ConfigError> {
        let tls = config.build()?;
        tracing::debug!(
            role = ?config.role,
            alpn = ?config.alpn,
            channel_capacity = config.channel_capacity,
            "tls engine created"
        );
        Ok(Rc::new(Self {
            tls,
            channel_capacity: config.channel_capacity,
            read_chunk_size: config.read_chunk_size,
        }))
    }

    pub fn role(&self) -> Role {
        match self.tls {
            BuiltConfig::Client { .. } => Role::Client,
            BuiltConfig::Server(_) => Role::Server,
        }
    }
}

impl CryptoEngine for RustlsEngine {
    fn create_context(
        &self,
        lower: &Rc<dyn Transport>,
        callbacks: SessionCallbacks,
    ) -> Result<Rc<TlsSession>, TransportError> {
        let channel = DuplexChannel::with_capacity(self.channel_capacity)
            .map_err(|err| error::channel_allocation_error(self.channel_capacity, err))?;
        let handle = match &self.tls {
            BuiltConfig::Client {
                config,
                server_name,
            } => ClientConnection::new(Arc::clone(config), server_name.clone())
                .map(|conn| RustlsHandle::new(conn, Role::Client)),
            BuiltConfig::Server(config) => ServerConnection::new(Arc::clone(config))
                .map(|conn| RustlsHandle::new(conn, Role::Server)),
        }
        .map_err(|err| error::map_rustls_error(CREATE_CONTEXT, err))?;
        Ok(TlsSession::new(
            Box::new(handle),
            channel,
            Rc::downgrade(lower),
            callbacks,
            self.read_chunk_size,
        ))
    }
}
