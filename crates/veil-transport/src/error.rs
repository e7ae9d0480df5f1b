use alloc::borrow::Cow;
use alloc::boxed::Box;
use thiserror::Error;

/// 传输错误的主要处置类别。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 让每一层（TCP 叶子传输、TLS 会话、组合传输）用同一套分类描述故障，
///   调用方无需认识 `rustls` 或 `io::Error` 即可决定是否断开或重连；
/// - 分类同时决定默认的数值错误码，保证没有底层 errno/Alert 时仍有稳定的机读编号。
///
/// ## 契约（What）
/// - `Io`：底层套接字错误，数值码取自操作系统 errno；
/// - `Protocol`：TLS 协议违规或收到致命 Alert，数值码优先取 Alert 字节；
/// - `Security`：证书/身份校验失败；
/// - `ResourceExhausted`：会话资源（例如双工通道缓冲）分配失败；
/// - `NotConnected`：在未连接状态调用了要求已连接的操作；
/// - `Config`：引擎或传输配置不合法。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    Io,
    Protocol,
    Security,
    ResourceExhausted,
    NotConnected,
    Config,
}

impl ErrorKind {
    /// 没有更具体编号时使用的数值错误码。
    pub const fn default_code(self) -> i32 {
        match self {
            ErrorKind::Io => -1,
            ErrorKind::Protocol => -100,
            ErrorKind::Security => -101,
            ErrorKind::ResourceExhausted => -102,
            ErrorKind::NotConnected => -103,
            ErrorKind::Config => -104,
        }
    }
}

/// 各层共享的错误值。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 统一“短名称 + 人类可读描述 + 数值码”三元组，任何层都不需要暴露库特定的异常类型；
/// - 通过 `source` 保留底层原因（`io::Error`、`rustls::Error` 等），便于日志展开完整链路。
///
/// ## 契约（What）
/// - `name`：稳定的机读名称，遵循 `veil.<层>.<语义>` 约定；
/// - `message`：面向排障人员的描述，不含敏感信息；
/// - `code`：数值码，默认取 [`ErrorKind::default_code`]，可用 [`Self::with_code`] 覆盖；
/// - 错误值本身总是代表一次真实失败；“无错误”由 `Result::Ok` / `Option::None` 表达。
///
/// ## 风险与权衡（Trade-offs）
/// - `source` 以 `Box<dyn Error>` 承载，因此该类型不实现 `Clone`；回调以引用形式接收错误即可。
#[derive(Debug, Error)]
#[error("{name}: {message}")]
pub struct TransportError {
    kind: ErrorKind,
    name: &'static str,
    message: Cow<'static, str>,
    code: i32,
    #[source]
    source: Option<Box<dyn core::error::Error + Send + Sync + 'static>>,
}

impl TransportError {
    /// 构造错误，数值码取分类默认值。
    pub fn new(kind: ErrorKind, name: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            name,
            message: message.into(),
            code: kind.default_code(),
            source: None,
        }
    }

    /// 以“未连接”分类构造错误，供各层的前置条件检查复用。
    pub fn not_connected(name: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::NotConnected, name, message)
    }

    /// 覆盖数值错误码（errno、TLS Alert 等）。
    pub fn with_code(mut self, code: i32) -> Self {
        self.code = code;
        self
    }

    /// 附带底层原因。
    pub fn with_source(
        mut self,
        source: impl core::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// 稳定的机读短名称。
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 人类可读描述。
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> i32 {
        self.code
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn display_combines_name_and_message() {
        let err = TransportError::new(ErrorKind::Protocol, "veil.test.failed", "boom");
        assert_eq!(err.to_string(), "veil.test.failed: boom");
        assert_eq!(err.code(), ErrorKind::Protocol.default_code());
    }

    #[test]
    fn explicit_code_and_source_are_preserved() {
        let io = std::io::Error::from_raw_os_error(111);
        let err = TransportError::new(ErrorKind::Io, "veil.test.io", "connect")
            .with_code(111)
            .with_source(io);
        assert_eq!(err.code(), 111);
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(core::error::Error::source(&err).is_some(), "底层原因应可追溯");
    }
}
