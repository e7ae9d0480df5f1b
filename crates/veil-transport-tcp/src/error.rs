use std::{borrow::Cow, io, time::Duration};

use veil_transport::{ErrorKind, TransportError};

use crate::config::TcpConfigError;

/// 描述一次底层操作对应的稳定错误名与默认文案。
#[derive(Clone, Copy)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "veil.transport.tcp.connect_failed",
    message: "tcp connect",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "veil.transport.tcp.read_failed",
    message: "tcp read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: "veil.transport.tcp.write_failed",
    message: "tcp write",
};
pub(crate) const SHUTDOWN: OperationKind = OperationKind {
    code: "veil.transport.tcp.shutdown_failed",
    message: "tcp shutdown",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "veil.transport.tcp.configure_failed",
    message: "tcp configure",
};

const TIMEOUT_CODE: &str = "veil.transport.tcp.timeout";
const NO_REMOTE_CODE: &str = "veil.transport.tcp.no_remote";
const INVALID_CONFIG_CODE: &str = "veil.transport.tcp.invalid_config";

/// 将 IO 错误映射为 [`TransportError`]，数值码取操作系统 errno。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> TransportError {
    let code = error
        .raw_os_error()
        .unwrap_or_else(|| ErrorKind::Io.default_code());
    TransportError::new(
        ErrorKind::Io,
        kind.code,
        Cow::Owned(format!("{} ({:?}): {}", kind.message, error.kind(), error)),
    )
    .with_code(code)
    .with_source(error)
}

/// 构造建连超时错误。
pub(crate) fn timeout_error(kind: OperationKind, after: Duration) -> TransportError {
    let message = format!("{} timed out after {:?}", kind.message, after);
    TransportError::new(ErrorKind::Io, TIMEOUT_CODE, message)
}

/// 未设置远端地址即尝试建连。
pub(crate) fn missing_remote_error() -> TransportError {
    TransportError::new(
        ErrorKind::Config,
        NO_REMOTE_CODE,
        "tcp connect without remote address; call set_remote first",
    )
}

/// 配置未通过校验，例如读缓冲为 0。
pub(crate) fn invalid_config_error(error: TcpConfigError) -> TransportError {
    TransportError::new(ErrorKind::Config, INVALID_CONFIG_CODE, error.to_string()).with_source(error)
}

/// 未连接时写入。
pub(crate) fn not_connected_error(kind: OperationKind) -> TransportError {
    TransportError::not_connected(kind.code, format!("{} while not connected", kind.message))
}
