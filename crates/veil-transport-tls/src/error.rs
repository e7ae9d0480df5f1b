use std::{borrow::Cow, collections::TryReserveError, io};

use rustls::{AlertDescription, Error as RustlsError};
use veil_transport::{ErrorKind, TransportError};

/// TLS 会话错误映射模块。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 将 `rustls`/IO 层的错误统一映射到 [`ErrorKind`]，调用方据此决定断开、重连或告警；
/// - 提供稳定错误名与文案，测试与运维脚本无需解析底层库细节即可定位问题。
///
/// ## 逻辑（How）
/// - `OperationKind` 描述一类会话步骤（握手/读/写/冲刷/关闭/建会话）的错误名与默认文案；
/// - `map_rustls_error`/`map_io_error` 推导分类与数值码，生成 [`TransportError`]；
/// - `categorize_rustls_error` 按错误变体细分为 `Protocol`、`Security` 或 `ResourceExhausted`，
///   `alert_to_kind` 针对 TLS Alert 做进一步细化。
///
/// ## 契约（What）
/// - 收到 Alert 时数值码为 Alert 字节，其余情况取分类默认码；
/// - IO 错误若内嵌 `rustls::Error`，按 TLS 语义分类。
///
/// ## 风险与权衡（Trade-offs）
/// - `rustls::Error::General` 等泛型错误归入 `Protocol`，避免误判为安全事件；
/// - 未穷举的 Alert 同样归入 `Protocol`，后续若需更精确分类可在此集中扩展。
#[derive(Clone, Copy)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const HANDSHAKE: OperationKind = OperationKind {
    code: "veil.transport.tls.handshake_failed",
    message: "tls handshake",
};

pub(crate) const READ: OperationKind = OperationKind {
    code: "veil.transport.tls.read_failed",
    message: "tls read",
};

pub(crate) const WRITE: OperationKind = OperationKind {
    code: "veil.transport.tls.write_failed",
    message: "tls write",
};

pub(crate) const FLUSH: OperationKind = OperationKind {
    code: "veil.transport.tls.flush_failed",
    message: "tls flush",
};

pub(crate) const SHUTDOWN: OperationKind = OperationKind {
    code: "veil.transport.tls.shutdown_failed",
    message: "tls shutdown",
};

pub(crate) const CREATE_CONTEXT: OperationKind = OperationKind {
    code: "veil.transport.tls.create_context_failed",
    message: "tls create context",
};

const CHANNEL_ALLOC_CODE: &str = "veil.transport.tls.channel_alloc_failed";

/// 将 `rustls::Error` 映射为 [`TransportError`]。
pub(crate) fn map_rustls_error(kind: OperationKind, error: RustlsError) -> TransportError {
    let (category, code) = categorize_rustls_error(&error);
    TransportError::new(
        category,
        kind.code,
        Cow::Owned(format!("{}: {}", kind.message, error)),
    )
    .with_code(code)
    .with_source(error)
}

/// 将双工通道或明文读取上的 `io::Error` 映射为 [`TransportError`]。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> TransportError {
    let (category, code) = categorize_with_rustls(&error);
    TransportError::new(
        category,
        kind.code,
        Cow::Owned(format!("{} ({:?}): {}", kind.message, error.kind(), error)),
    )
    .with_code(code)
    .with_source(error)
}

/// 在非 `Established` 状态写入。
pub(crate) fn not_connected_error(kind: OperationKind) -> TransportError {
    TransportError::not_connected(
        kind.code,
        format!("{} before handshake completed or after close", kind.message),
    )
}

/// 双工通道缓冲分配失败。
pub(crate) fn channel_allocation_error(capacity: usize, error: TryReserveError) -> TransportError {
    TransportError::new(
        ErrorKind::ResourceExhausted,
        CHANNEL_ALLOC_CODE,
        format!("allocating duplex channel of {capacity} bytes failed"),
    )
    .with_source(error)
}

fn categorize_with_rustls(error: &io::Error) -> (ErrorKind, i32) {
    if let Some(source) = error.get_ref()
        && let Some(rustls_error) = source.downcast_ref::<RustlsError>()
    {
        return categorize_rustls_error(rustls_error);
    }
    categorize_io_error(error)
}

fn categorize_rustls_error(error: &RustlsError) -> (ErrorKind, i32) {
    use RustlsError::*;
    let kind = match error {
        InappropriateMessage { .. }
        | InappropriateHandshakeMessage { .. }
        | InvalidEncryptedClientHello(_)
        | InvalidMessage(_)
        | PeerMisbehaved(_)
        | DecryptError
        | EncryptError
        | PeerSentOversizedRecord
        | PeerIncompatible(_)
        | HandshakeNotComplete
        | General(_)
        | Other(_) => ErrorKind::Protocol,
        NoCertificatesPresented
        | InvalidCertificate(_)
        | InvalidCertRevocationList(_)
        | UnsupportedNameType
        | NoApplicationProtocol => ErrorKind::Security,
        FailedToGetCurrentTime
        | FailedToGetRandomBytes
        | BadMaxFragmentSize
        | InconsistentKeys(_) => ErrorKind::ResourceExhausted,
        AlertReceived(alert) => return (alert_to_kind(*alert), i32::from(u8::from(*alert))),
        _ => ErrorKind::Protocol,
    };
    (kind, kind.default_code())
}

fn alert_to_kind(alert: AlertDescription) -> ErrorKind {
    use AlertDescription::*;
    match alert {
        BadCertificate
        | UnsupportedCertificate
        | CertificateRevoked
        | CertificateExpired
        | CertificateUnknown
        | UnknownCA
        | NoCertificate
        | CertificateUnobtainable
        | CertificateRequired
        | AccessDenied => ErrorKind::Security,
        DecompressionFailure => ErrorKind::ResourceExhausted,
        _ => ErrorKind::Protocol,
    }
}

fn categorize_io_error(error: &io::Error) -> (ErrorKind, i32) {
    let kind = match error.kind() {
        io::ErrorKind::WriteZero | io::ErrorKind::OutOfMemory => ErrorKind::ResourceExhausted,
        _ => ErrorKind::Io,
    };
    (kind, error.raw_os_error().unwrap_or_else(|| kind.default_code()))
}
