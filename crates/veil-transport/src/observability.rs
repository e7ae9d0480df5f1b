use thiserror::Error;
use tracing::dispatcher;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

/// 安装全局 tracing Subscriber 时可能出现的错误。
#[derive(Debug, Error)]
pub enum ObservabilityError {
    /// 进程内已存在全局 Subscriber，拒绝覆盖。
    #[error("全局 tracing Subscriber 已存在，veil 不会覆盖")]
    SubscriberAlreadySet,
    /// 设置全局 Subscriber 的底层失败。
    #[error("设置 tracing 全局 Subscriber 失败: {0}")]
    SetGlobalSubscriber(#[from] tracing::dispatcher::SetGlobalDefaultError),
}

/// 安装 `fmt + EnvFilter` 组合的全局 Subscriber，默认级别为 `info`。
///
/// # 教案式说明
/// - **意图（Why）**：进程装配层只需调用一次即可看到会话状态迁移与 I/O 错误日志；
/// - **逻辑（How）**：优先读取 `RUST_LOG`，缺省时使用 `default_directive`；
/// - **契约（What）**：外部已设置 Subscriber 时返回 [`ObservabilityError::SubscriberAlreadySet`]。
pub fn install_tracing() -> Result<(), ObservabilityError> {
    install_tracing_with("info")
}

/// 与 [`install_tracing`] 相同，但允许指定缺省过滤指令（例如 `veil_transport_tls=debug`）。
pub fn install_tracing_with(default_directive: &str) -> Result<(), ObservabilityError> {
    if dispatcher::has_been_set() {
        return Err(ObservabilityError::SubscriberAlreadySet);
    }
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
