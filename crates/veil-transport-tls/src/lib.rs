#![doc = r#"
# veil-transport-tls

## 设计动机（Why）
- **非阻塞加密**：事件驱动的下层传输按网络节奏送来任意切分的密文，而加密引擎以同步步骤工作；
  本 crate 用私有的内存双工通道把两者隔开，引擎的每一步都不会阻塞事件循环；
- **契约统一**：[`TlsTransport`] 本身实现 `veil-transport` 的 `Transport` 契约，
  应用对明文 TCP 与 TLS 链路使用同一套调用方式；
- **可替换后端**：会话状态机只面向 [`CryptoHandle`] 能力编写，引擎工厂抽象为 [`CryptoEngine`]。

## 核心契约（What）
- [`RustlsEngine`]：由 [`TlsEngineConfig`] 构建的进程级工厂，为每条连接创建一个 [`TlsSession`]；
- [`TlsSession`]：握手、解密、加密、关闭四类操作；每步之后立即把出站密文交给下层，
  握手完成与关闭通知各至多触发一次；
- [`TlsTransport`]：拥有下层传输与当前会话，握手完成后才向应用报告连接成功；
- 错误分类遵循 `Protocol`（协议违规/Alert）、`Security`（证书问题）、`ResourceExhausted`（通道分配失败）。

## 实现策略（How）
- 使用 `rustls` 的无 I/O 连接对象，经 `read_tls`/`write_tls` 与双工通道交换记录；
- 步骤结果严格归类为 `Done`/`WantRead`/`Retry`/`Closed`/`Fatal`，由状态机统一处置；
- 回调在释放内部借用后按序派发，回调中可以安全地重入会话或传输。

## 风险与考量（Trade-offs）
- 单线程模型：全部类型基于 `Rc`/`RefCell`，不能跨线程移动；
- 加密原语固定使用 `ring` 提供者，引擎不读取进程级默认提供者。
"#]

mod channel;
mod config;
mod engine;
mod error;
mod handle;
mod rustls_handle;
mod session;
mod transport;

pub use channel::{DuplexChannel, OutboundWriter};
pub use config::{ConfigError, MinProtocolVersion, Role, TlsEngineConfig};
pub use engine::{CryptoEngine, RustlsEngine};
pub use handle::{CryptoHandle, StepOutcome};
pub use session::{
    CloseReason, HandshakeCallback, HandshakeStatus, ReadCallback, SessionCallbacks,
    SessionCloseCallback, SessionErrorCallback, SessionState, TlsSession, WriteCallback,
};
pub use transport::TlsTransport;
