#![doc = r#"
# veil-transport-tcp

## 设计动机（Why）
- **定位**：提供运行在 Tokio `LocalSet` 上的 TCP 叶子传输，作为 TLS 组合传输最常见的下层。
- **架构角色**：实现 `veil-transport` 的 [`Transport`](veil_transport::Transport) 契约，
  把套接字的建连、读写、EOF 与关闭翻译成回调。
- **设计理念**：回调与 TLS 会话同处单线程，结构体内部只用 `Cell`/`RefCell`，不引入锁。

## 核心契约（What）
- **输入条件**：调用方在 `LocalSet` 中驱动本传输，并在建连前通过配置或
  [`TcpTransport::set_remote`] 指定远端；
- **输出保障**：I/O 失败映射为带稳定错误名与 errno 的 `TransportError`，
  每条连接的关闭回调恰好触发一次；
- **前置约束**：本 crate 只负责主动建连，监听端不在范围内。

## 实现策略（How）
- **执行框架**：`spawn_local` 启动连接任务，任务内以 `tokio::select!` 复用写队列、关闭信号与读取；
- **套接字选项**：`TCP_NODELAY` 经 Tokio 设置，keepalive 经 `socket2::SockRef` 设置；
- **配置装配**：[`TcpTransportConfig`] 支持 `serde` + `toml` 反序列化。

## 风险与考量（Trade-offs）
- **写队列无界**：`write` 从不阻塞也从不丢弃，背压需要由上层协议自行约束；
- **重连语义**：`reconnect` 直接中止旧任务，旧连接上未发出的数据随之丢弃。
"#]

mod config;
mod error;
mod transport;

pub use config::{TcpConfigError, TcpTransportConfig};
pub use transport::TcpTransport;
