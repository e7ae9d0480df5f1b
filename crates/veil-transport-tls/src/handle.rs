use bytes::Bytes;
use veil_transport::TransportError;

use crate::{channel::DuplexChannel, config::Role};

/// 单个加密步骤的归类结果。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 会话状态机只认识这五种结果，任何后端都必须把自身返回值严格映射到其中之一，
///   状态机因此不需要知道底层库的错误码。
///
/// ## 契约（What）
/// - `Done(n)`：步骤成功。握手步骤表示协商完成（`n` 恒为 0），读步骤表示解出 `n` 字节明文，
///   写步骤表示接收了 `n` 字节明文，关闭步骤表示 close_notify 已写入通道；
///   读步骤的 `Done(0)` 按对端关闭处理，写步骤的 `Done(0)` 结束本次写入循环；
/// - `WantRead`：需要更多入站密文，等待下一次 `feed_read`；
/// - `Retry`：非致命的暂时失败（例如引擎发送缓冲已满），安静返回；
/// - `Closed`：对端的 close_notify 已处理（读步骤、握手步骤），或本端已关闭后仍尝试写入；
/// - `Fatal`：致命错误，会话不可再用。
#[derive(Debug)]
pub enum StepOutcome {
    Done(usize),
    WantRead,
    Retry,
    Closed,
    Fatal(TransportError),
}

/// 加密后端对会话状态机暴露的能力集合。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 状态机只面向该 trait 编写，替换加密库时无需改动状态机；
/// - 每个步骤都以 [`DuplexChannel`] 为唯一 I/O 端点，步骤本身不会阻塞。
///
/// ## 契约（What）
/// - 步骤内部可以向通道出站侧写入任意字节，调用方负责在步骤返回后立刻取走；
/// - `read_step` 只在握手完成后调用；`write_step` 只在握手完成且本端未关闭时有意义；
/// - 返回 `Fatal` 之后不得再调用任何步骤。
pub trait CryptoHandle {
    /// 进入协商模式，返回本端角色（客户端主动发起，服务端等待 ClientHello）。
    fn begin_negotiation(&mut self) -> Role;

    fn handshake_step(&mut self, channel: &mut DuplexChannel) -> StepOutcome;

    fn read_step(&mut self, channel: &mut DuplexChannel, buf: &mut [u8]) -> StepOutcome;

    fn write_step(&mut self, channel: &mut DuplexChannel, plaintext: &[u8]) -> StepOutcome;

    fn shutdown_step(&mut self, channel: &mut DuplexChannel) -> StepOutcome;

    fn is_handshake_finished(&self) -> bool;

    /// 协商得到的 ALPN 协议；未协商时为 `None`。
    fn alpn_protocol(&self) -> Option<Bytes> {
        None
    }
}
