use std::io::{self, BufRead, Write};

use bytes::Bytes;
use rustls::Connection;
use veil_transport::TransportError;

use crate::{
    channel::DuplexChannel,
    config::Role,
    error::{self, FLUSH, HANDSHAKE, OperationKind, READ, SHUTDOWN, WRITE},
    handle::{CryptoHandle, StepOutcome},
};

/// 基于 `rustls` 无 I/O 接口的加密句柄。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - `rustls` 的连接对象本身不做 I/O，只通过 `read_tls`/`write_tls` 与任意读写端交换密文，
///   正好与内存双工通道契合；
/// - 客户端与服务端连接统一收敛为 [`rustls::Connection`]，状态机无需区分角色。
///
/// ## 逻辑（How）
/// - `pump`：先把引擎待发送的密文写入通道出站侧，再在入站侧有数据且引擎愿意读取时，
///   交替执行 `read_tls` 与 `process_new_packets`；
/// - 引擎报告协议错误时，`rustls` 已排队一条致命 Alert，这里尽力把它写入通道后再返回 `Fatal`；
/// - 结果归类严格如下：
///   - 读步骤：每步至多取出一条记录的明文（`reader().fill_buf()` 的首块，截断到 `buf` 长度），
///     取到空块记为 `Closed`，`WouldBlock` 记为 `WantRead`，其余 IO 错误记为 `Fatal`；
///   - 写步骤：本端已发送 close_notify 后记为 `Closed`，接收 0 字节记为 `Retry`；
///   - 握手步骤：握手结束记为 `Done(0)`，握手中收到 close_notify 记为 `Closed`，否则 `WantRead`。
///
/// ## 注意事项（Trade-offs）
/// - 入站侧为空时绝不调用 `read_tls`：空队列读到 0 字节会被 `rustls` 视为 TCP EOF；
/// - 引擎持有未读明文时 `wants_read` 为假，剩余密文留在通道里，待明文读走后的下一步再处理；
/// - 不用 `Reader::read`：它会把同一批解密出的多条记录合并成一次交付，交付序列便随密文切分而变。
pub struct RustlsHandle {
    conn: Connection,
    role: Role,
    local_closed: bool,
    peer_closed: bool,
}

impl RustlsHandle {
    pub(crate) fn new(conn: impl Into<Connection>, role: Role) -> Self {
        Self {
            conn: conn.into(),
            role,
            local_closed: false,
            peer_closed: false,
        }
    }

    fn flush(
        &mut self,
        channel: &mut DuplexChannel,
        kind: OperationKind,
    ) -> Result<(), TransportError> {
        while self.conn.wants_write() {
            self.conn
                .write_tls(&mut channel.outbound_writer())
                .map_err(|err| error::map_io_error(kind, err))?;
        }
        Ok(())
    }

    fn pump(&mut self, channel: &mut DuplexChannel, kind: OperationKind) -> Result<(), TransportError> {
        loop {
            self.flush(channel, FLUSH)?;
            if channel.inbound_len() == 0 || !self.conn.wants_read() {
                return Ok(());
            }
            self.conn
                .read_tls(channel.inbound_reader())
                .map_err(|err| error::map_io_error(kind, err))?;
            match self.conn.process_new_packets() {
                Ok(state) => {
                    if state.peer_has_closed() {
                        self.peer_closed = true;
                    }
                }
                Err(err) => {
                    if let Err(alert) = self.flush(channel, FLUSH) {
                        tracing::debug!(error = %alert, "failed to queue fatal alert");
                    }
                    return Err(error::map_rustls_error(kind, err));
                }
            }
        }
    }
}

impl CryptoHandle for RustlsHandle {
    fn begin_negotiation(&mut self) -> Role {
        self.role
    }

    fn handshake_step(&mut self, channel: &mut DuplexChannel) -> StepOutcome {
        if let Err(err) = self.pump(channel, HANDSHAKE) {
            return StepOutcome::Fatal(err);
        }
        if !self.conn.is_handshaking() {
            StepOutcome::Done(0)
        } else if self.peer_closed {
            StepOutcome::Closed
        } else {
            StepOutcome::WantRead
        }
    }

    fn read_step(&mut self, channel: &mut DuplexChannel, buf: &mut [u8]) -> StepOutcome {
        if let Err(err) = self.pump(channel, READ) {
            return StepOutcome::Fatal(err);
        }
        let mut reader = self.conn.reader();
        let n = match reader.fill_buf() {
            Ok(record) if record.is_empty() => return StepOutcome::Closed,
            Ok(record) => {
                let n = record.len().min(buf.len());
                buf[..n].copy_from_slice(&record[..n]);
                n
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return StepOutcome::WantRead,
            Err(err) => return StepOutcome::Fatal(error::map_io_error(READ, err)),
        };
        reader.consume(n);
        StepOutcome::Done(n)
    }

    fn write_step(&mut self, channel: &mut DuplexChannel, plaintext: &[u8]) -> StepOutcome {
        if self.local_closed {
            return StepOutcome::Closed;
        }
        let accepted = match self.conn.writer().write(plaintext) {
            Ok(accepted) => accepted,
            Err(err) => return StepOutcome::Fatal(error::map_io_error(WRITE, err)),
        };
        if let Err(err) = self.flush(channel, WRITE) {
            return StepOutcome::Fatal(err);
        }
        if accepted == 0 && !plaintext.is_empty() {
            StepOutcome::Retry
        } else {
            StepOutcome::Done(accepted)
        }
    }

    fn shutdown_step(&mut self, channel: &mut DuplexChannel) -> StepOutcome {
        if !self.local_closed {
            self.conn.send_close_notify();
            self.local_closed = true;
        }
        match self.flush(channel, SHUTDOWN) {
            Ok(()) => StepOutcome::Done(0),
            Err(err) => StepOutcome::Fatal(err),
        }
    }

    fn is_handshake_finished(&self) -> bool {
        !self.conn.is_handshaking()
    }

    fn alpn_protocol(&self) -> Option<Bytes> {
        self.conn.alpn_protocol().map(Bytes::copy_from_slice)
    }
}
