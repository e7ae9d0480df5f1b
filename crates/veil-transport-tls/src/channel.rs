use std::{
    collections::{TryReserveError, VecDeque},
    io,
};

use bytes::{Bytes, BytesMut};

/// 会话私有的内存双工通道，只承载原始 TLS 记录字节。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 加密引擎以同步方式读写“套接字”，而真实套接字由事件循环驱动；
///   以内存队列代替套接字后，引擎的每一步都不会阻塞线程；
/// - 入站、出站两条队列互不干扰：下层送来的密文进入 `inbound`，引擎产出的密文进入 `outbound`。
///
/// ## 逻辑（How）
/// - 构造时以 `try_reserve_exact` 预留两侧容量，分配失败以 [`TryReserveError`] 返回，
///   由引擎工厂转换为 `ResourceExhausted`；
/// - 引擎经 [`Self::inbound_reader`] 读取密文，经 [`Self::outbound_writer`] 写出密文；
///   写端扩容同样走可失败分配，失败时报告 `OutOfMemory`；
/// - 会话在每个加密步骤后调用 [`Self::take_outbound`] 把出站字节一次性取走并转发给下层。
///
/// ## 契约（What）
/// - `take_outbound` 返回后出站队列为空；
/// - 通道从不解析记录边界，字节按到达顺序原样进出。
#[derive(Debug, Default)]
pub struct DuplexChannel {
    inbound: VecDeque<u8>,
    outbound: VecDeque<u8>,
}

impl DuplexChannel {
    /// 预留两侧各 `capacity` 字节。
    pub fn with_capacity(capacity: usize) -> Result<Self, TryReserveError> {
        let mut inbound = VecDeque::new();
        inbound.try_reserve_exact(capacity)?;
        let mut outbound = VecDeque::new();
        outbound.try_reserve_exact(capacity)?;
        Ok(Self { inbound, outbound })
    }

    /// 追加下层送来的密文。
    pub fn push_inbound(&mut self, data: &[u8]) -> Result<(), TryReserveError> {
        self.inbound.try_reserve(data.len())?;
        self.inbound.extend(data);
        Ok(())
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    pub fn pending_outbound(&self) -> usize {
        self.outbound.len()
    }

    /// 取走全部待发送密文；队列为空时返回 `None`。
    pub fn take_outbound(&mut self) -> Option<Bytes> {
        if self.outbound.is_empty() {
            return None;
        }
        let (front, back) = self.outbound.as_slices();
        let mut buf = BytesMut::with_capacity(front.len() + back.len());
        buf.extend_from_slice(front);
        buf.extend_from_slice(back);
        self.outbound.clear();
        Some(buf.freeze())
    }

    /// 引擎读取入站密文的端点。队列为空时读到 0 字节，调用方需自行避免把它当作 EOF。
    pub fn inbound_reader(&mut self) -> &mut dyn io::Read {
        &mut self.inbound
    }

    pub fn outbound_writer(&mut self) -> OutboundWriter<'_> {
        OutboundWriter {
            queue: &mut self.outbound,
        }
    }
}

/// 出站队列的写端，扩容失败时返回 `OutOfMemory` 而非中止进程。
pub struct OutboundWriter<'a> {
    queue: &'a mut VecDeque<u8>,
}

impl io::Write for OutboundWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.queue
            .try_reserve(buf.len())
            .map_err(|err| io::Error::new(io::ErrorKind::OutOfMemory, err))?;
        self.queue.extend(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;

    #[test]
    fn outbound_is_drained_in_one_piece() {
        let mut channel = DuplexChannel::with_capacity(4).expect("小容量分配应成功");
        channel
            .outbound_writer()
            .write_all(b"abcdef")
            .expect("写入出站队列");
        assert_eq!(channel.pending_outbound(), 6);
        assert_eq!(channel.take_outbound().as_deref(), Some(&b"abcdef"[..]));
        assert_eq!(channel.pending_outbound(), 0);
        assert!(channel.take_outbound().is_none());
    }

    #[test]
    fn inbound_preserves_arrival_order() {
        let mut channel = DuplexChannel::default();
        channel.push_inbound(b"he").expect("追加入站字节");
        channel.push_inbound(b"llo").expect("追加入站字节");
        let mut out = Vec::new();
        channel
            .inbound_reader()
            .read_to_end(&mut out)
            .expect("读取入站字节");
        assert_eq!(out, b"hello");
        assert_eq!(channel.inbound_len(), 0);
    }

    #[test]
    fn oversized_reservation_fails_without_aborting() {
        assert!(DuplexChannel::with_capacity(usize::MAX).is_err());
    }
}
