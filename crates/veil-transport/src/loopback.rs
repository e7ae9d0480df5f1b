//! 确定性的内存回环传输。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 为 TLS 会话与组合传输提供无需真实套接字的测试底座，复现“网络在任意时刻送达任意分片”的场景；
//! - 事件循环由调用方显式驱动（[`LoopbackPipe::run_until_idle`]），测试可以精确观察每个阶段的回调。
//!
//! ## 逻辑（How）
//! - 一对 [`LoopbackTransport`] 共享同一个事件队列；`connect`/`write`/`disconnect` 只入队事件，
//!   从不在调用内部同步触发回调，符合 [`Transport`] 的执行契约；
//! - 数据事件可按 `chunk_size` 切片，模拟与 TLS 记录边界不对齐的投递；
//! - 对端 EOF 先询问 `on_end`，未被抑制时再入队本端的关闭事件。
//!
//! ## 契约（What）
//! - 关闭回调对每条连接至多触发一次；投递给已关闭端点的事件被丢弃；
//! - 管道只弱引用两端，端点的生命周期由持有 `Rc` 的调用方决定。

use alloc::borrow::Cow;
use alloc::collections::VecDeque;
use alloc::rc::{Rc, Weak};
use core::cell::{Cell, RefCell};

use bytes::Bytes;

use crate::{
    CloseCallback, ConnectCallback, DataCallback, EndCallback, ErrorCallback, Transport,
    TransportCallbacks, TransportError, TransportState,
};

const WRITE: &str = "veil.transport.loopback.write_failed";

/// 回环管道的一端。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    A,
    B,
}

impl Side {
    fn peer(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }

    fn index(self) -> usize {
        match self {
            Side::A => 0,
            Side::B => 1,
        }
    }
}

#[derive(Debug)]
enum PipeEvent {
    Connected(Side),
    Data(Side, Bytes),
    End(Side),
    Closed(Side),
}

struct PipeShared {
    queue: RefCell<VecDeque<PipeEvent>>,
    ends: RefCell<[Weak<LoopbackTransport>; 2]>,
    chunk_size: Option<usize>,
}

impl PipeShared {
    fn push(&self, event: PipeEvent) {
        self.queue.borrow_mut().push_back(event);
    }

    fn end(&self, side: Side) -> Option<Rc<LoopbackTransport>> {
        self.ends.borrow()[side.index()].upgrade()
    }
}

/// 回环管道与其事件循环。
#[derive(Clone)]
pub struct LoopbackPipe {
    shared: Rc<PipeShared>,
}

impl LoopbackPipe {
    /// 创建按原样投递数据块的管道。
    pub fn new() -> Self {
        Self::build(None)
    }

    /// 创建把每个数据块切成至多 `chunk_size` 字节再投递的管道。
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self::build(Some(chunk_size.max(1)))
    }

    fn build(chunk_size: Option<usize>) -> Self {
        Self {
            shared: Rc::new(PipeShared {
                queue: RefCell::new(VecDeque::new()),
                ends: RefCell::new([Weak::new(), Weak::new()]),
                chunk_size,
            }),
        }
    }

    /// 创建管道两端；再次调用会替换旧端点。
    pub fn open(&self) -> (Rc<LoopbackTransport>, Rc<LoopbackTransport>) {
        let a = Rc::new(LoopbackTransport::new(Side::A, Rc::clone(&self.shared)));
        let b = Rc::new(LoopbackTransport::new(Side::B, Rc::clone(&self.shared)));
        *self.shared.ends.borrow_mut() = [Rc::downgrade(&a), Rc::downgrade(&b)];
        (a, b)
    }

    /// 尚未投递的事件数。
    pub fn pending(&self) -> usize {
        self.shared.queue.borrow().len()
    }

    /// 投递队首事件；队列为空时返回 `false`。
    pub fn step(&self) -> bool {
        let event = self.shared.queue.borrow_mut().pop_front();
        match event {
            Some(event) => {
                self.deliver(event);
                true
            }
            None => false,
        }
    }

    /// 运行事件循环直到队列清空，返回投递的事件数。
    pub fn run_until_idle(&self) -> usize {
        let mut delivered = 0;
        while self.step() {
            delivered += 1;
        }
        delivered
    }

    fn deliver(&self, event: PipeEvent) {
        tracing::trace!(?event, "loopback deliver");
        match event {
            PipeEvent::Connected(side) => {
                if let Some(end) = self.shared.end(side) {
                    end.handle_connected();
                }
            }
            PipeEvent::Data(side, data) => {
                if let Some(end) = self.shared.end(side) {
                    end.handle_data(data);
                }
            }
            PipeEvent::End(side) => {
                if let Some(end) = self.shared.end(side) {
                    end.handle_end();
                }
            }
            PipeEvent::Closed(side) => {
                if let Some(end) = self.shared.end(side) {
                    end.handle_closed();
                }
            }
        }
    }
}

impl Default for LoopbackPipe {
    fn default() -> Self {
        Self::new()
    }
}

/// 回环管道的一个端点，实现 [`Transport`] 契约。
pub struct LoopbackTransport {
    side: Side,
    shared: Rc<PipeShared>,
    state: Cell<TransportState>,
    close_reported: Cell<bool>,
    writes: Cell<usize>,
    callbacks: TransportCallbacks,
}

impl LoopbackTransport {
    fn new(side: Side, shared: Rc<PipeShared>) -> Self {
        Self {
            side,
            shared,
            state: Cell::new(TransportState::Disconnected),
            close_reported: Cell::new(false),
            writes: Cell::new(0),
            callbacks: TransportCallbacks::default(),
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// 成功调用 `write` 的次数。
    pub fn write_count(&self) -> usize {
        self.writes.get()
    }

    fn handle_connected(&self) {
        if self.state.get() != TransportState::Connecting {
            return;
        }
        self.state.set(TransportState::Connected);
        self.callbacks.fire_connect(self);
    }

    fn handle_data(&self, data: Bytes) {
        if matches!(
            self.state.get(),
            TransportState::Closed | TransportState::Disconnected
        ) {
            tracing::trace!(side = ?self.side, len = data.len(), "loopback drop data on closed end");
            return;
        }
        self.callbacks.fire_data(self, data);
    }

    fn handle_end(&self) {
        if matches!(
            self.state.get(),
            TransportState::Closed | TransportState::Disconnected
        ) {
            return;
        }
        if !self.callbacks.fire_end(self) {
            self.state.set(TransportState::Closing);
            self.shared.push(PipeEvent::Closed(self.side));
        }
    }

    fn handle_closed(&self) {
        self.state.set(TransportState::Closed);
        if !self.close_reported.replace(true) {
            self.callbacks.fire_close(self);
        }
    }
}

impl Transport for LoopbackTransport {
    fn id(&self) -> Cow<'_, str> {
        Cow::Owned(alloc::format!("loopback:{:?}", self.side))
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }

    fn connect(&self, on_connect: ConnectCallback, on_close: CloseCallback, on_error: ErrorCallback) {
        self.callbacks.set_lifecycle(on_connect, on_close, on_error);
        self.reconnect();
    }

    fn reconnect(&self) {
        self.state.set(TransportState::Connecting);
        self.close_reported.set(false);
        self.shared.push(PipeEvent::Connected(self.side));
    }

    fn disconnect(&self) {
        match self.state.get() {
            TransportState::Connected | TransportState::Connecting => {
                self.state.set(TransportState::Closing);
                self.shared.push(PipeEvent::End(self.side.peer()));
                self.shared.push(PipeEvent::Closed(self.side));
            }
            _ => {}
        }
    }

    fn cleanup(&self) {
        self.disconnect();
        self.callbacks.clear();
    }

    fn on_data(&self, callback: DataCallback) {
        self.callbacks.on_data.set(callback);
    }

    fn on_end(&self, callback: EndCallback) {
        self.callbacks.on_end.set(callback);
    }

    fn write(&self, data: Bytes) -> Result<(), TransportError> {
        if !self.state.get().is_connected() {
            return Err(TransportError::not_connected(
                WRITE,
                "loopback write while not connected",
            ));
        }
        self.writes.set(self.writes.get() + 1);
        let peer = self.side.peer();
        match self.shared.chunk_size {
            Some(size) => {
                let mut rest = data;
                while !rest.is_empty() {
                    let take = size.min(rest.len());
                    self.shared.push(PipeEvent::Data(peer, rest.split_to(take)));
                }
            }
            None => self.shared.push(PipeEvent::Data(peer, data)),
        }
        Ok(())
    }
}
