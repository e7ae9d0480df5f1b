use std::{
    borrow::Cow,
    cell::{Cell, RefCell},
    rc::{Rc, Weak},
};

use bytes::Bytes;
use veil_transport::{
    CloseCallback, ConnectCallback, DataCallback, EndCallback, ErrorCallback, Transport,
    TransportCallbacks, TransportError, TransportState,
};

use crate::{
    engine::CryptoEngine,
    error::{self, WRITE},
    session::{CloseReason, HandshakeStatus, SessionCallbacks, TlsSession},
};

/// 在任意下层传输之上提供 TLS 的组合传输。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 应用面对的仍是 [`Transport`] 契约，加密与否对应用透明；
/// - 应用在协商完成前绝不会看到“已连接”，也绝不会看到下层的原始密文。
///
/// ## 逻辑（How）
/// - 下层连接成功时通过引擎创建会话并立即握手；会话的握手完成事件才转成应用的 `on_connect`；
/// - 下层的入站数据全部交给 [`TlsSession::feed_read`]，会话解出的明文再交给应用的 `on_data`；
/// - 每个会话分配一个代号，会话回调只捕获 `Weak<TlsTransport>` 与代号；
///   会话被拆除或被新连接取代后，其迟到的事件因代号不符而被忽略；
/// - 应用的关闭回调由锁存标志保护：会话关闭与下层关闭无论先后，应用只看到一次。
///
/// ## 契约（What）
/// - `connect`：登记回调并让下层建连；
/// - `write`：交给会话加密，未完成握手时返回 `NotConnected`；[`Transport`] 没有写完成回调，
///   会话的写完成事件只记录 trace 日志，不会转交应用；
/// - `disconnect`：有会话时发送 close_notify 并随后断开下层，否则直接断开下层；
/// - `reconnect`：丢弃当前会话、重置关闭锁存，再让下层重连；
/// - 下层与会话的错误转交应用的 `on_error`，不会自动拆除连接；
/// - 下层的 EOF 通知应用的 `on_end`，并把应用的抑制决定原样交回下层。
///
/// ## 注意事项（Trade-offs）
/// - 会话关闭时立即断开下层，不等待对端回应 close_notify；
/// - 引擎建会话失败（例如双工通道分配失败）时报告错误并断开下层，随后以关闭收尾。
pub struct TlsTransport {
    this: Weak<TlsTransport>,
    lower: Rc<dyn Transport>,
    engine: Rc<dyn CryptoEngine>,
    session: RefCell<Option<Rc<TlsSession>>>,
    generation: Cell<u64>,
    state: Cell<TransportState>,
    close_reported: Cell<bool>,
    callbacks: TransportCallbacks,
}

impl TlsTransport {
    pub fn create(lower: Rc<dyn Transport>, engine: Rc<dyn CryptoEngine>) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            this: this.clone(),
            lower,
            engine,
            session: RefCell::new(None),
            generation: Cell::new(0),
            state: Cell::new(TransportState::Disconnected),
            close_reported: Cell::new(false),
            callbacks: TransportCallbacks::default(),
        })
    }

    pub fn lower(&self) -> &Rc<dyn Transport> {
        &self.lower
    }

    /// 当前会话；下层未连接或会话已拆除时为 `None`。
    pub fn session(&self) -> Option<Rc<TlsSession>> {
        self.session.borrow().clone()
    }

    /// 当前会话协商得到的 ALPN 协议。
    pub fn alpn_protocol(&self) -> Option<Bytes> {
        self.session().and_then(|session| session.alpn_protocol())
    }

    fn current(weak: &Weak<Self>, generation: u64) -> Option<Rc<Self>> {
        weak.upgrade()
            .filter(|transport| transport.generation.get() == generation)
    }

    /// 使旧会话的迟到事件失效，并取下当前会话。
    fn retire_session(&self) -> Option<Rc<TlsSession>> {
        self.generation.set(self.generation.get() + 1);
        self.session.borrow_mut().take()
    }

    fn finish_close(&self) {
        if self.close_reported.replace(true) {
            return;
        }
        self.state.set(TransportState::Closed);
        tracing::debug!(transport = %self.id(), "tls transport closed");
        self.callbacks.fire_close(self);
    }

    fn session_callbacks(&self, generation: u64) -> SessionCallbacks {
        let on_handshake = self.this.clone();
        let on_read = self.this.clone();
        let on_close = self.this.clone();
        let on_error = self.this.clone();
        SessionCallbacks::new()
            .on_handshake(move |_, status| {
                if let Some(transport) = Self::current(&on_handshake, generation) {
                    transport.handle_handshake(status);
                }
            })
            .on_write(move |session, len| {
                tracing::trace!(session = session.id(), len, "tls write complete");
            })
            .on_read(move |_, data| {
                if let Some(transport) = Self::current(&on_read, generation) {
                    transport.callbacks.fire_data(&*transport, data);
                }
            })
            .on_close(move |_, reason| {
                if let Some(transport) = Self::current(&on_close, generation) {
                    transport.handle_session_close(reason);
                }
            })
            .on_error(move |_, err| {
                if let Some(transport) = Self::current(&on_error, generation) {
                    transport.callbacks.fire_error(&*transport, err);
                }
            })
    }

    fn handle_lower_connected(&self) {
        let generation = self.generation.get() + 1;
        self.generation.set(generation);
        match self
            .engine
            .create_context(&self.lower, self.session_callbacks(generation))
        {
            Ok(session) => {
                tracing::debug!(
                    transport = %self.id(),
                    session = session.id(),
                    "lower connected; starting tls handshake"
                );
                *self.session.borrow_mut() = Some(Rc::clone(&session));
                session.handshake();
            }
            Err(err) => {
                tracing::warn!(transport = %self.id(), error = %err, "tls session creation failed");
                self.callbacks.fire_error(self, &err);
                self.lower.disconnect();
            }
        }
    }

    fn handle_handshake(&self, status: HandshakeStatus) {
        match status {
            HandshakeStatus::Negotiated => {
                self.state.set(TransportState::Connected);
                self.callbacks.fire_connect(self);
            }
            HandshakeStatus::ClosedDuringHandshake => {
                tracing::debug!(transport = %self.id(), "peer closed during handshake");
                self.handle_session_close(CloseReason::Peer);
            }
        }
    }

    fn handle_session_close(&self, reason: CloseReason) {
        tracing::debug!(transport = %self.id(), ?reason, "tls session ended; closing lower transport");
        self.retire_session();
        self.state.set(TransportState::Closing);
        self.lower.disconnect();
        self.finish_close();
    }

    fn handle_lower_data(&self, data: Bytes) {
        match self.session() {
            Some(session) => session.feed_read(data),
            None => {
                tracing::trace!(transport = %self.id(), len = data.len(), "ciphertext without session dropped");
            }
        }
    }

    fn handle_lower_end(&self) -> bool {
        if self.close_reported.get() {
            return false;
        }
        self.callbacks.fire_end(self)
    }

    fn handle_lower_closed(&self) {
        self.retire_session();
        self.finish_close();
    }
}

impl Transport for TlsTransport {
    fn id(&self) -> Cow<'_, str> {
        Cow::Owned(format!("tls+{}", self.lower.id()))
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }

    fn connect(&self, on_connect: ConnectCallback, on_close: CloseCallback, on_error: ErrorCallback) {
        self.callbacks.set_lifecycle(on_connect, on_close, on_error);
        self.close_reported.set(false);
        self.state.set(TransportState::Connecting);

        let data = self.this.clone();
        self.lower.on_data(Rc::new(move |_: &dyn Transport, bytes: Bytes| {
            if let Some(transport) = data.upgrade() {
                transport.handle_lower_data(bytes);
            }
        }));
        let end = self.this.clone();
        self.lower.on_end(Rc::new(move |_: &dyn Transport| {
            end.upgrade()
                .is_some_and(|transport| transport.handle_lower_end())
        }));
        let connected = self.this.clone();
        let closed = self.this.clone();
        let failed = self.this.clone();
        self.lower.connect(
            Rc::new(move |_: &dyn Transport| {
                if let Some(transport) = connected.upgrade() {
                    transport.handle_lower_connected();
                }
            }),
            Rc::new(move |_: &dyn Transport| {
                if let Some(transport) = closed.upgrade() {
                    transport.handle_lower_closed();
                }
            }),
            Rc::new(move |_: &dyn Transport, err: &TransportError| {
                if let Some(transport) = failed.upgrade() {
                    tracing::warn!(transport = %transport.id(), error = %err, "lower transport error");
                    transport.callbacks.fire_error(&*transport, err);
                }
            }),
        );
    }

    fn reconnect(&self) {
        if let Some(session) = self.retire_session() {
            tracing::debug!(session = session.id(), "tls session dropped for reconnect");
        }
        self.close_reported.set(false);
        self.state.set(TransportState::Connecting);
        self.lower.reconnect();
    }

    fn disconnect(&self) {
        if matches!(
            self.state.get(),
            TransportState::Closed | TransportState::Disconnected
        ) {
            return;
        }
        self.state.set(TransportState::Closing);
        match self.session() {
            Some(session) => session.disconnect(),
            None => self.lower.disconnect(),
        }
    }

    fn cleanup(&self) {
        self.callbacks.clear();
        self.disconnect();
        self.retire_session();
        self.lower.cleanup();
    }

    fn on_data(&self, callback: DataCallback) {
        self.callbacks.on_data.set(callback);
    }

    fn on_end(&self, callback: EndCallback) {
        self.callbacks.on_end.set(callback);
    }

    fn write(&self, data: Bytes) -> Result<(), TransportError> {
        if !self.state.get().is_connected() {
            return Err(error::not_connected_error(WRITE));
        }
        let session = self
            .session()
            .ok_or_else(|| error::not_connected_error(WRITE))?;
        session.write(data)
    }
}
