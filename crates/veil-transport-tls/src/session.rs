use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::{Rc, Weak},
    sync::atomic::{AtomicU64, Ordering},
};

use bytes::{Bytes, BytesMut};
use veil_transport::{Transport, TransportError};

use crate::{
    channel::DuplexChannel,
    error::{self, WRITE},
    handle::{CryptoHandle, StepOutcome},
};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// 会话状态。`Failed` 一旦进入便不再离开。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Handshaking,
    Established,
    ShuttingDown,
    Closed,
    Failed,
}

/// 握手完成回调携带的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// 协商成功，可以收发明文。
    Negotiated,
    /// 协商过程中对端发送了 close_notify。
    ClosedDuringHandshake,
}

/// 关闭回调携带的原因。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// 本端调用了 [`TlsSession::disconnect`]。
    Local,
    /// 解密步骤观察到对端的 close_notify。
    Peer,
    /// 致命错误后没有任何待发字节，按关闭处理。
    Fatal,
}

pub type HandshakeCallback = Rc<dyn Fn(&TlsSession, HandshakeStatus)>;
pub type WriteCallback = Rc<dyn Fn(&TlsSession, usize)>;
pub type ReadCallback = Rc<dyn Fn(&TlsSession, Bytes)>;
pub type SessionCloseCallback = Rc<dyn Fn(&TlsSession, CloseReason)>;
pub type SessionErrorCallback = Rc<dyn Fn(&TlsSession, &TransportError)>;

/// 会话的五个回调，创建会话时一次性交给引擎。
#[derive(Clone, Default)]
pub struct SessionCallbacks {
    on_handshake: Option<HandshakeCallback>,
    on_write: Option<WriteCallback>,
    on_read: Option<ReadCallback>,
    on_close: Option<SessionCloseCallback>,
    on_error: Option<SessionErrorCallback>,
}

impl SessionCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_handshake(mut self, callback: impl Fn(&TlsSession, HandshakeStatus) + 'static) -> Self {
        self.on_handshake = Some(Rc::new(callback));
        self
    }

    pub fn on_write(mut self, callback: impl Fn(&TlsSession, usize) + 'static) -> Self {
        self.on_write = Some(Rc::new(callback));
        self
    }

    pub fn on_read(mut self, callback: impl Fn(&TlsSession, Bytes) + 'static) -> Self {
        self.on_read = Some(Rc::new(callback));
        self
    }

    pub fn on_close(mut self, callback: impl Fn(&TlsSession, CloseReason) + 'static) -> Self {
        self.on_close = Some(Rc::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&TlsSession, &TransportError) + 'static) -> Self {
        self.on_error = Some(Rc::new(callback));
        self
    }
}

impl fmt::Debug for SessionCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCallbacks")
            .field("on_handshake", &self.on_handshake.is_some())
            .field("on_write", &self.on_write.is_some())
            .field("on_read", &self.on_read.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// 步骤执行期间积攒、在释放内部借用后才派发的事件。
enum Notice {
    Forward(Bytes),
    Handshake(HandshakeStatus),
    Written(usize),
    Data(Bytes),
    Error(TransportError),
    Close(CloseReason),
}

struct SessionCore {
    state: SessionState,
    handle: Box<dyn CryptoHandle>,
    channel: DuplexChannel,
}

impl SessionCore {
    /// 取走出站侧全部密文并登记转发，返回字节数。
    fn drain(&mut self, notices: &mut Vec<Notice>) -> usize {
        match self.channel.take_outbound() {
            Some(bytes) => {
                let len = bytes.len();
                notices.push(Notice::Forward(bytes));
                len
            }
            None => 0,
        }
    }

    fn fail(&mut self, error: TransportError, forwarded: usize, notices: &mut Vec<Notice>) {
        self.state = SessionState::Failed;
        notices.push(Notice::Error(error));
        if forwarded == 0 {
            notices.push(Notice::Close(CloseReason::Fatal));
        }
    }
}

/// TLS 会话：把事件驱动的下层传输桥接到同步的加密步骤。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 下层按网络节奏送来任意切分的密文，加密引擎却以“一步一步”的同步方式工作；
///   会话把所有记录字节经私有的 [`DuplexChannel`] 中转，引擎每一步都不会阻塞；
/// - 每个步骤结束后立即清空出站侧并写给下层，任何密文都不会滞留在会话内部。
///
/// ## 逻辑（How）
/// - 状态机：`Idle → Handshaking → Established → ShuttingDown → Closed`，致命错误进入 `Failed`；
/// - 每个公开操作在 `RefCell` 借用内执行加密步骤，把转发、回调等事件压入 `Notice` 队列；
///   借用释放后再按顺序派发，因此回调可以安全地回调本会话或上层传输；
/// - 握手完成与关闭各由一个锁存标志保证至多派发一次，关闭之后的明文一律丢弃。
///
/// ## 契约（What）
/// - [`Self::handshake`]：进入协商模式并执行一步握手；
/// - [`Self::feed_read`]：追加密文，未完成握手时重新驱动握手，已完成则循环解密直到引擎需要更多输入；
///   解密得到 0 字节等同于收到对端的 close_notify；
/// - [`Self::write`]：仅在 `Established` 下可用，循环加密直到明文全部被接收，再报告写完成；
///   某一步接收 0 字节即停止：通道为空视为对端已关闭，报告关闭而非写完成，
///   否则按暂时失败处理，只在已接收部分字节时报告写完成；
/// - [`Self::disconnect`]：发送 close_notify 并立即报告关闭，不等待对端确认；
/// - 会话只保存下层传输的弱引用；下层已释放时，待转发的密文被丢弃并记录日志。
///
/// ## 注意事项（Trade-offs）
/// - 回调在触发它的操作返回前同步派发；调用方若在回调中释放会话，必须先持有自己的 `Rc` 副本；
/// - 本端关闭后仍会解密对端送来的记录，用于消化对端的 close_notify，但不会再交付明文。
pub struct TlsSession {
    id: u64,
    core: RefCell<SessionCore>,
    lower: Weak<dyn Transport>,
    callbacks: SessionCallbacks,
    handshake_reported: Cell<bool>,
    close_reported: Cell<bool>,
    read_chunk_size: usize,
}

impl TlsSession {
    /// 组装会话；供 [`crate::CryptoEngine`] 的实现调用，返回的会话处于 `Idle`。
    pub fn new(
        handle: Box<dyn CryptoHandle>,
        channel: DuplexChannel,
        lower: Weak<dyn Transport>,
        callbacks: SessionCallbacks,
        read_chunk_size: usize,
    ) -> Rc<Self> {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(session = id, "tls session created");
        Rc::new(Self {
            id,
            core: RefCell::new(SessionCore {
                state: SessionState::Idle,
                handle,
                channel,
            }),
            lower,
            callbacks,
            handshake_reported: Cell::new(false),
            close_reported: Cell::new(false),
            read_chunk_size,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.core.borrow().state
    }

    pub fn is_handshake_finished(&self) -> bool {
        self.core.borrow().handle.is_handshake_finished()
    }

    /// 出站侧尚未取走的字节数；在任何公开操作返回后恒为 0。
    pub fn pending_outbound(&self) -> usize {
        self.core.borrow().channel.pending_outbound()
    }

    /// 协商得到的 ALPN 协议。
    pub fn alpn_protocol(&self) -> Option<Bytes> {
        self.core.borrow().handle.alpn_protocol()
    }

    /// 开始（或继续）握手。只在 `Idle`/`Handshaking` 下生效，其余状态忽略。
    pub fn handshake(&self) {
        let mut notices = Vec::new();
        {
            let mut core = self.core.borrow_mut();
            match core.state {
                SessionState::Idle => {
                    let role = core.handle.begin_negotiation();
                    tracing::debug!(session = self.id, ?role, "tls negotiation started");
                    core.state = SessionState::Handshaking;
                    self.drive_handshake(&mut core, &mut notices);
                }
                SessionState::Handshaking => {
                    self.drive_handshake(&mut core, &mut notices);
                }
                state => {
                    tracing::trace!(session = self.id, ?state, "handshake ignored");
                }
            }
        }
        self.dispatch(notices);
    }

    /// 交付下层收到的一段密文，切分方式不限。
    pub fn feed_read(&self, ciphertext: Bytes) {
        let mut notices = Vec::new();
        {
            let mut core = self.core.borrow_mut();
            let core = &mut *core;
            match core.state {
                SessionState::Closed | SessionState::Failed => {
                    tracing::trace!(
                        session = self.id,
                        len = ciphertext.len(),
                        state = ?core.state,
                        "ciphertext after close dropped"
                    );
                }
                state => {
                    tracing::trace!(session = self.id, len = ciphertext.len(), "ciphertext fed");
                    if let Err(err) = core.channel.push_inbound(&ciphertext) {
                        let err = error::channel_allocation_error(ciphertext.len(), err);
                        core.fail(err, 0, &mut notices);
                    } else {
                        let readable = match state {
                            SessionState::Handshaking => self.drive_handshake(core, &mut notices),
                            SessionState::Established | SessionState::ShuttingDown => true,
                            _ => false,
                        };
                        if readable {
                            self.drive_reads(core, &mut notices);
                        }
                    }
                }
            }
        }
        self.dispatch(notices);
    }

    /// 加密并发送明文。所有字节被接收后触发一次写完成回调。
    pub fn write(&self, plaintext: Bytes) -> Result<(), TransportError> {
        let mut notices = Vec::new();
        {
            let mut core = self.core.borrow_mut();
            let core = &mut *core;
            if core.state != SessionState::Established {
                return Err(error::not_connected_error(WRITE));
            }
            let mut accepted = 0;
            let mut reportable = true;
            while accepted < plaintext.len() {
                let outcome = core.handle.write_step(&mut core.channel, &plaintext[accepted..]);
                let forwarded = core.drain(&mut notices);
                match outcome {
                    StepOutcome::Done(0) if forwarded == 0 => {
                        tracing::debug!(session = self.id, "encrypt accepted nothing; treating as shutdown");
                        core.state = SessionState::Closed;
                        notices.push(Notice::Close(CloseReason::Peer));
                        reportable = false;
                        break;
                    }
                    StepOutcome::Done(0) => {
                        tracing::debug!(session = self.id, accepted, forwarded, "encrypt accepted nothing");
                        reportable = accepted > 0;
                        break;
                    }
                    StepOutcome::Done(n) => accepted += n,
                    StepOutcome::WantRead | StepOutcome::Retry => {
                        tracing::debug!(session = self.id, accepted, "encrypt step deferred");
                        reportable = accepted > 0;
                        break;
                    }
                    StepOutcome::Closed => {
                        core.state = SessionState::Closed;
                        notices.push(Notice::Close(CloseReason::Peer));
                        reportable = false;
                        break;
                    }
                    StepOutcome::Fatal(err) => {
                        core.fail(err, forwarded, &mut notices);
                        reportable = false;
                        break;
                    }
                }
            }
            if reportable {
                tracing::trace!(session = self.id, accepted, "plaintext encrypted");
                notices.push(Notice::Written(accepted));
            }
        }
        self.dispatch(notices);
        Ok(())
    }

    /// 发送 close_notify 并报告关闭；不等待对端回应。
    pub fn disconnect(&self) {
        let mut notices = Vec::new();
        {
            let mut core = self.core.borrow_mut();
            let core = &mut *core;
            match core.state {
                SessionState::Idle => {
                    core.state = SessionState::Closed;
                    notices.push(Notice::Close(CloseReason::Local));
                }
                SessionState::Handshaking | SessionState::Established => {
                    core.state = SessionState::ShuttingDown;
                    let outcome = core.handle.shutdown_step(&mut core.channel);
                    core.drain(&mut notices);
                    if let StepOutcome::Fatal(err) = outcome {
                        core.state = SessionState::Failed;
                        notices.push(Notice::Error(err));
                    }
                    notices.push(Notice::Close(CloseReason::Local));
                }
                SessionState::Failed => notices.push(Notice::Close(CloseReason::Fatal)),
                SessionState::ShuttingDown | SessionState::Closed => {}
            }
        }
        self.dispatch(notices);
    }

    /// 执行一步握手；返回会话是否已可解密。
    fn drive_handshake(&self, core: &mut SessionCore, notices: &mut Vec<Notice>) -> bool {
        let outcome = core.handle.handshake_step(&mut core.channel);
        let forwarded = core.drain(notices);
        match outcome {
            StepOutcome::Done(_) => {
                core.state = SessionState::Established;
                notices.push(Notice::Handshake(HandshakeStatus::Negotiated));
                true
            }
            StepOutcome::Closed => {
                core.state = SessionState::Established;
                notices.push(Notice::Handshake(HandshakeStatus::ClosedDuringHandshake));
                false
            }
            StepOutcome::WantRead | StepOutcome::Retry => false,
            StepOutcome::Fatal(err) => {
                core.fail(err, forwarded, notices);
                false
            }
        }
    }

    /// 循环解密，直到引擎需要更多输入、会话关闭或失败。
    fn drive_reads(&self, core: &mut SessionCore, notices: &mut Vec<Notice>) {
        let mut buf = BytesMut::zeroed(self.read_chunk_size);
        loop {
            let outcome = core.handle.read_step(&mut core.channel, &mut buf);
            let forwarded = core.drain(notices);
            match outcome {
                StepOutcome::Done(n) if n > 0 => {
                    notices.push(Notice::Data(Bytes::copy_from_slice(&buf[..n])));
                }
                StepOutcome::WantRead | StepOutcome::Retry => return,
                StepOutcome::Done(_) | StepOutcome::Closed => {
                    if core.state == SessionState::Established {
                        if let StepOutcome::Fatal(err) = core.handle.shutdown_step(&mut core.channel) {
                            tracing::debug!(session = self.id, error = %err, "close_notify reply failed");
                        }
                        core.drain(notices);
                    }
                    core.state = SessionState::Closed;
                    notices.push(Notice::Close(CloseReason::Peer));
                    return;
                }
                StepOutcome::Fatal(err) => {
                    core.fail(err, forwarded, notices);
                    return;
                }
            }
        }
    }

    fn dispatch(&self, notices: Vec<Notice>) {
        for notice in notices {
            match notice {
                Notice::Forward(bytes) => self.forward(bytes),
                Notice::Handshake(status) => {
                    if self.handshake_reported.replace(true) {
                        continue;
                    }
                    tracing::debug!(session = self.id, ?status, "tls handshake complete");
                    if let Some(callback) = &self.callbacks.on_handshake {
                        callback(self, status);
                    }
                }
                Notice::Written(len) => {
                    if let Some(callback) = &self.callbacks.on_write {
                        callback(self, len);
                    }
                }
                Notice::Data(bytes) => {
                    if self.close_reported.get() {
                        tracing::trace!(session = self.id, len = bytes.len(), "plaintext after close dropped");
                        continue;
                    }
                    if let Some(callback) = &self.callbacks.on_read {
                        callback(self, bytes);
                    }
                }
                Notice::Error(err) => {
                    tracing::warn!(session = self.id, error = %err, code = err.code(), "tls session failed");
                    if let Some(callback) = &self.callbacks.on_error {
                        callback(self, &err);
                    }
                }
                Notice::Close(reason) => {
                    if self.close_reported.replace(true) {
                        continue;
                    }
                    tracing::debug!(session = self.id, ?reason, "tls session closed");
                    if let Some(callback) = &self.callbacks.on_close {
                        callback(self, reason);
                    }
                }
            }
        }
    }

    fn forward(&self, bytes: Bytes) {
        let Some(lower) = self.lower.upgrade() else {
            tracing::debug!(session = self.id, len = bytes.len(), "lower transport gone; ciphertext dropped");
            return;
        };
        tracing::trace!(session = self.id, len = bytes.len(), "ciphertext forwarded");
        if let Err(err) = lower.write(bytes) {
            tracing::warn!(session = self.id, error = %err, "forwarding ciphertext failed");
            if let Some(callback) = &self.callbacks.on_error {
                callback(self, &err);
            }
        }
    }
}

impl fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.core.try_borrow().map(|core| core.state).ok();
        f.debug_struct("TlsSession")
            .field("id", &self.id)
            .field("state", &state)
            .field("handshake_reported", &self.handshake_reported.get())
            .field("close_reported", &self.close_reported.get())
            .finish()
    }
}
