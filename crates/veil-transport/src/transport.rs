use alloc::borrow::Cow;
use alloc::rc::Rc;
use core::cell::RefCell;

use bytes::Bytes;

use crate::TransportError;

/// 连接建立回调。
pub type ConnectCallback = Rc<dyn Fn(&dyn Transport)>;
/// 连接关闭回调；每条逻辑连接至多触发一次。
pub type CloseCallback = Rc<dyn Fn(&dyn Transport)>;
/// I/O 错误回调；不会自动拆除传输，由调用方决定是否断开。
pub type ErrorCallback = Rc<dyn Fn(&dyn Transport, &TransportError)>;
/// 入站数据回调，数据块所有权移交给回调。
pub type DataCallback = Rc<dyn Fn(&dyn Transport, Bytes)>;
/// 对端结束写方向（EOF）时的回调；返回 `true` 表示抑制默认的关闭处理。
pub type EndCallback = Rc<dyn Fn(&dyn Transport) -> bool>;

/// 传输的概念状态。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TransportState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl TransportState {
    /// 是否处于允许 `write` 的状态。
    pub fn is_connected(self) -> bool {
        matches!(self, TransportState::Connected)
    }
}

/// 统一的双向字节流传输契约。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 无论链路是明文 TCP 还是 TLS 保护的组合传输，应用都面对同一组操作与回调；
/// - 允许分层：TLS 传输自身实现本契约，同时持有一个下层 `Rc<dyn Transport>`。
///
/// ## 执行模型（How）
/// - 单线程、协作式的事件循环驱动全部操作与回调，因此方法均以 `&self` 接收并依赖内部可变性；
/// - 回调以 `Rc<dyn Fn>` 保存，触发前先克隆出槽位，回调内可以安全地重入本传输的任意方法；
/// - 实现持有内部借用时不得触发回调：要么交给事件循环延后投递，要么在释放借用后再分发。
///
/// ## 契约（What）
/// - `connect`：登记三个生命周期回调并开始建连；
/// - `reconnect`：丢弃当前连接并重新建连，沿用已登记的回调；
/// - `disconnect`：唯一的取消原语，不保证同步完成；关闭回调稍后且只触发一次；
/// - `cleanup`：断开连接并摘除全部回调，释放回调中捕获的引用；
/// - `on_data` / `on_end`：登记入站数据与 EOF 回调；
/// - `write`：移交缓冲区所有权；仅在已连接时合法，否则返回 [`crate::ErrorKind::NotConnected`]。
///
/// ## 风险与权衡（Trade-offs）
/// - 类型刻意不实现 `Send`：跨线程调度需要在上层重新设计所有权，而不是在此加锁。
pub trait Transport {
    /// 返回可用于日志的连接标识。
    fn id(&self) -> Cow<'_, str>;

    /// 当前连接状态。
    fn state(&self) -> TransportState;

    /// 登记生命周期回调并开始建连。
    fn connect(&self, on_connect: ConnectCallback, on_close: CloseCallback, on_error: ErrorCallback);

    /// 重新建连。
    fn reconnect(&self);

    /// 请求断开连接。
    fn disconnect(&self);

    /// 断开连接并摘除全部回调。
    fn cleanup(&self);

    /// 登记入站数据回调。
    fn on_data(&self, callback: DataCallback);

    /// 登记 EOF 回调。
    fn on_end(&self, callback: EndCallback);

    /// 写出数据，缓冲区所有权移交给实现。
    fn write(&self, data: Bytes) -> Result<(), TransportError>;
}

/// 回调槽位：保存至多一个回调，并在触发前克隆出来以支持重入。
pub struct CallbackSlot<F: ?Sized> {
    inner: RefCell<Option<Rc<F>>>,
}

impl<F: ?Sized> CallbackSlot<F> {
    pub const fn new() -> Self {
        Self {
            inner: RefCell::new(None),
        }
    }

    pub fn set(&self, callback: Rc<F>) {
        *self.inner.borrow_mut() = Some(callback);
    }

    pub fn clear(&self) {
        self.inner.borrow_mut().take();
    }

    /// 克隆当前回调；返回后槽位不再被借用。
    pub fn get(&self) -> Option<Rc<F>> {
        self.inner.borrow().clone()
    }

    pub fn is_set(&self) -> bool {
        self.inner.borrow().is_some()
    }
}

impl<F: ?Sized> Default for CallbackSlot<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ?Sized> core::fmt::Debug for CallbackSlot<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CallbackSlot")
            .field("set", &self.is_set())
            .finish()
    }
}

/// 一组应用层回调的集合，供各传输实现复用。
#[derive(Debug, Default)]
pub struct TransportCallbacks {
    pub on_connect: CallbackSlot<dyn Fn(&dyn Transport)>,
    pub on_close: CallbackSlot<dyn Fn(&dyn Transport)>,
    pub on_error: CallbackSlot<dyn Fn(&dyn Transport, &TransportError)>,
    pub on_data: CallbackSlot<dyn Fn(&dyn Transport, Bytes)>,
    pub on_end: CallbackSlot<dyn Fn(&dyn Transport) -> bool>,
}

impl TransportCallbacks {
    /// 登记 `connect` 传入的三个生命周期回调。
    pub fn set_lifecycle(
        &self,
        on_connect: ConnectCallback,
        on_close: CloseCallback,
        on_error: ErrorCallback,
    ) {
        self.on_connect.set(on_connect);
        self.on_close.set(on_close);
        self.on_error.set(on_error);
    }

    /// 断开连接并摘除全部回调。
    pub fn clear(&self) {
        self.on_connect.clear();
        self.on_close.clear();
        self.on_error.clear();
        self.on_data.clear();
        self.on_end.clear();
    }

    pub fn fire_connect(&self, transport: &dyn Transport) {
        if let Some(callback) = self.on_connect.get() {
            callback(transport);
        }
    }

    pub fn fire_close(&self, transport: &dyn Transport) {
        if let Some(callback) = self.on_close.get() {
            callback(transport);
        }
    }

    pub fn fire_error(&self, transport: &dyn Transport, error: &TransportError) {
        if let Some(callback) = self.on_error.get() {
            callback(transport, error);
        }
    }

    pub fn fire_data(&self, transport: &dyn Transport, data: Bytes) {
        if let Some(callback) = self.on_data.get() {
            callback(transport, data);
        }
    }

    /// 触发 EOF 回调并返回是否抑制默认处理；未登记时不抑制。
    pub fn fire_end(&self, transport: &dyn Transport) -> bool {
        match self.on_end.get() {
            Some(callback) => callback(transport),
            None => false,
        }
    }
}
