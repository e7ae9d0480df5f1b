use std::{
    borrow::Cow,
    cell::{Cell, RefCell},
    net::SocketAddr,
    rc::{Rc, Weak},
};

use bytes::{Bytes, BytesMut};
use socket2::{SockRef, TcpKeepalive};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, tcp::OwnedWriteHalf},
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use veil_transport::{
    CloseCallback, ConnectCallback, DataCallback, EndCallback, ErrorCallback, Transport,
    TransportCallbacks, TransportError, TransportState,
};

use crate::{
    config::TcpTransportConfig,
    error::{
        self, CONFIGURE, CONNECT, READ, SHUTDOWN, WRITE, invalid_config_error, map_io_error,
        missing_remote_error, not_connected_error, timeout_error,
    },
};

/// 绑定 Tokio TCP 套接字的叶子传输。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 把事件循环上的套接字原语映射到 [`Transport`] 契约，作为 TLS 组合传输的下层；
/// - 回调全部在当前线程的 `LocalSet` 上执行，与 TLS 会话“单线程、无锁”的模型一致。
///
/// ## 逻辑 (How)
/// - `reconnect` 为每次建连分配递增的代号，并以 `spawn_local` 启动连接任务；
/// - 连接任务在一个 `select!` 循环里同时处理三件事：发送队列中的写请求、本端关闭信号、套接字读取；
/// - 写请求经无界通道排队，`write` 因而永不阻塞；关闭信号到达时先冲刷已排队的写入，再关闭写方向；
/// - 任务只持有 `Weak<TcpTransport>`，回调前校验代号，旧连接的迟到事件会被丢弃。
///
/// ## 契约 (What)
/// - `connect` 登记回调并立即调用 `reconnect`；
/// - 建连前校验配置，未通过时以 `Config` 类错误上报并关闭，不会打开套接字；
/// - 读到 EOF 时询问 `on_end`，未被抑制则关闭连接；
/// - I/O 错误先经 `on_error` 上报（名称为稳定错误名，数值码为 errno），随后连接结束；
/// - 每条连接的 `on_close` 恰好触发一次；被 `reconnect` 取代的连接不会再触发任何回调。
///
/// ## 注意事项 (Trade-offs)
/// - 必须在 `tokio::task::LocalSet` 内调用 `connect`/`reconnect`，否则 `spawn_local` 会 panic；
/// - 写入在读取分支之间串行执行，长时间的写阻塞会推迟读取，这对 TLS 这类请求/响应交替的负载可以接受。
pub struct TcpTransport {
    this: Weak<TcpTransport>,
    config: RefCell<TcpTransportConfig>,
    state: Cell<TransportState>,
    generation: Cell<u64>,
    link: RefCell<Option<Link>>,
    callbacks: TransportCallbacks,
}

/// 一次建连对应的任务句柄与控制通道。
struct Link {
    commands: mpsc::UnboundedSender<Bytes>,
    close: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TcpTransport {
    /// 创建传输；此时尚未建连。
    pub fn create(config: TcpTransportConfig) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            this: this.clone(),
            config: RefCell::new(config),
            state: Cell::new(TransportState::Disconnected),
            generation: Cell::new(0),
            link: RefCell::new(None),
            callbacks: TransportCallbacks::default(),
        })
    }

    /// 设置下次建连使用的远端地址。
    pub fn set_remote(&self, remote: SocketAddr) {
        self.config.borrow_mut().remote = Some(remote);
    }

    pub fn config(&self) -> TcpTransportConfig {
        self.config.borrow().clone()
    }

    fn current(weak: &Weak<Self>, generation: u64) -> Option<Rc<Self>> {
        weak.upgrade()
            .filter(|transport| transport.generation.get() == generation)
    }

    fn handle_connected(&self) {
        tracing::debug!(transport = %self.id(), "tcp connected");
        self.state.set(TransportState::Connected);
        self.callbacks.fire_connect(self);
    }

    fn handle_data(&self, data: Bytes) {
        tracing::trace!(transport = %self.id(), len = data.len(), "tcp data");
        self.callbacks.fire_data(self, data);
    }

    fn handle_end(&self) -> bool {
        tracing::debug!(transport = %self.id(), "tcp peer end");
        self.callbacks.fire_end(self)
    }

    fn handle_error(&self, error: &TransportError) {
        tracing::warn!(transport = %self.id(), error = %error, "tcp transport error");
        self.callbacks.fire_error(self, error);
    }

    fn handle_closed(&self, generation: u64) {
        // 错误回调里可能已经发起重连，此时旧连接的关闭不再可见。
        if self.generation.get() != generation {
            return;
        }
        self.link.borrow_mut().take();
        self.state.set(TransportState::Closed);
        tracing::debug!(transport = %self.id(), "tcp closed");
        self.callbacks.fire_close(self);
    }
}

impl Transport for TcpTransport {
    fn id(&self) -> Cow<'_, str> {
        match self.config.borrow().remote {
            Some(remote) => Cow::Owned(format!("tcp:{remote}#{}", self.generation.get())),
            None => Cow::Borrowed("tcp:unbound"),
        }
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }

    fn connect(&self, on_connect: ConnectCallback, on_close: CloseCallback, on_error: ErrorCallback) {
        self.callbacks.set_lifecycle(on_connect, on_close, on_error);
        self.reconnect();
    }

    fn reconnect(&self) {
        let generation = self.generation.get() + 1;
        self.generation.set(generation);
        if let Some(previous) = self.link.borrow_mut().take() {
            tracing::debug!(generation, "tcp reconnect supersedes previous connection");
            previous.task.abort();
        }
        self.state.set(TransportState::Connecting);

        let (commands, queue) = mpsc::unbounded_channel();
        let (close, close_signal) = oneshot::channel();
        let config = self.config.borrow().clone();
        let task = tokio::task::spawn_local(drive_connection(
            self.this.clone(),
            generation,
            config,
            queue,
            close_signal,
        ));
        *self.link.borrow_mut() = Some(Link {
            commands,
            close: Some(close),
            task,
        });
    }

    fn disconnect(&self) {
        let signal = self
            .link
            .borrow_mut()
            .as_mut()
            .and_then(|link| link.close.take());
        if let Some(signal) = signal {
            self.state.set(TransportState::Closing);
            // 任务已结束时接收端不存在，关闭回调已经或即将由任务自身触发。
            let _ = signal.send(());
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
            return Err(not_connected_error(WRITE));
        }
        let link = self.link.borrow();
        let link = link.as_ref().ok_or_else(|| not_connected_error(WRITE))?;
        link.commands
            .send(data)
            .map_err(|_| not_connected_error(WRITE))
    }
}

async fn drive_connection(
    weak: Weak<TcpTransport>,
    generation: u64,
    config: TcpTransportConfig,
    mut commands: mpsc::UnboundedReceiver<Bytes>,
    mut close: oneshot::Receiver<()>,
) {
    let stream = match open_stream(&config).await {
        Ok(stream) => stream,
        Err(err) => {
            if let Some(transport) = TcpTransport::current(&weak, generation) {
                transport.handle_error(&err);
                transport.handle_closed(generation);
            }
            return;
        }
    };
    let configured = configure(&stream, &config);
    match TcpTransport::current(&weak, generation) {
        Some(transport) => {
            transport.handle_connected();
            if let Err(err) = configured {
                transport.handle_error(&err);
            }
        }
        None => return,
    }

    let (mut reader, mut writer) = stream.into_split();
    let mut buf = BytesMut::with_capacity(config.read_buffer_size);
    let mut read_open = true;
    let failure = loop {
        buf.reserve(config.read_buffer_size);
        tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(data) => {
                    if let Err(err) = writer.write_all(&data).await {
                        break Some(map_io_error(WRITE, err));
                    }
                }
                None => break None,
            },
            _ = &mut close => {
                break flush_and_shutdown(&mut writer, &mut commands).await.err();
            },
            read = reader.read_buf(&mut buf), if read_open => match read {
                Ok(0) => {
                    let suppress = TcpTransport::current(&weak, generation)
                        .is_some_and(|transport| transport.handle_end());
                    if !suppress {
                        break None;
                    }
                    read_open = false;
                }
                Ok(_) => {
                    let chunk = buf.split().freeze();
                    match TcpTransport::current(&weak, generation) {
                        Some(transport) => transport.handle_data(chunk),
                        None => break None,
                    }
                }
                Err(err) => break Some(map_io_error(READ, err)),
            },
        }
    };

    if let Some(transport) = TcpTransport::current(&weak, generation) {
        if let Some(err) = failure {
            transport.handle_error(&err);
        }
        transport.handle_closed(generation);
    }
}

async fn open_stream(config: &TcpTransportConfig) -> Result<TcpStream, TransportError> {
    // 构建器与公开字段都可能绕过 TOML 解析时的校验。
    config.validate().map_err(invalid_config_error)?;
    let remote = config.remote.ok_or_else(missing_remote_error)?;
    let timeout = config.connect_timeout();
    match tokio::time::timeout(timeout, TcpStream::connect(remote)).await {
        Ok(result) => result.map_err(|err| map_io_error(CONNECT, err)),
        Err(_) => Err(timeout_error(CONNECT, timeout)),
    }
}

fn configure(stream: &TcpStream, config: &TcpTransportConfig) -> Result<(), TransportError> {
    stream
        .set_nodelay(config.nodelay)
        .map_err(|err| map_io_error(CONFIGURE, err))?;
    if let Some(idle) = config.keepalive() {
        let keepalive = TcpKeepalive::new().with_time(idle);
        SockRef::from(stream)
            .set_tcp_keepalive(&keepalive)
            .map_err(|err| map_io_error(CONFIGURE, err))?;
    }
    Ok(())
}

/// 冲刷关闭前已排队的写入（例如 TLS close_notify），然后关闭写方向。
async fn flush_and_shutdown(
    writer: &mut OwnedWriteHalf,
    commands: &mut mpsc::UnboundedReceiver<Bytes>,
) -> Result<(), TransportError> {
    while let Ok(data) = commands.try_recv() {
        writer
            .write_all(&data)
            .await
            .map_err(|err| map_io_error(WRITE, err))?;
    }
    writer
        .shutdown()
        .await
        .map_err(|err| error::map_io_error(SHUTDOWN, err))
}
