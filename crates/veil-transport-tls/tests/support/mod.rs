//! TLS 集成测试共用的夹具。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 集中生成自签名证书与客户端/服务端引擎，避免每个测试重复拼装 `rcgen` 与配置；
//! - 提供“线缆”下层传输：会话转发的密文先落在内存里，由测试决定何时、以何种分片送达对端。
//!
//! ## 逻辑（How）
//! - [`identity`] 只生成一次证书，后续调用克隆同一份 DER；
//! - [`SessionPair::pump`] 在两条线缆之间搬运密文，直到双方都不再产出字节；
//! - [`Recorder`] 把会话回调记录为可断言的列表。

#![allow(dead_code)]

use std::{
    borrow::Cow,
    cell::RefCell,
    rc::Rc,
    sync::OnceLock,
};

use bytes::Bytes;
use rcgen::{CertificateParams, DnType, KeyPair};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use veil_transport::{
    CloseCallback, ConnectCallback, DataCallback, EndCallback, ErrorCallback, ErrorKind, Transport,
    TransportError, TransportState,
};
use veil_transport_tls::{
    CloseReason, CryptoEngine, HandshakeStatus, RustlsEngine, SessionCallbacks, TlsEngineConfig,
    TlsSession,
};

pub const SERVER_NAME: &str = "veil.test";

/// 自签名身份：DER 供内存配置使用，PEM 供文件配置使用。
pub struct TestIdentity {
    pub cert: CertificateDer<'static>,
    pub key_der: Vec<u8>,
    pub cert_pem: String,
    pub key_pem: String,
}

impl TestIdentity {
    pub fn key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }
}

/// 以 `common_name` 区分颁发者，避免两份身份在证书链匹配时互相混淆。
fn generate(host: &str, common_name: &str) -> TestIdentity {
    let mut params = CertificateParams::new(vec![host.to_string()]).expect("证书参数");
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    let key_pair = KeyPair::generate().expect("生成密钥");
    let cert = params.self_signed(&key_pair).expect("自签名证书");
    TestIdentity {
        cert: cert.der().clone(),
        key_der: key_pair.serialize_der(),
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    }
}

/// 针对 [`SERVER_NAME`] 的共享身份。
pub fn identity() -> &'static TestIdentity {
    static IDENTITY: OnceLock<TestIdentity> = OnceLock::new();
    IDENTITY.get_or_init(|| generate(SERVER_NAME, "veil test ca"))
}

/// 与 [`identity`] 无关的另一份身份，用于构造“不受信任”的服务端。
pub fn stranger() -> &'static TestIdentity {
    static STRANGER: OnceLock<TestIdentity> = OnceLock::new();
    STRANGER.get_or_init(|| generate(SERVER_NAME, "veil stranger"))
}

pub fn server_config(identity: &TestIdentity) -> TlsEngineConfig {
    TlsEngineConfig::server().with_identity(vec![identity.cert.clone()], identity.key())
}

pub fn client_config() -> TlsEngineConfig {
    TlsEngineConfig::client(SERVER_NAME).with_root_certificate(identity().cert.clone())
}

/// 信任 [`identity`] 的客户端引擎与持有该身份的服务端引擎。
pub fn engines() -> (Rc<RustlsEngine>, Rc<RustlsEngine>) {
    engines_with(client_config(), server_config(identity()))
}

pub fn engines_with(
    client: TlsEngineConfig,
    server: TlsEngineConfig,
) -> (Rc<RustlsEngine>, Rc<RustlsEngine>) {
    (
        RustlsEngine::create(&client).expect("构建客户端引擎"),
        RustlsEngine::create(&server).expect("构建服务端引擎"),
    )
}

/// 只把写入的字节留在内存里的下层传输。
#[derive(Default)]
pub struct Wire {
    outbox: RefCell<Vec<Bytes>>,
}

impl Wire {
    /// 取走迄今为止转发的全部密文块。
    pub fn take(&self) -> Vec<Bytes> {
        std::mem::take(&mut *self.outbox.borrow_mut())
    }

    pub fn take_concat(&self) -> Vec<u8> {
        self.take().concat()
    }
}

impl Transport for Wire {
    fn id(&self) -> Cow<'_, str> {
        Cow::Borrowed("wire")
    }

    fn state(&self) -> TransportState {
        TransportState::Connected
    }

    fn connect(&self, _: ConnectCallback, _: CloseCallback, _: ErrorCallback) {}

    fn reconnect(&self) {}

    fn disconnect(&self) {}

    fn cleanup(&self) {}

    fn on_data(&self, _: DataCallback) {}

    fn on_end(&self, _: EndCallback) {}

    fn write(&self, data: Bytes) -> Result<(), TransportError> {
        self.outbox.borrow_mut().push(data);
        Ok(())
    }
}

/// 会话回调的记录。
#[derive(Default)]
pub struct Recorder {
    pub handshakes: RefCell<Vec<HandshakeStatus>>,
    pub writes: RefCell<Vec<usize>>,
    /// 每次写完成回调触发时会话里仍待发送的密文字节数。
    pub pending_at_write: RefCell<Vec<usize>>,
    pub reads: RefCell<Vec<Bytes>>,
    pub closes: RefCell<Vec<CloseReason>>,
    pub errors: RefCell<Vec<(&'static str, ErrorKind)>>,
}

impl Recorder {
    pub fn callbacks(self: &Rc<Self>) -> SessionCallbacks {
        let handshake = Rc::clone(self);
        let write = Rc::clone(self);
        let read = Rc::clone(self);
        let close = Rc::clone(self);
        let error = Rc::clone(self);
        SessionCallbacks::new()
            .on_handshake(move |_, status| handshake.handshakes.borrow_mut().push(status))
            .on_write(move |session, len| {
                write.writes.borrow_mut().push(len);
                write
                    .pending_at_write
                    .borrow_mut()
                    .push(session.pending_outbound());
            })
            .on_read(move |_, data| read.reads.borrow_mut().push(data))
            .on_close(move |_, reason| close.closes.borrow_mut().push(reason))
            .on_error(move |_, err| error.errors.borrow_mut().push((err.name(), err.kind())))
    }

    /// 按到达顺序拼接的全部明文。
    pub fn plaintext(&self) -> Vec<u8> {
        self.reads.borrow().concat()
    }

    pub fn is_silent(&self) -> bool {
        self.handshakes.borrow().is_empty()
            && self.writes.borrow().is_empty()
            && self.reads.borrow().is_empty()
            && self.closes.borrow().is_empty()
            && self.errors.borrow().is_empty()
    }
}

/// 一对通过内存线缆相连的会话。
pub struct SessionPair {
    pub client: Rc<TlsSession>,
    pub server: Rc<TlsSession>,
    pub client_wire: Rc<Wire>,
    pub server_wire: Rc<Wire>,
    pub client_events: Rc<Recorder>,
    pub server_events: Rc<Recorder>,
}

impl SessionPair {
    pub fn new() -> Self {
        let (client, server) = engines();
        Self::with_engines(client.as_ref(), server.as_ref())
    }

    pub fn with_engines(client: &dyn CryptoEngine, server: &dyn CryptoEngine) -> Self {
        let client_wire = Rc::new(Wire::default());
        let server_wire = Rc::new(Wire::default());
        let client_events = Rc::new(Recorder::default());
        let server_events = Rc::new(Recorder::default());
        let client_lower: Rc<dyn Transport> = client_wire.clone();
        let server_lower: Rc<dyn Transport> = server_wire.clone();
        let client = client
            .create_context(&client_lower, client_events.callbacks())
            .expect("创建客户端会话");
        let server = server
            .create_context(&server_lower, server_events.callbacks())
            .expect("创建服务端会话");
        Self {
            client,
            server,
            client_wire,
            server_wire,
            client_events,
            server_events,
        }
    }

    /// 双方开始握手并搬运密文直到静止。
    pub fn handshake(&self) {
        self.client.handshake();
        self.server.handshake();
        self.pump();
    }

    /// 以原样的块搬运密文直到双方都不再产出字节。
    pub fn pump(&self) {
        self.pump_with(|bytes| vec![bytes]);
    }

    /// 以 `split` 决定的分片搬运密文直到静止。
    pub fn pump_with(&self, mut split: impl FnMut(Bytes) -> Vec<Bytes>) {
        loop {
            let to_server = self.client_wire.take();
            let to_client = self.server_wire.take();
            if to_server.is_empty() && to_client.is_empty() {
                break;
            }
            for chunk in to_server.into_iter().flat_map(&mut split) {
                self.server.feed_read(chunk);
            }
            for chunk in to_client.into_iter().flat_map(&mut split) {
                self.client.feed_read(chunk);
            }
        }
    }
}

/// 把一块字节切成每片至多 `size` 字节。
pub fn chunks_of(bytes: Bytes, size: usize) -> Vec<Bytes> {
    let size = size.max(1);
    let mut rest = bytes;
    let mut out = Vec::with_capacity(rest.len() / size + 1);
    while rest.len() > size {
        out.push(rest.split_to(size));
    }
    if !rest.is_empty() {
        out.push(rest);
    }
    out
}
