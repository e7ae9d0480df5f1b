//! `TlsTransport` 叠加在回环管道上的组合测试。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 验证组合传输对应用保持 `Transport` 契约：握手完成前不报告连接、只交付明文、关闭只报告一次；
//! - 回环管道可以把密文切成任意小块投递，覆盖记录被下层拆分的情形。
//!
//! ## 核心逻辑（How）
//! - 客户端与服务端各自包裹管道的一端，事件循环由 `run_until_idle` 驱动；
//! - 应用回调写入共享日志，测试按阶段断言日志内容。

mod support;

use std::{cell::RefCell, rc::Rc};

use bytes::Bytes;
use veil_transport::{
    ErrorKind, Transport, TransportError, TransportState,
    loopback::{LoopbackPipe, LoopbackTransport},
};
use veil_transport_tls::{CryptoEngine, RustlsEngine, TlsTransport};

use support::{client_config, engines, engines_with, server_config};

type Log = Rc<RefCell<Vec<String>>>;

/// 登记应用回调；`echo` 为真时把收到的明文原样写回。
fn attach(transport: &Rc<TlsTransport>, label: &'static str, log: &Log, echo: bool) {
    let data_log = Rc::clone(log);
    transport.on_data(Rc::new(move |transport: &dyn Transport, data: Bytes| {
        data_log
            .borrow_mut()
            .push(format!("{label}:data:{}", String::from_utf8_lossy(&data)));
        if echo {
            transport.write(data).expect("回调内回写应成功");
        }
    }));
    let end_log = Rc::clone(log);
    transport.on_end(Rc::new(move |_: &dyn Transport| {
        end_log.borrow_mut().push(format!("{label}:end"));
        false
    }));
    let connect_log = Rc::clone(log);
    let close_log = Rc::clone(log);
    let error_log = Rc::clone(log);
    transport.connect(
        Rc::new(move |_: &dyn Transport| connect_log.borrow_mut().push(format!("{label}:connect"))),
        Rc::new(move |_: &dyn Transport| close_log.borrow_mut().push(format!("{label}:close"))),
        Rc::new(move |_: &dyn Transport, err: &TransportError| {
            error_log
                .borrow_mut()
                .push(format!("{label}:error:{}", err.name()))
        }),
    );
}

fn count(log: &Log, entry: &str) -> usize {
    log.borrow().iter().filter(|line| *line == entry).count()
}

struct Composed {
    pipe: LoopbackPipe,
    client: Rc<TlsTransport>,
    server: Rc<TlsTransport>,
    // 回环管道只弱引用两端，这里保持它们存活。
    _ends: (Rc<LoopbackTransport>, Rc<LoopbackTransport>),
}

fn compose(pipe: LoopbackPipe, client: Rc<dyn CryptoEngine>, server: Rc<dyn CryptoEngine>) -> Composed {
    let (a, b) = pipe.open();
    let client = TlsTransport::create(a.clone(), client);
    let server = TlsTransport::create(b.clone(), server);
    Composed {
        pipe,
        client,
        server,
        _ends: (a, b),
    }
}

fn default_pair(pipe: LoopbackPipe) -> Composed {
    let (client, server) = engines();
    compose(pipe, client, server)
}

#[test]
fn connect_is_reported_only_after_the_handshake() {
    let composed = default_pair(LoopbackPipe::new());
    let log: Log = Rc::default();
    attach(&composed.client, "client", &log, false);
    attach(&composed.server, "server", &log, true);

    // 下层连接成功后会话才开始握手，此时应用仍不可写。
    composed.pipe.step();
    assert!(log.borrow().is_empty());
    assert_eq!(composed.client.state(), TransportState::Connecting);
    let err = composed
        .client
        .write(Bytes::from_static(b"too early"))
        .expect_err("握手完成前写入必须失败");
    assert_eq!(err.kind(), ErrorKind::NotConnected);

    composed.pipe.run_until_idle();
    assert_eq!(count(&log, "client:connect"), 1);
    assert_eq!(count(&log, "server:connect"), 1);
    assert_eq!(composed.client.state(), TransportState::Connected);
    assert_eq!(composed.client.id(), "tls+loopback:A");
}

#[test]
fn write_completion_is_not_an_application_event() {
    let composed = default_pair(LoopbackPipe::new());
    let log: Log = Rc::default();
    attach(&composed.client, "client", &log, false);
    attach(&composed.server, "server", &log, false);
    composed.pipe.run_until_idle();
    log.borrow_mut().clear();

    composed
        .client
        .write(Bytes::from_static(b"ping"))
        .expect("握手完成后写入应成功");
    assert!(log.borrow().is_empty(), "写完成只留在组合传输内部");

    composed.pipe.run_until_idle();
    assert_eq!(*log.borrow(), ["server:data:ping"]);
}

#[test]
fn echo_round_trip_over_fragmented_pipe() {
    let composed = default_pair(LoopbackPipe::with_chunk_size(5));
    let log: Log = Rc::default();
    attach(&composed.client, "client", &log, false);
    attach(&composed.server, "server", &log, true);
    composed.pipe.run_until_idle();

    composed
        .client
        .write(Bytes::from_static(b"hello over tls"))
        .expect("握手完成后写入应成功");
    composed.pipe.run_until_idle();

    let received: String = log
        .borrow()
        .iter()
        .filter_map(|line| line.strip_prefix("client:data:"))
        .collect();
    assert_eq!(received, "hello over tls");
    let seen_by_server: String = log
        .borrow()
        .iter()
        .filter_map(|line| line.strip_prefix("server:data:"))
        .collect();
    assert_eq!(seen_by_server, "hello over tls");
    assert!(log.borrow().iter().all(|line| !line.contains(":error:")));
}

#[test]
fn disconnect_closes_both_sides_exactly_once() {
    let composed = default_pair(LoopbackPipe::new());
    let log: Log = Rc::default();
    attach(&composed.client, "client", &log, false);
    attach(&composed.server, "server", &log, false);
    composed.pipe.run_until_idle();

    composed.client.disconnect();
    composed.pipe.run_until_idle();
    composed.client.disconnect();
    composed.pipe.run_until_idle();

    assert_eq!(count(&log, "client:close"), 1);
    assert_eq!(count(&log, "server:close"), 1);
    assert_eq!(composed.client.state(), TransportState::Closed);
    assert_eq!(composed.server.state(), TransportState::Closed);
    assert!(composed.client.session().is_none());
    let err = composed
        .server
        .write(Bytes::from_static(b"late"))
        .expect_err("关闭后写入必须失败");
    assert_eq!(err.kind(), ErrorKind::NotConnected);
}

#[test]
fn lower_eof_without_close_notify_reaches_the_application() {
    let composed = default_pair(LoopbackPipe::new());
    let log: Log = Rc::default();
    attach(&composed.client, "client", &log, false);
    attach(&composed.server, "server", &log, false);
    composed.pipe.run_until_idle();

    composed.client.lower().disconnect();
    composed.pipe.run_until_idle();

    assert_eq!(count(&log, "client:close"), 1);
    assert_eq!(count(&log, "server:end"), 1);
    assert_eq!(count(&log, "server:close"), 1);
    let end_at = log.borrow().iter().position(|line| line == "server:end");
    let close_at = log.borrow().iter().position(|line| line == "server:close");
    assert!(end_at < close_at, "EOF 必须先于关闭报告");
}

#[test]
fn session_creation_failure_is_reported_then_closed() {
    let (client, server) = engines_with(
        client_config().with_channel_capacity(usize::MAX),
        server_config(support::identity()),
    );
    let composed = compose(LoopbackPipe::new(), client, server);
    let log: Log = Rc::default();
    attach(&composed.client, "client", &log, false);
    composed.pipe.run_until_idle();

    assert_eq!(count(&log, "client:error:veil.transport.tls.channel_alloc_failed"), 1);
    assert_eq!(count(&log, "client:connect"), 0);
    assert_eq!(count(&log, "client:close"), 1);
}

#[test]
fn reconnect_runs_a_fresh_handshake() {
    let composed = default_pair(LoopbackPipe::new());
    let log: Log = Rc::default();
    attach(&composed.client, "client", &log, false);
    attach(&composed.server, "server", &log, true);
    composed.pipe.run_until_idle();
    let first = composed.client.session().map(|session| session.id());

    composed.client.disconnect();
    composed.pipe.run_until_idle();
    composed.server.reconnect();
    composed.client.reconnect();
    composed.pipe.run_until_idle();

    assert_eq!(count(&log, "client:connect"), 2);
    assert_eq!(count(&log, "server:connect"), 2);
    let second = composed.client.session().map(|session| session.id());
    assert!(first.is_some() && second.is_some() && first != second);

    composed
        .client
        .write(Bytes::from_static(b"again"))
        .expect("重连后写入应成功");
    composed.pipe.run_until_idle();
    assert_eq!(count(&log, "client:data:again"), 1);
}

#[test]
fn negotiated_alpn_is_visible_on_the_transport() {
    let client = RustlsEngine::create(&client_config().with_alpn(["veil/1"])).expect("客户端引擎");
    let server = RustlsEngine::create(&server_config(support::identity()).with_alpn(["veil/1"]))
        .expect("服务端引擎");
    let composed = compose(LoopbackPipe::new(), client, server);
    let log: Log = Rc::default();
    attach(&composed.client, "client", &log, false);
    attach(&composed.server, "server", &log, false);
    composed.pipe.run_until_idle();

    assert_eq!(composed.client.alpn_protocol().as_deref(), Some(&b"veil/1"[..]));
    assert_eq!(composed.server.alpn_protocol().as_deref(), Some(&b"veil/1"[..]));
}

#[test]
fn cleanup_detaches_application_callbacks() {
    let composed = default_pair(LoopbackPipe::new());
    let log: Log = Rc::default();
    attach(&composed.client, "client", &log, false);
    attach(&composed.server, "server", &log, false);
    composed.pipe.run_until_idle();

    composed.client.cleanup();
    composed.pipe.run_until_idle();

    assert_eq!(count(&log, "client:close"), 0, "cleanup 之后不应再回调应用");
    assert_eq!(count(&log, "server:close"), 1);
}
