//! 回环传输的契约测试。
//!
//! # 教案式说明
//! - **Why**：TLS 层的全部集成测试都构建在回环管道之上，管道自身的投递顺序、EOF 与关闭语义必须可靠；
//! - **How**：通过共享的事件日志记录两端回调，驱动 `run_until_idle` 后断言日志；
//! - **What**：覆盖“回调不在操作内部同步触发”“EOF 默认关闭”“EOF 可被抑制”“未连接写入报错”。

use std::{cell::RefCell, rc::Rc};

use bytes::Bytes;
use veil_transport::{
    ErrorKind, Transport, TransportError, TransportState,
    loopback::{LoopbackPipe, LoopbackTransport},
};

type Log = Rc<RefCell<Vec<String>>>;

fn attach(end: &Rc<LoopbackTransport>, label: &'static str, log: &Log, suppress_end: bool) {
    let data_log = Rc::clone(log);
    end.on_data(Rc::new(move |_: &dyn Transport, data: Bytes| {
        data_log
            .borrow_mut()
            .push(format!("{label}:data:{}", String::from_utf8_lossy(&data)));
    }));
    let end_log = Rc::clone(log);
    end.on_end(Rc::new(move |_: &dyn Transport| {
        end_log.borrow_mut().push(format!("{label}:end"));
        suppress_end
    }));
    let connect_log = Rc::clone(log);
    let close_log = Rc::clone(log);
    let error_log = Rc::clone(log);
    end.connect(
        Rc::new(move |_: &dyn Transport| connect_log.borrow_mut().push(format!("{label}:connect"))),
        Rc::new(move |_: &dyn Transport| close_log.borrow_mut().push(format!("{label}:close"))),
        Rc::new(move |_: &dyn Transport, err: &TransportError| error_log.borrow_mut().push(format!("{label}:error:{}", err.name()))),
    );
}

#[test]
fn callbacks_are_deferred_to_the_event_loop() {
    let pipe = LoopbackPipe::new();
    let (a, b) = pipe.open();
    let log: Log = Rc::default();
    attach(&a, "a", &log, false);
    attach(&b, "b", &log, false);

    assert!(log.borrow().is_empty(), "connect 调用内部不得同步触发回调");
    assert_eq!(a.state(), TransportState::Connecting);

    pipe.run_until_idle();
    assert_eq!(*log.borrow(), ["a:connect", "b:connect"]);
    assert_eq!(a.state(), TransportState::Connected);

    a.write(Bytes::from_static(b"hi")).expect("已连接端点应允许写入");
    assert_eq!(log.borrow().len(), 2, "write 调用内部不得同步投递数据");
    pipe.run_until_idle();
    assert_eq!(log.borrow().last().map(String::as_str), Some("b:data:hi"));
}

#[test]
fn disconnect_delivers_end_then_closes_both_ends_once() {
    let pipe = LoopbackPipe::new();
    let (a, b) = pipe.open();
    let log: Log = Rc::default();
    attach(&a, "a", &log, false);
    attach(&b, "b", &log, false);
    pipe.run_until_idle();
    log.borrow_mut().clear();

    a.disconnect();
    a.disconnect();
    pipe.run_until_idle();

    let entries = log.borrow();
    assert_eq!(entries.iter().filter(|e| *e == "a:close").count(), 1);
    assert_eq!(entries.iter().filter(|e| *e == "b:close").count(), 1);
    assert!(entries.contains(&"b:end".to_string()));
    assert_eq!(a.state(), TransportState::Closed);
    assert_eq!(b.state(), TransportState::Closed);
}

#[test]
fn suppressed_end_keeps_peer_open() {
    let pipe = LoopbackPipe::new();
    let (a, b) = pipe.open();
    let log: Log = Rc::default();
    attach(&a, "a", &log, false);
    attach(&b, "b", &log, true);
    pipe.run_until_idle();

    a.disconnect();
    pipe.run_until_idle();
    assert_eq!(b.state(), TransportState::Connected, "被抑制的 EOF 不应关闭对端");
    assert!(!log.borrow().contains(&"b:close".to_string()));
}

#[test]
fn write_before_connect_is_rejected() {
    let pipe = LoopbackPipe::new();
    let (a, _b) = pipe.open();
    let err = a
        .write(Bytes::from_static(b"early"))
        .expect_err("未连接时写入必须失败");
    assert_eq!(err.kind(), ErrorKind::NotConnected);
    assert_eq!(pipe.pending(), 0);
}
