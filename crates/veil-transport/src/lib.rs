#![deny(unsafe_code)]
#![doc = "veil-transport: 分层字节流传输的共同契约。"]
#![doc = ""]
#![doc = "== 使命概述 =="]
#![doc = "- **Why**：明文 TCP 与 TLS 组合传输对应用呈现同一个“有序字节流”契约，分层实现可以自由替换。"]
#![doc = "- **What**：定义 [`Transport`] trait、连接状态、回调槽位、统一错误值 [`TransportError`]，以及测试用的内存回环传输。"]
#![doc = "- **How**：单线程事件循环模型；所有类型基于 `Rc`/`RefCell`，不引入任何锁。"]

extern crate alloc;

mod error;
pub mod loopback;
pub mod observability;
mod transport;

pub use error::{ErrorKind, TransportError};
pub use transport::{
    CallbackSlot, CloseCallback, ConnectCallback, DataCallback, EndCallback, ErrorCallback,
    Transport, TransportCallbacks, TransportState,
};
