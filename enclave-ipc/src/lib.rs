//! Message bus and RPC between Enclave execution contexts.
//!
//! Each context (the host, every sandbox guest) owns one [`IpcBus`] per
//! connection, bound to one end of a [`port::channel`] pair. The bus
//! validates, decrypts and authenticates inbound envelopes and dispatches
//! them to correlated requests or channel handlers. [`RpcManager`] layers
//! method calls with timeout and retry on top.

pub mod bus;
pub mod envelope;
pub mod error;
pub mod port;
pub mod rpc;

pub use bus::{HandlerId, IpcBus, IpcConfig, SendOptions};
pub use envelope::{Envelope, Metadata};
pub use error::{IpcError, IpcResult};
pub use port::{PortEnd, PortMessage, PortSender, ANY_ORIGIN};
pub use rpc::{
    codes, CallOptions, MethodRegistry, RpcConfig, RpcError, RpcManager, RpcRequest,
    RpcResponse, RpcStatus, REQUEST_CHANNEL, RESPONSE_CHANNEL,
};
