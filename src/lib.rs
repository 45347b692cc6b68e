#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]

//! # polyrpc
//!
//! A multi-protocol RPC framework: a process exposes remote-callable
//! procedures and calls remote procedures transparently, over whichever wire
//! protocol the peer speaks.
//!
//! ## Protocols
//!
//! - Baidu-std (`"PRPC"`, big-endian size fields, protobuf meta)
//! - Hulu (`"HULU"`, little-endian size fields, method addressed by index)
//! - SoFa (`"SOFA"`, little-endian size fields)
//! - NSHead (fixed 36-byte head)
//! - HTTP/1.1 with JSON or protobuf bodies
//! - gRPC over HTTP/2
//! - server-push (an `SPHead` sub-header over a length-prefixed codec)
//!
//! A server auto-detects the protocol from the first bytes of each
//! connection and latches it; see [framing::FramingEngine]. Codecs share one
//! contract ([proto::ProtocolCodec]) and one composite zero-copy buffer
//! ([polyrpc_core::BufferStore]).
//!
//! ## Components
//!
//! - [`polyrpc-core`](https://docs.rs/polyrpc-core): error kinds, config,
//!   buffer store, compression adapter.
//! - [registry::ServiceRegistry]: `(service, method)` to invocable
//!   descriptor, populated once at startup.
//! - [dispatch::DispatchAdapter]: decoded request to invocation and back.
//! - [server::RpcServer] / [client::RpcClient]: connection loops.
//! - [push::PushCaller]: server-originated calls over an accepted
//!   connection.
//!
//! ## Example
//!
//! ```no_run
//! use polyrpc::client::RpcClient;
//! use polyrpc::proto::{MethodKey, ProtocolId};
//! use polyrpc::registry::ServiceRegistry;
//! use polyrpc::server::RpcServer;
//! use polyrpc_core::{CompressType, RpcConfig};
//! use std::sync::Arc;
//!
//! #[derive(Clone, PartialEq, prost::Message)]
//! pub struct EchoRequest {
//!     #[prost(string, tag = "1")]
//!     pub message: String,
//! }
//!
//! #[derive(Clone, PartialEq, prost::Message)]
//! pub struct EchoResponse {
//!     #[prost(string, tag = "1")]
//!     pub message: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let mut registry = ServiceRegistry::new();
//!     registry
//!         .register("echo.EchoService", "Echo", |req: EchoRequest, _ctx| async move {
//!             Ok(EchoResponse { message: req.message })
//!         })
//!         .expect("register");
//!     let server = RpcServer::new(Arc::new(registry), RpcConfig::default());
//!     let addr = server.listen("127.0.0.1:0").await?;
//!
//!     let client =
//!         RpcClient::connect(&addr.to_string(), ProtocolId::BaiduStd, RpcConfig::default())
//!             .await?;
//!     let resp: EchoResponse = client
//!         .call_message(
//!             "echo.EchoService",
//!             MethodKey::Name("Echo".to_string()),
//!             &EchoRequest { message: "hi".to_string() },
//!             CompressType::None,
//!         )
//!         .await
//!         .expect("echo");
//!     assert_eq!(resp.message, "hi");
//!     Ok(())
//! }
//! ```

#[macro_use]
extern crate log;

pub mod client;
pub mod dispatch;
pub mod framing;
pub mod naming;
pub mod proto;
pub mod push;
pub mod registry;
pub mod server;

pub use polyrpc_core::error::{DecodeError, RpcError, RpcErrorKind};
pub use polyrpc_core::{BufferStore, CompressType, RpcConfig, TimeoutSetting};
