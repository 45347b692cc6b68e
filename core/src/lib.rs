//! # polyrpc-core
//!
//! Leaf utilities shared by the `polyrpc` protocol layer: stable error
//! kinds, config structs, the per-connection composite buffer store, and the
//! compression adapter.

mod buffer;
pub use buffer::BufferStore;
pub mod compress;
pub use compress::CompressType;
mod config;
pub use config::{RpcConfig, TimeoutSetting, MAX_BODY_SIZE};
pub mod error;
