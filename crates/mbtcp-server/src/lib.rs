//! Modbus/TCP responder engine.
//!
//! This crate provides:
//! - [`store`] with the shared holding register array
//! - [`connection`] with the byte-channel trait and its TCP implementation
//! - [`frame`] with MBAP framing and the frame reader
//! - [`dispatch`] executing function codes 0x03, 0x06 and 0x10
//! - [`session`] running the request loop for one connection
//! - [`server`] with the accept loop and lifecycle
//!
//! # Example
//!
//! ```no_run
//! use mbtcp_common::config::ServerConfig;
//! use mbtcp_server::{DispatchOptions, RegisterStore, Server};
//! use std::sync::Arc;
//!
//! let store = Arc::new(RegisterStore::new(100));
//! let mut server = Server::new(store, ServerConfig::loopback(), DispatchOptions::default());
//! server.start()?;
//! // ... serve until asked to stop
//! server.shutdown();
//! # Ok::<(), mbtcp_common::MbError>(())
//! ```

pub mod connection;
pub mod dispatch;
pub mod frame;
pub mod server;
pub mod session;
pub mod stats;
pub mod store;

pub use connection::{Connection, TcpConnection, TcpOptions};
pub use dispatch::{DispatchOptions, Dispatcher, ExceptionCode, ExceptionFraming, FunctionCode, Reply};
pub use frame::{read_frame, Frame, FrameError, MbapHeader};
pub use server::Server;
pub use session::{Session, SessionEnd};
pub use stats::{ServerStats, StatsSnapshot};
pub use store::{RegisterStore, Word};
