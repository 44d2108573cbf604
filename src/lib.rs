//! # sockchain - SOCKS5 proxy chaining server
//!
//! sockchain accepts SOCKS5 clients and forwards their connections
//! through configurable chains of upstream proxies (SOCKS4, SOCKS4a,
//! SOCKS5, Shadowsocks) to the requested destination. Chains are
//! described one per line in a small text format; a picker chooses a
//! chain per request, with retry on failure.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sockchain::config::Loader;
//! use sockchain::dispatch::serve;
//! use sockchain::picker::RoundRobin;
//! use sockchain::server::Server;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let picker = Arc::new(RoundRobin::new());
//!     let mut loader = Loader::new();
//!     loader.load_file("proxies.conf", picker.as_ref())?;
//!
//!     let server = Arc::new(Server::listen("tcp", "127.0.0.1:1080").await?);
//!     serve(server, picker, 0).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Chain descriptions
//!
//! ```text
//! # single hop, no auth
//! socks5 10.0.0.1:1080
//! # two-hop chain with user/pass on hop 2
//! socks4a proxy.a:1080 | socks5 10.0.0.2:1080 user pass
//! # directive setting a per-hop timeout for every later line
//! set ConnTimeout 3s
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod addr;
pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod picker;
pub mod proxy;
pub mod server;
pub mod stream;

// Re-export commonly used items
pub use addr::Address;
pub use error::{ReplyError, Result, SockchainError};
pub use picker::ChainPicker;
pub use proxy::{Chain, ProxyInfo};

/// Version of the sockchain library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");
