//! xhrpool - pooled, promise-style HTTP requests with typed status errors
//!
//! A small convenience layer over a native request primitive, in the style of
//! browser `XMLHttpRequest` helpers. Requests run on transports borrowed from
//! a bounded pool, report their outcome through named callbacks, and turn
//! non-success statuses into a typed error hierarchy.
//!
//! ## Features
//!
//! - **Bounded transport pool** that waits for a transport to free up
//! - **Named callbacks** (`success`, `error`, `complete`) that may be
//!   registered before or after the result arrives
//! - **Status classification** into redirect, client and server errors
//! - **Deep-merged options** with class-level defaults
//! - **Pluggable backend**, reqwest by default
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use xhrpool::{Client, RequestOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::new();
//!     client
//!         .get(RequestOptions::new().url("https://example.com/api/items").param("page", 1))
//!         .await?
//!         .on_success(|payload, _| println!("Body: {}", payload))
//!         .on_error(|error, _| eprintln!("{}", error))
//!         .on_complete(|_| println!("done"));
//!
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod error;
pub mod native;
pub mod pool;
pub mod promise;
pub mod request;
pub mod response;
pub mod status;
mod sync;
pub mod transport;

// Re-export main types for convenience
pub use client::{Client, ClientBuilder};
pub use error::{Error, ErrorKind, RequestError, Result};
pub use native::{NativeFactory, NativeRequest, ReadyState, ReqwestFactory, ReqwestNative};
pub use pool::{Pool, PoolConfig, PoolStats};
pub use promise::{Invocation, Promise, Receiver};
pub use request::{Body, Params, RequestOptions, TransportOptions, XmlDocument};
pub use response::{Payload, ResponseCallback, ResponseEvent, ResponseInvocation, ResponsePromise};
pub use transport::Transport;

// Re-export common HTTP types
pub use http::Method;

// Re-export JSON types
pub use serde_json::{Map as JsonMap, Value as JsonValue};
