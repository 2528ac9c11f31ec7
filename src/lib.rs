//! # recache — a caching forward HTTP proxy with conditional revalidation
//!
//! recache accepts forward-proxy GET requests, serves previously fetched
//! origin responses out of a bounded LRU cache, and keeps cached objects
//! fresh with `If-Modified-Since` revalidation. Accepted connections flow
//! through a bounded dispatch queue into a fixed pool of workers, and every
//! cache insert is appended to a persistence log replayed at startup.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use recache::{cache::ObjectCache, config::Config, proxy::ProxyServer};
//! use std::net::SocketAddr;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let cache = Arc::new(ObjectCache::new(&config.cache));
//!     let bind_addr: SocketAddr = "0.0.0.0:8080".parse()?;
//!     let server = ProxyServer::new(config, bind_addr, cache);
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod proxy;

// Re-export commonly used types
pub use cache::{CacheHit, CacheKey, CacheStats, ObjectCache};
pub use config::{CacheConfig, Config, ServerConfig};
pub use dispatch::DispatchQueue;
pub use error::{ProxyError, ProxyResult};
pub use proxy::{ProxyServer, SessionOutcome};
