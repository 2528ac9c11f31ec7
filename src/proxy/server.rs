use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::cache::ObjectCache;
use crate::config::Config;
use crate::dispatch::DispatchQueue;
use crate::error::ProxyError;

use super::session::{self, SessionOutcome};

/// The proxy server: a listener feeding a bounded dispatch queue serviced by
/// a fixed pool of workers.
///
/// Constructed explicitly and handed its collaborators as parameters; there
/// are no process-wide singletons.
pub struct ProxyServer {
    bind_addr: SocketAddr,
    config: Config,
    cache: Arc<ObjectCache>,
    queue: Arc<DispatchQueue<TcpStream>>,
}

impl ProxyServer {
    /// Create a server over an already-constructed cache
    pub fn new(config: Config, bind_addr: SocketAddr, cache: Arc<ObjectCache>) -> Self {
        let queue = Arc::new(DispatchQueue::new(config.server.queue_capacity));
        Self {
            bind_addr,
            config,
            cache,
            queue,
        }
    }

    /// Handle to the shared object cache
    pub fn cache_handle(&self) -> Arc<ObjectCache> {
        Arc::clone(&self.cache)
    }

    /// Bind the listener, spawn the worker pool, and run the accept loop.
    ///
    /// Workers live for the lifetime of the process; they are not tracked or
    /// individually addressed. The accept loop suspends on a full queue,
    /// which is the only backpressure mechanism.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("proxy listening on {}", local_addr);

        for id in 0..self.config.server.workers {
            let queue = Arc::clone(&self.queue);
            let cache = Arc::clone(&self.cache);
            tokio::spawn(worker(id, queue, cache));
        }
        info!("{} worker(s) started", self.config.server.workers);

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            };
            debug!("accepted connection from {}", peer);
            self.queue.insert(stream).await;
        }
    }
}

/// One worker: repeatedly pull a connection and run a session to completion.
///
/// The connection is consumed (and therefore closed) by the session on every
/// path; a session failure never outlives the session.
async fn worker(id: usize, queue: Arc<DispatchQueue<TcpStream>>, cache: Arc<ObjectCache>) {
    loop {
        let stream = queue.remove().await;
        match session::handle_session(stream, Arc::clone(&cache)).await {
            Ok(outcome) => log_outcome(id, &outcome),
            Err(e) => log_failure(id, &e),
        }
    }
}

fn log_outcome(worker: usize, outcome: &SessionOutcome) {
    match outcome {
        SessionOutcome::NotImplemented => {
            debug!("worker[{}] rejected non-GET request", worker);
        }
        SessionOutcome::BadRequest => {
            debug!("worker[{}] rejected unparsable request", worker);
        }
        SessionOutcome::Unreachable => {
            warn!("worker[{}] origin unreachable", worker);
        }
        SessionOutcome::Fetched { bytes, cached } => {
            info!(
                "worker[{}] miss: fetched {} bytes (cached: {})",
                worker, bytes, cached
            );
        }
        SessionOutcome::NotModified { bytes } => {
            info!(
                "worker[{}] hit: served {} cached bytes after 304",
                worker, bytes
            );
        }
        SessionOutcome::Updated { bytes, cached } => {
            info!(
                "worker[{}] hit refreshed: {} bytes (cached: {})",
                worker, bytes, cached
            );
        }
    }
}

fn log_failure(worker: usize, error: &ProxyError) {
    match error {
        ProxyError::Transfer { .. } => {
            debug!("worker[{}] session aborted: {}", worker, error);
        }
        _ => warn!("worker[{}] session failed: {}", worker, error),
    }
}
