//! TCP listener and per-connection task management.
//!
//! Both front-ends share this accept loop: it caps concurrent connections,
//! spawns one task per accepted connection and hands the stream to the
//! front-end's [`ConnectionHandler`]. A failing connection never affects the
//! listener or other connections.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn, Instrument};

use crate::error::ProxyError;
use crate::relay::RelayReport;

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Front-end protocol handling for one accepted connection.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Protocol name used in logs and spans.
    fn protocol(&self) -> &'static str;

    /// Serve a single client connection to completion.
    async fn handle(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        stats: &ListenerStats,
    ) -> Result<(), ProxyError>;
}

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Requests rejected for missing or wrong credentials.
    pub auth_failed: AtomicU64,
    /// Outbound dials that failed.
    pub dial_failed: AtomicU64,
    /// Outbound dials that succeeded.
    pub dial_succeeded: AtomicU64,
    /// Bytes proxied to targets.
    pub bytes_to_target: AtomicU64,
    /// Bytes proxied from targets.
    pub bytes_from_target: AtomicU64,
}

impl ListenerStats {
    pub(crate) fn record_auth_failure(&self) {
        self.auth_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dial(&self, ok: bool) {
        let counter = if ok {
            &self.dial_succeeded
        } else {
            &self.dial_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_relay(&self, report: &RelayReport) {
        self.bytes_to_target
            .fetch_add(report.client_to_target, Ordering::Relaxed);
        self.bytes_from_target
            .fetch_add(report.target_to_client, Ordering::Relaxed);
    }
}

/// A TCP listener serving one proxy front-end.
pub struct Listener {
    /// Listener configuration.
    config: ListenerConfig,
    /// The TCP listener.
    listener: TcpListener,
    /// Protocol handler for accepted connections.
    handler: Arc<dyn ConnectionHandler>,
    /// Connection semaphore for limiting concurrent connections.
    conn_semaphore: Arc<Semaphore>,
    /// Statistics.
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind a new listener.
    pub async fn bind(
        config: ListenerConfig,
        handler: Arc<dyn ConnectionHandler>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            protocol = handler.protocol(),
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            config,
            handler,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Accept and handle connections until `shutdown` flips to `true`.
    ///
    /// In-flight connections keep running after the loop stops.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        let protocol = self.handler.protocol();
        info!(protocol, bind_addr = %local_addr, "Listener started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let accepted = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => self.spawn_connection(stream, peer_addr),
                Err(e) => {
                    error!(protocol, error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        info!(protocol, bind_addr = %local_addr, "Listener stopped");
        Ok(())
    }

    fn spawn_connection(self: &Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        let protocol = self.handler.protocol();

        // Try to acquire a permit
        let permit = match Arc::clone(&self.conn_semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.stats
                    .connections_rejected
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    protocol,
                    peer_addr = %peer_addr,
                    max_connections = self.config.max_connections,
                    "Connection rejected: max connections reached"
                );
                return;
            }
        };

        self.stats
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);
        self.stats
            .connections_active
            .fetch_add(1, Ordering::Relaxed);

        let handler = Arc::clone(&self.handler);
        let stats = Arc::clone(&self.stats);

        tokio::spawn(
            async move {
                if let Err(e) = handler.handle(stream, peer_addr, &stats).await {
                    debug!(
                        reason = e.reason_code(),
                        error = %e,
                        "Connection error"
                    );
                }

                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                drop(permit);
            }
            .instrument(tracing::info_span!("connection", protocol, peer = %peer_addr)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    struct Greeter;

    #[async_trait]
    impl ConnectionHandler for Greeter {
        fn protocol(&self) -> &'static str {
            "greeter"
        }

        async fn handle(
            &self,
            mut stream: TcpStream,
            _peer_addr: SocketAddr,
            _stats: &ListenerStats,
        ) -> Result<(), ProxyError> {
            stream.write_all(b"hi").await?;
            Ok(())
        }
    }

    #[test]
    fn test_listener_config_default() {
        let config = ListenerConfig::new("[::]:8080".parse().unwrap());
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
    }

    #[tokio::test]
    async fn test_listener_serves_and_stops() {
        use tokio::io::AsyncReadExt;

        let listener = Listener::bind(
            ListenerConfig::new("[::1]:0".parse().unwrap()),
            Arc::new(Greeter),
        )
        .await
        .unwrap();
        let addr = listener.local_addr().unwrap();
        let listener = Arc::new(listener);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(&listener).run(shutdown_rx));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hi");

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            listener.stats().connections_accepted.load(Ordering::Relaxed),
            1
        );
    }
}
