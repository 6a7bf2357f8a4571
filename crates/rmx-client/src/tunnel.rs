//! Local port forwarding
//!
//! A tunnel binds a loopback listener and, for every accepted socket, opens
//! a forwarded stream through its opener and splices the two until either
//! side closes. The opener is looked up per accepted socket, so a tunnel
//! keeps its listener across reconnects of the underlying session.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::TunnelError;

/// A bidirectional byte stream carried by the remote session
pub trait ForwardStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ForwardStream for T {}

/// Boxed forwarded stream
pub type BoxedStream = Box<dyn ForwardStream>;

/// Opens forwarded streams to a remote endpoint
#[async_trait]
pub trait ForwardOpener: Send + Sync + 'static {
    async fn open_forward(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<BoxedStream, TunnelError>;
}

/// Pause after a failed accept; errors such as fd exhaustion persist
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Source of accepted sockets for the forward loop
#[async_trait]
trait Accept: Send + 'static {
    async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait]
impl Accept for TcpListener {
    async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

/// (local port, remote host, remote port)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelSpec {
    /// Local port to bind; 0 picks a free port
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

impl TunnelSpec {
    pub fn new(local_port: u16, remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            local_port,
            remote_host: remote_host.into(),
            remote_port,
        }
    }
}

/// A running local forward
pub struct Tunnel {
    spec: TunnelSpec,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    tracker: TaskTracker,
    active: Arc<AtomicUsize>,
}

/// Decrements the active-stream count when a forward ends
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Tunnel {
    /// Bind the local listener and start accepting.
    ///
    /// `cancel` is normally a child of the owning connection's token, so
    /// closing the connection tears the tunnel down too.
    pub async fn bind(
        opener: Arc<dyn ForwardOpener>,
        spec: TunnelSpec,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, TunnelError> {
        let listener = TcpListener::bind(("127.0.0.1", spec.local_port))
            .await
            .map_err(|source| TunnelError::Bind {
                port: spec.local_port,
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| TunnelError::Bind {
            port: spec.local_port,
            source,
        })?;

        let tunnel = Arc::new(Self {
            spec,
            local_addr,
            cancel,
            tracker: TaskTracker::new(),
            active: Arc::new(AtomicUsize::new(0)),
        });

        tracing::info!(
            "Tunnel {} -> {}:{} open",
            local_addr,
            tunnel.spec.remote_host,
            tunnel.spec.remote_port
        );

        tunnel.tracker.spawn(accept_loop(
            listener,
            local_addr,
            opener,
            tunnel.spec.clone(),
            tunnel.cancel.clone(),
            tunnel.tracker.clone(),
            Arc::clone(&tunnel.active),
        ));
        Ok(tunnel)
    }

    pub fn spec(&self) -> &TunnelSpec {
        &self.spec
    }

    /// Address actually bound
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Number of forwarded streams currently spliced
    pub fn active_streams(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop listening and tear down every forwarded stream.
    ///
    /// Returns once the listener is dropped and all streams have ended.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("Tunnel {} closed", self.local_addr);
    }
}

async fn accept_loop<L: Accept>(
    listener: L,
    local_addr: SocketAddr,
    opener: Arc<dyn ForwardOpener>,
    spec: TunnelSpec,
    cancel: CancellationToken,
    tracker: TaskTracker,
    active: Arc<AtomicUsize>,
) {
    loop {
        let (socket, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Tunnel accept failed on {}: {}", local_addr, e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_ERROR_PAUSE) => {}
                    }
                    continue;
                }
            },
        };

        active.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveGuard(Arc::clone(&active));
        tracker.spawn(forward(
            socket,
            peer,
            Arc::clone(&opener),
            spec.clone(),
            cancel.clone(),
            guard,
        ));
    }
}

async fn forward(
    mut socket: TcpStream,
    peer: SocketAddr,
    opener: Arc<dyn ForwardOpener>,
    spec: TunnelSpec,
    cancel: CancellationToken,
    _guard: ActiveGuard,
) {
    let opened = tokio::select! {
        _ = cancel.cancelled() => return,
        opened = opener.open_forward(&spec.remote_host, spec.remote_port, peer) => opened,
    };
    let mut remote = match opened {
        Ok(remote) => remote,
        Err(e) => {
            tracing::debug!("Forward for {} failed: {}", peer, e);
            return;
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => {}
        result = tokio::io::copy_bidirectional(&mut socket, &mut remote) => match result {
            Ok((up, down)) => tracing::debug!("Forward for {} done ({} up, {} down)", peer, up, down),
            Err(e) => tracing::debug!("Forward for {} ended: {}", peer, e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Forwards over plain TCP to a local echo server
    struct TcpOpener;

    #[async_trait]
    impl ForwardOpener for TcpOpener {
        async fn open_forward(
            &self,
            host: &str,
            port: u16,
            _originator: SocketAddr,
        ) -> Result<BoxedStream, TunnelError> {
            let stream = TcpStream::connect((host, port))
                .await
                .map_err(|e| TunnelError::Forward {
                    host: host.to_string(),
                    port,
                    message: e.to_string(),
                })?;
            Ok(Box::new(stream))
        }
    }

    async fn echo_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = socket.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        port
    }

    async fn wait_for(tunnel: &Tunnel, count: usize) {
        for _ in 0..200 {
            if tunnel.active_streams() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} active streams, have {}", count, tunnel.active_streams());
    }

    #[tokio::test]
    async fn test_forwards_bytes() {
        let echo = echo_server().await;
        let tunnel = Tunnel::bind(
            Arc::new(TcpOpener),
            TunnelSpec::new(0, "127.0.0.1", echo),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let mut client = TcpStream::connect(tunnel.local_addr()).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        wait_for(&tunnel, 1).await;

        drop(client);
        wait_for(&tunnel, 0).await;
        tunnel.close().await;
    }

    #[tokio::test]
    async fn test_close_leaves_no_listener_or_streams() {
        let echo = echo_server().await;
        let tunnel = Tunnel::bind(
            Arc::new(TcpOpener),
            TunnelSpec::new(0, "127.0.0.1", echo),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let addr = tunnel.local_addr();

        let mut a = TcpStream::connect(addr).await.unwrap();
        let mut b = TcpStream::connect(addr).await.unwrap();
        a.write_all(b"a").await.unwrap();
        b.write_all(b"b").await.unwrap();
        wait_for(&tunnel, 2).await;

        tunnel.close().await;
        assert!(tunnel.is_closed());
        assert_eq!(tunnel.active_streams(), 0);

        // Both spliced sockets see EOF and the port no longer accepts
        let mut buf = Vec::new();
        let _ = a.read_to_end(&mut buf).await;
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_parent_cancel_closes_tunnel() {
        let echo = echo_server().await;
        let parent = CancellationToken::new();
        let tunnel = Tunnel::bind(
            Arc::new(TcpOpener),
            TunnelSpec::new(0, "127.0.0.1", echo),
            parent.child_token(),
        )
        .await
        .unwrap();

        parent.cancel();
        tunnel.close().await;
        assert!(TcpStream::connect(tunnel.local_addr()).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_forward_drops_local_socket() {
        let closed_port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let tunnel = Tunnel::bind(
            Arc::new(TcpOpener),
            TunnelSpec::new(0, "127.0.0.1", closed_port),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let mut client = TcpStream::connect(tunnel.local_addr()).await.unwrap();
        let mut buf = Vec::new();
        let n = client.read_to_end(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
        wait_for(&tunnel, 0).await;
        tunnel.close().await;
    }

    /// Fails every accept, counting calls
    struct FailingListener(Arc<AtomicU32>);

    #[async_trait]
    impl Accept for FailingListener {
        async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(std::io::Error::new(std::io::ErrorKind::Other, "too many open files"))
        }
    }

    #[tokio::test]
    async fn test_accept_errors_do_not_spin() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            FailingListener(Arc::clone(&calls)),
            SocketAddr::from(([127, 0, 0, 1], 0)),
            Arc::new(TcpOpener),
            TunnelSpec::new(0, "127.0.0.1", 1),
            cancel.clone(),
            TaskTracker::new(),
            Arc::new(AtomicUsize::new(0)),
        ));

        tokio::time::sleep(Duration::from_millis(350)).await;
        let seen = calls.load(Ordering::SeqCst);
        assert!(seen >= 1);
        assert!(seen <= 5, "accept retried {} times in 350ms", seen);

        // Cancellation still ends the loop while it is paused
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
