use crate::error::Result;
use crate::hi::connection::Connection;
use crate::hi::handler::FastcgiHooks;

use futures::future;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::time;
use tokio_util::sync::CancellationToken;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 9000;
pub const DEFAULT_MAX_CONNS: usize = 64;
pub const DEFAULT_MAX_REQS: usize = 64;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server settings plus the application hooks. Shared read-only by every
/// connection once the server starts.
#[derive(Debug)]
pub struct FastcgiConfig<H> {
    host: String,
    port: u16,
    max_conns: usize,
    max_reqs: usize,
    hooks: H,
}

impl<H: FastcgiHooks> FastcgiConfig<H> {
    pub fn new(hooks: H) -> FastcgiConfig<H> {
        FastcgiConfig {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            max_conns: DEFAULT_MAX_CONNS,
            max_reqs: DEFAULT_MAX_REQS,
            hooks,
        }
    }

    pub fn with_host<S: Into<String>>(mut self, host: S) -> FastcgiConfig<H> {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> FastcgiConfig<H> {
        self.port = port;
        self
    }

    /// Concurrent connections the server accepts. 0 means no limit.
    pub fn with_max_conns(mut self, max_conns: usize) -> FastcgiConfig<H> {
        self.max_conns = max_conns;
        self
    }

    /// Live requests allowed per connection. 0 means no limit.
    pub fn with_max_reqs(mut self, max_reqs: usize) -> FastcgiConfig<H> {
        self.max_reqs = max_reqs;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn max_conns(&self) -> usize {
        self.max_conns
    }

    pub fn max_reqs(&self) -> usize {
        self.max_reqs
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }
}

/// Connection counters for one server.
#[derive(Debug, Default)]
pub struct Stats {
    active: AtomicUsize,
    accepted: AtomicUsize,
}

impl Stats {
    /// Connections currently being served.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

struct ActiveConnection(Arc<Stats>);

impl ActiveConnection {
    fn new(stats: Arc<Stats>) -> ActiveConnection {
        stats.active.fetch_add(1, Ordering::SeqCst);
        ActiveConnection(stats)
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Waits out a failed accept. Returns true if `shutdown` completed meanwhile.
async fn accept_backoff<F: Future<Output = ()> + Unpin>(shutdown: &mut F) -> bool {
    tokio::select! {
        _ = shutdown => true,
        _ = time::sleep(ACCEPT_BACKOFF) => false,
    }
}

/// Serves a single already-established transport to completion.
pub async fn serve_connection<T, H>(io: T, config: Arc<FastcgiConfig<H>>) -> Result<()>
    where T: AsyncRead + AsyncWrite + Send + Unpin,
          H: FastcgiHooks,
{
    Connection::new(io, config).run().await
}

pub struct FastcgiServer<H> {
    listener: TcpListener,
    config: Arc<FastcgiConfig<H>>,
    stats: Arc<Stats>,
}

impl<H: FastcgiHooks> FastcgiServer<H> {
    /// Binds a TCP listener on the configured host and port.
    pub async fn bind(config: FastcgiConfig<H>) -> Result<FastcgiServer<H>> {
        let listener = TcpListener::bind((config.host(), config.port())).await?;
        Ok(FastcgiServer::from_listener(listener, config))
    }

    pub fn from_listener(listener: TcpListener, config: FastcgiConfig<H>) -> FastcgiServer<H> {
        FastcgiServer {
            listener,
            config: Arc::new(config),
            stats: Arc::new(Stats::default()),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn config(&self) -> &Arc<FastcgiConfig<H>> {
        &self.config
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    pub async fn serve(self) -> Result<()> {
        self.serve_until(future::pending()).await
    }

    /// Accepts connections until `shutdown` completes, then tells every
    /// connection task to stop reading.
    pub async fn serve_until<F>(self, shutdown: F) -> Result<()>
        where F: Future<Output = ()>
    {
        let stop = CancellationToken::new();
        let slots = match self.config.max_conns() {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };
        tokio::pin!(shutdown);

        info!("FastCGI server listening on {:?}", self.listener.local_addr());
        loop {
            let permit = match slots {
                Some(ref slots) => tokio::select! {
                    _ = &mut shutdown => break,
                    permit = slots.clone().acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                },
                None => None,
            };

            let accepted = tokio::select! {
                _ = &mut shutdown => break,
                res = self.listener.accept() => res,
            };
            let (socket, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("error accepting connection: {}", e);
                    if accept_backoff(&mut shutdown).await {
                        break;
                    }
                    continue;
                },
            };

            self.stats.accepted.fetch_add(1, Ordering::SeqCst);
            let active = ActiveConnection::new(self.stats.clone());
            let config = self.config.clone();
            let token = stop.child_token();
            debug!("accepted connection from {}", peer);
            tokio::spawn(async move {
                let _active = active;
                let _permit = permit;
                if let Err(e) = Connection::with_shutdown(socket, config, token).run().await {
                    warn!("connection from {} ended: {}", peer, e);
                } else {
                    debug!("connection from {} closed", peer);
                }
            });
        }

        stop.cancel();
        info!("FastCGI server stopped ({} connections still draining)", self.stats.active());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn accept_backoff_waits_unless_shutting_down() {
        let started = Instant::now();
        assert!(!accept_backoff(&mut future::pending()).await);
        assert!(started.elapsed() >= ACCEPT_BACKOFF);

        let started = Instant::now();
        assert!(accept_backoff(&mut future::ready(())).await);
        assert!(started.elapsed() < ACCEPT_BACKOFF);
    }
}
