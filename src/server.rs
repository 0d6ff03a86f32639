//! The listening socket, accept loop, and process lifecycle.
//!
//! [`Server`] binds a TCP or Unix domain socket from a bind string, accepts
//! connections on a single-threaded reactor, hands each connection its own
//! task, and runs the periodic garbage-collection sweep. SIGTERM (or Ctrl-C)
//! requests loop exit; shutdown then frees the listener, terminates the
//! worker queue, and joins the worker threads. In-flight requests are
//! abandoned with their sockets.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use compact_str::{CompactString, ToCompactString};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::Instrument;

use crate::handler::Registry;
use crate::worker::WorkerPool;
use crate::{conn, Config, Error};


/// The port used when a bind string names only a host.
pub const DEFAULT_PORT: u16 = 9800;

/// `sockaddr_un::sun_path` capacity, including the terminating NUL.
const SUN_PATH_LEN: usize = 108;


/// A parsed bind address: `unix:PATH`, `HOST:PORT`, or `HOST`.
///
/// IPv4 literals (including `0.0.0.0`) are accepted as-is; hostnames are
/// kept verbatim and resolved when the listener binds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindAddr {
    /// A TCP host (literal or name to resolve at bind time) and port.
    Tcp {
        /// Host part of the bind string.
        host: CompactString,
        /// Port part, or [`DEFAULT_PORT`] if omitted.
        port: u16,
    },
    /// A Unix domain socket path.
    Unix(PathBuf),
}

impl std::str::FromStr for BindAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(Error::Config("empty unix socket path".into()));
            }
            if path.len() >= SUN_PATH_LEN {
                return Err(Error::Config(
                    format!("unix socket path does not fit sun_path ({path})").into(),
                ));
            }
            return Ok(Self::Unix(path.into()));
        }

        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| Error::Config(format!("invalid port in bind string ({s})").into()))?;
                (host, port)
            },
            None => (s, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(Error::Config(format!("empty host in bind string ({s})").into()));
        }
        Ok(Self::Tcp { host: host.into(), port })
    }
}

impl fmt::Display for BindAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "{host}:{port}"),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

impl BindAddr {
    async fn listen(&self) -> Result<ListenerSocket, Error> {
        match self {
            Self::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port)).await?;
                Ok(ListenerSocket::Tcp(listener))
            },
            #[cfg(unix)]
            Self::Unix(path) => {
                let listener = tokio::net::UnixListener::bind(path)?;
                Ok(ListenerSocket::Unix(listener))
            },
            #[cfg(not(unix))]
            Self::Unix(_) => Err(Error::Config(
                "unix domain sockets are not supported on this platform".into(),
            )),
        }
    }
}


type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

enum ListenerSocket {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

impl ListenerSocket {
    /// Accepts one connection, splitting it into transport halves.
    ///
    /// Tokio listener sockets are non-blocking, and accepted sockets
    /// inherit non-blocking mode.
    async fn accept(&self) -> io::Result<(BoxedReader, BoxedWriter, CompactString)> {
        match self {
            Self::Tcp(listener) => {
                let (socket, peer) = listener.accept().await?;
                let (r, w) = socket.into_split();
                Ok((Box::new(r), Box::new(w), peer.to_compact_string()))
            },
            #[cfg(unix)]
            Self::Unix(listener) => {
                let (socket, _) = listener.accept().await?;
                let (r, w) = socket.into_split();
                Ok((Box::new(r), Box::new(w), CompactString::const_new("unix")))
            },
        }
    }
}


/// Waits for a signal requesting server shutdown.
#[cfg(unix)]
async fn quit() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r,
        _ = term.recv() => Ok(()),
    }
}

/// Waits for a signal requesting server shutdown.
#[cfg(not(unix))]
fn quit() -> impl std::future::Future<Output = io::Result<()>> {
    tokio::signal::ctrl_c()
}


/// A FastCGI application server: listener, connection tasks, worker pool.
#[derive(Debug)]
pub struct Server {
    config: Arc<Config>,
    registry: Arc<Registry>,
    pool: WorkerPool,
}

impl Server {
    /// Validates the configuration and starts the worker pool.
    ///
    /// # Errors
    /// Returns [`Error::Config`] for an invalid configuration or an empty
    /// handler registry.
    pub fn new(config: Config, registry: Registry) -> Result<Self, Error> {
        config.validate()?;
        if registry.is_empty() {
            return Err(Error::Config("no handler factories registered".into()));
        }
        let pool = WorkerPool::start(config.worker_threads);
        Ok(Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            pool,
        })
    }

    /// The server's configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Serves a single established transport until the peer closes it or a
    /// request without keep-connection finishes.
    ///
    /// This is the per-connection core of [`Server::run`], exposed for
    /// embedding and for exercising the server over in-memory transports.
    pub async fn serve_connection<R, W>(&self, reader: R, writer: W)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        conn::run(
            reader,
            writer,
            Arc::clone(&self.config),
            Arc::clone(&self.registry),
            Arc::clone(self.pool.queue()),
        )
        .await;
    }

    /// Binds the configured address and serves until a termination signal.
    ///
    /// Maps to the process boundary as follows: [`Ok`] is a clean,
    /// signal-driven exit (exit code 0); [`Err`] is a startup failure such
    /// as an unparseable bind string or a bind error (exit code 1). Accept
    /// errors on a live listener are logged and do not stop the server.
    ///
    /// # Errors
    /// Returns [`Error::Config`] for an invalid bind string and
    /// [`Error::Io`] if the listener cannot be created.
    pub async fn run(self) -> Result<(), Error> {
        let Self { config, registry, pool } = self;
        let res = run_listener(&config, &registry, &pool).await;
        tracing::info!("shutting down");
        pool.shutdown();
        res
    }

    /// Stops the worker pool without having entered [`Server::run`].
    pub fn shutdown(self) {
        self.pool.shutdown();
    }
}

/// The accept/GC/signal reactor loop. The caller joins the worker pool.
async fn run_listener(
    config: &Arc<Config>,
    registry: &Arc<Registry>,
    pool: &WorkerPool,
) -> Result<(), Error> {
    let bind: BindAddr = config.bind.parse()?;
    let listener = bind.listen().await?;
    tracing::info!(
        bind = %bind,
        workers = pool.thread_count(),
        "FastCGI server listening",
    );

    let mut conns: Vec<Arc<AtomicBool>> = Vec::new();
    let mut gc = tokio::time::interval(config.gc_interval);
    gc.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let quit = quit();
    tokio::pin!(quit);

    loop {
        tokio::select! {
            biased;
            res = &mut quit => {
                match res {
                    Ok(()) => tracing::info!("termination signal received"),
                    Err(error) => tracing::warn!(%error, "signal handler failed"),
                }
                return Ok(());
            },
            accepted = listener.accept() => match accepted {
                Ok((reader, writer, peer)) => {
                    let valid = Arc::new(AtomicBool::new(true));
                    conns.push(Arc::clone(&valid));

                    let config = Arc::clone(config);
                    let registry = Arc::clone(registry);
                    let queue = Arc::clone(pool.queue());
                    let span = tracing::error_span!("fastcgi_connection", %peer);
                    tokio::spawn(
                        async move {
                            tracing::debug!("connection accepted");
                            conn::run(reader, writer, config, registry, queue).await;
                            valid.store(false, Ordering::Release);
                        }
                        .instrument(span),
                    );
                },
                // One failed accept must not take the listener down
                Err(error) => tracing::warn!(%error, "accept failed"),
            },
            _ = gc.tick() => {
                let before = conns.len();
                conns.retain(|valid| valid.load(Ordering::Acquire));
                let dropped = before - conns.len();
                if dropped > 0 {
                    tracing::debug!(dropped, active = conns.len(), "connection list swept");
                }
            },
        }
    }
}
