use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
    task::JoinSet,
};

use crate::gbox::{
    net::{LOCAL_BIND_HOST, PortMapping},
    process::{self, ProcessInfo},
    tunnel::multiplexer::Multiplexer,
};

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("port {port} already in use{}", in_use_by(.occupant))]
    PortInUse {
        port: u16,
        occupant: Option<ProcessInfo>,
    },
    #[error("bind 127.0.0.1:{port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
}

fn in_use_by(occupant: &Option<ProcessInfo>) -> String {
    match occupant {
        Some(p) => format!(" by: {} (PID {})", p.name, p.pid),
        None => String::new(),
    }
}

struct BoundListener {
    mapping: PortMapping,
    listener: Arc<TcpListener>,
}

/// The local side of a tunnel: one loopback listener per port mapping.
///
/// Listeners are bound once and stay bound for the whole process, so reconnects never give
/// up the ports. Per-session accept loops are started with
/// [`LocalListeners::spawn_accept_loops`] and stopped through their stop flag.
pub struct LocalListeners {
    bound: Vec<BoundListener>,
    closed: watch::Sender<bool>,
}

impl std::fmt::Debug for LocalListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalListeners")
            .field("mappings", &self.mappings())
            .finish_non_exhaustive()
    }
}

impl LocalListeners {
    /// Binds every mapping or none. A port in use is reported with its owner when the OS
    /// lets us find it.
    pub async fn bind(mappings: &[PortMapping]) -> Result<Self, ListenerError> {
        let mut bound = Vec::with_capacity(mappings.len());
        for m in mappings {
            let ln = match TcpListener::bind((LOCAL_BIND_HOST, m.local)).await {
                Ok(ln) => ln,
                Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
                    let port = m.local;
                    let occupant = tokio::task::spawn_blocking(move || process::find_process_on_port(port))
                        .await
                        .ok()
                        .flatten();
                    return Err(ListenerError::PortInUse { port, occupant });
                }
                Err(source) => {
                    return Err(ListenerError::Bind {
                        port: m.local,
                        source,
                    });
                }
            };
            let local = ln.local_addr().map(|a| a.port()).unwrap_or(m.local);
            let mapping = PortMapping::new(local, m.remote);
            tracing::info!(local = %format!("{LOCAL_BIND_HOST}:{local}"), remote = m.remote, "tunnel: listening");
            bound.push(BoundListener {
                mapping,
                listener: Arc::new(ln),
            });
        }
        let (closed, _rx) = watch::channel(false);
        Ok(Self { bound, closed })
    }

    /// Mappings with the ports actually bound (differs from the request only for port 0).
    pub fn mappings(&self) -> Vec<PortMapping> {
        self.bound.iter().map(|b| b.mapping).collect()
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.bound
            .iter()
            .filter_map(|b| b.listener.local_addr().ok())
            .collect()
    }

    /// Permanently stops accepting. Running accept loops finish, which the session treats
    /// as a local shutdown rather than a disconnect.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Starts one accept loop per listener, handing each accepted connection to `mux` as a
    /// new stream. The loops exit only when `stop` flips to true or on
    /// [`LocalListeners::close`]; accept errors are retried.
    pub fn spawn_accept_loops(
        &self,
        mux: &Arc<Multiplexer>,
        stop: watch::Receiver<bool>,
    ) -> JoinSet<()> {
        let mut set = JoinSet::new();
        for b in &self.bound {
            let ln = b.listener.clone();
            let mapping = b.mapping;
            let mux = mux.clone();
            let stop = stop.clone();
            let closed = self.closed.subscribe();
            set.spawn(accept_loop(ln, mapping, mux, stop, closed));
        }
        set
    }
}

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

#[async_trait]
trait Acceptor: Send + Sync + 'static {
    async fn accept_conn(&self) -> io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait]
impl Acceptor for TcpListener {
    async fn accept_conn(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.accept().await
    }
}

async fn accept_loop<A: Acceptor>(
    ln: Arc<A>,
    mapping: PortMapping,
    mux: Arc<Multiplexer>,
    mut stop: watch::Receiver<bool>,
    mut closed: watch::Receiver<bool>,
) {
    let target = mapping.remote_target();
    let mut backoff = ACCEPT_BACKOFF_MIN;
    loop {
        let res = tokio::select! {
            _ = raised(&mut stop) => return,
            _ = raised(&mut closed) => return,
            res = ln.accept_conn() => res,
        };
        let (conn, peer) = match res {
            Ok(c) => {
                backoff = ACCEPT_BACKOFF_MIN;
                c
            }
            Err(err) => {
                // EMFILE, ECONNABORTED and friends: the listener itself is still fine.
                tracing::warn!(local = mapping.local, err = %err, retry_in = ?backoff, "tunnel: accept failed");
                tokio::select! {
                    _ = raised(&mut stop) => return,
                    _ = raised(&mut closed) => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                continue;
            }
        };
        let _ = conn.set_nodelay(true);

        let Some(id) = mux.new_stream_id() else {
            tracing::warn!(peer = %peer, local = mapping.local, "tunnel: stream ids exhausted; dropping connection");
            continue;
        };
        tracing::debug!(stream = id, peer = %peer, local = mapping.local, remote = mapping.remote, "tunnel: accepted local connection");
        let st = mux.add_stream(id, conn).await;
        if let Err(err) = st.open(&target).await {
            tracing::warn!(stream = id, err = %err, "tunnel: failed to send open");
            st.close().await;
        }
    }
}

async fn raised(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|v| *v).await;
}
