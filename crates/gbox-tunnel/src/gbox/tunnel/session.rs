use std::{sync::Arc, time::Duration};

use anyhow::Context;
use rand::{RngExt, rng};
use tokio::{sync::watch, task::JoinSet};

use crate::gbox::{
    api::TunnelUrlProvider,
    net::PortMapping,
    tunnel::{
        listener::{ListenerError, LocalListeners},
        multiplexer::{MuxOptions, Multiplexer},
        profile::TunnelProfile,
        transport::{self, redact_url},
    },
};

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub box_id: String,
    pub remote_ports: Vec<u16>,
    pub profile: TunnelProfile,
}

impl TunnelConfig {
    /// Remote ports in first-seen order, without repeats.
    pub fn remote_ports_of(mappings: &[PortMapping]) -> Vec<u16> {
        let mut out: Vec<u16> = Vec::with_capacity(mappings.len());
        for m in mappings {
            if !out.contains(&m.remote) {
                out.push(m.remote);
            }
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Connect attempts before the first successful connection. Failing all of them is fatal.
    pub connect_attempts: u32,
    pub connect_retry_delay: Duration,
    /// Base delay between reconnects once the session has been active.
    pub retry_interval: Duration,
    pub dial_timeout: Duration,
    pub mux: MuxOptions,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connect_attempts: 3,
            connect_retry_delay: Duration::from_secs(2),
            retry_interval: Duration::from_secs(3),
            dial_timeout: Duration::from_secs(10),
            mux: MuxOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Listening,
    Connecting,
    Active,
    Draining,
    Terminated,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Listening => "listening",
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Draining => "draining",
            SessionState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

enum Outcome {
    Disconnected(Option<String>),
    ListenersClosed,
    Shutdown,
}

/// Ties local listeners to one multiplexer at a time and replaces the multiplexer whenever
/// the remote connection drops.
pub struct Session {
    cfg: TunnelConfig,
    opts: SessionOptions,
    urls: Arc<dyn TunnelUrlProvider>,
    state: watch::Sender<SessionState>,
}

impl Session {
    pub fn new(cfg: TunnelConfig, opts: SessionOptions, urls: Arc<dyn TunnelUrlProvider>) -> Self {
        let (state, _rx) = watch::channel(SessionState::Listening);
        Self {
            cfg,
            opts,
            urls,
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: SessionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::debug!(box_id = %self.cfg.box_id, from = %prev, to = %next, "tunnel: session state");
        }
    }

    /// Binds the local listeners. Must succeed before [`Session::run`].
    pub async fn listen(&self, mappings: &[PortMapping]) -> Result<LocalListeners, ListenerError> {
        self.set_state(SessionState::Listening);
        LocalListeners::bind(mappings).await
    }

    /// Drives the session until shutdown, until the listeners are closed, or until the
    /// initial connection fails for good.
    ///
    /// The listeners stay bound across reconnects; only the accept loops and the
    /// multiplexer are replaced.
    pub async fn run(
        &self,
        listeners: &LocalListeners,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let mut connected_once = false;
        loop {
            if *shutdown.borrow() || listeners.is_closed() {
                self.set_state(SessionState::Terminated);
                return Ok(());
            }

            self.set_state(SessionState::Connecting);
            let mux = tokio::select! {
                _ = raised(&mut shutdown) => {
                    self.set_state(SessionState::Terminated);
                    return Ok(());
                }
                res = self.connect(connected_once) => match res {
                    Ok(mux) => mux,
                    Err(err) if !connected_once => {
                        self.set_state(SessionState::Terminated);
                        return Err(err);
                    }
                    Err(err) => {
                        tracing::warn!(box_id = %self.cfg.box_id, err = %format!("{err:#}"), "tunnel: reconnect failed");
                        if !self.pause(&mut shutdown).await {
                            self.set_state(SessionState::Terminated);
                            return Ok(());
                        }
                        continue;
                    }
                },
            };

            connected_once = true;
            self.set_state(SessionState::Active);
            tracing::info!(
                box_id = %self.cfg.box_id,
                profile = %self.cfg.profile,
                ports = ?self.cfg.remote_ports,
                "tunnel: connected"
            );

            let (stop_tx, stop_rx) = watch::channel(false);
            let mut accepts = listeners.spawn_accept_loops(&mux, stop_rx);
            let mut reader = {
                let mux = mux.clone();
                tokio::spawn(async move { mux.run().await })
            };

            let outcome = tokio::select! {
                res = &mut reader => Outcome::Disconnected(match res {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(err.to_string()),
                    Err(err) => Some(format!("reader task: {err}")),
                }),
                _ = join_all(&mut accepts) => Outcome::ListenersClosed,
                _ = raised(&mut shutdown) => Outcome::Shutdown,
            };

            self.set_state(SessionState::Draining);
            let _ = stop_tx.send(true);
            while accepts.join_next().await.is_some() {}
            mux.close().await;
            if !matches!(outcome, Outcome::Disconnected(_)) {
                let _ = reader.await;
            }

            match outcome {
                Outcome::Disconnected(err) => {
                    tracing::warn!(
                        box_id = %self.cfg.box_id,
                        err = %err.as_deref().unwrap_or("connection closed"),
                        retry_in = %humantime::format_duration(self.opts.retry_interval),
                        "tunnel: disconnected; reconnecting"
                    );
                    if !self.pause(&mut shutdown).await {
                        self.set_state(SessionState::Terminated);
                        return Ok(());
                    }
                }
                Outcome::ListenersClosed => {
                    tracing::info!(box_id = %self.cfg.box_id, "tunnel: local listeners closed");
                    self.set_state(SessionState::Terminated);
                    return Ok(());
                }
                Outcome::Shutdown => {
                    tracing::info!(box_id = %self.cfg.box_id, "tunnel: shutting down");
                    self.set_state(SessionState::Terminated);
                    return Ok(());
                }
            }
        }
    }

    /// One connect after the session has been active; up to `connect_attempts` before.
    async fn connect(&self, connected_once: bool) -> anyhow::Result<Arc<Multiplexer>> {
        if connected_once {
            return self.connect_once().await;
        }

        let attempts = self.opts.connect_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.connect_once().await {
                Ok(mux) => return Ok(mux),
                Err(err) if attempt >= attempts => {
                    return Err(err).context(format!("tunnel: connect failed after {attempts} attempts"));
                }
                Err(err) => {
                    tracing::warn!(
                        attempt,
                        attempts,
                        err = %format!("{err:#}"),
                        "tunnel: connect attempt failed"
                    );
                }
            }
            attempt += 1;
            tokio::time::sleep(self.opts.connect_retry_delay).await;
        }
    }

    async fn connect_once(&self) -> anyhow::Result<Arc<Multiplexer>> {
        let url = self
            .urls
            .tunnel_url(&self.cfg.box_id, &self.cfg.remote_ports)
            .await
            .context("tunnel: fetch tunnel url")?;
        tracing::debug!(url = %redact_url(&url), "tunnel: dialing");
        let t = transport::connect(&url, self.opts.dial_timeout).await?;
        Ok(Multiplexer::new(t, self.opts.mux.clone()))
    }

    /// Waits out the reconnect delay. Returns false when shutdown arrives first.
    async fn pause(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let delay = jittered(self.opts.retry_interval);
        tokio::select! {
            _ = raised(shutdown) => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

/// `base` plus up to 10% so a fleet of tunnels does not reconnect in lockstep.
fn jittered(base: Duration) -> Duration {
    let max = (base.as_millis() / 10) as u64;
    if max == 0 {
        return base;
    }
    base + Duration::from_millis(rng().random_range(0..=max))
}

async fn join_all(set: &mut JoinSet<()>) {
    while set.join_next().await.is_some() {}
}

async fn raised(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|v| *v).await;
}
