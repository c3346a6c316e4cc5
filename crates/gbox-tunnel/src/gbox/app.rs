use std::{ffi::OsString, path::PathBuf, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;

use crate::gbox::{
    api::{self, ApiError, BoxLookup, BoxStatus, GboxApi},
    config::{self, Config},
    daemon::{self, Supervisor},
    logging,
    net::{self, LOCAL_BIND_HOST, PortMapping},
    process::{ProcessTable, SystemProcesses},
    registry::{Reconciliation, Registry, RegistryError, SessionRecord},
    tunnel::{
        profile::{ADB_PORT, TunnelProfile},
        session::{Session, TunnelConfig},
    },
};

#[derive(Debug, Clone, Default)]
pub struct GlobalOpts {
    pub config: Option<PathBuf>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Command {
    /// ADB profile: one mapping `port -> 5555`.
    Start {
        box_id: String,
        port: Option<u16>,
        foreground: bool,
    },
    PortForward {
        box_id: String,
        ports: Vec<String>,
        foreground: bool,
    },
    Stop {
        box_id: String,
    },
    List {
        json: bool,
    },
    Kill {
        pid: u32,
    },
}

pub async fn run(global: GlobalOpts, cmd: Command) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(global.config)?;
    let mut cfg = config::load_config(resolved.as_ref().map(|r| r.path.as_path()))
        .with_context(|| match &resolved {
            Some(r) => format!("load config: {}", r.path.display()),
            None => "load config".to_string(),
        })?;
    cfg.apply_overrides(global.base_url, global.api_key);

    let supervised = std::env::var_os(daemon::SUPERVISED_ENV).is_some();
    let _logrt = logging::init(&cfg.logging, supervised)?;

    if let Some(r) = &resolved {
        tracing::debug!(config = %r.path.display(), source = %r.source, "config: loaded");
    }

    let registry = Registry::new(&cfg.registry_dir);
    match cmd {
        Command::Start {
            box_id,
            port,
            foreground,
        } => {
            let mapping = PortMapping::new(port.unwrap_or(ADB_PORT), ADB_PORT);
            start_tunnel(&cfg, &registry, &box_id, vec![mapping], TunnelProfile::Adb, foreground).await
        }
        Command::PortForward {
            box_id,
            ports,
            foreground,
        } => {
            let mappings = net::parse_mappings(&ports)?;
            start_tunnel(&cfg, &registry, &box_id, mappings, TunnelProfile::PortForward, foreground).await
        }
        Command::Stop { box_id } => stop(&registry, &box_id).await,
        Command::List { json } => list(&cfg, &registry, json).await,
        Command::Kill { pid } => kill(&registry, pid).await,
    }
}

async fn start_tunnel(
    cfg: &Config,
    registry: &Registry,
    box_id: &str,
    mappings: Vec<PortMapping>,
    profile: TunnelProfile,
    foreground: bool,
) -> anyhow::Result<()> {
    let box_id = box_id.trim();
    if box_id.is_empty() {
        anyhow::bail!("box id is required");
    }
    if cfg.api.api_key.is_empty() {
        anyhow::bail!(ApiError::MissingApiKey);
    }

    if foreground {
        return run_tunnel(cfg, registry, box_id, &mappings, profile).await;
    }

    let procs = SystemProcesses::new();
    if let Some(rec) = registry
        .find(box_id)?
        .into_iter()
        .find(|r| {
            r.local_ports.iter().any(|p| mappings.iter().any(|m| m.local == *p))
                && procs.is_alive(r.pid)
        })
    {
        let port = rec.first_local_port().unwrap_or_default();
        return Err(RegistryError::AlreadyRunning {
            box_id: box_id.to_string(),
            port,
            pid: rec.pid,
        }
        .into());
    }

    let lookup = GboxApi::new(
        &cfg.api.base_url,
        &cfg.api.api_key,
        profile,
        cfg.tunnel.request_timeout,
    )?;
    api::ensure_running(&lookup, box_id).await?;

    let args: Vec<OsString> = std::env::args_os().skip(1).collect();
    let first = mappings[0].local;
    let rec = Supervisor::current_exe()?
        .spawn(registry, box_id, first, args, Some(&cfg.api.api_key))
        .await?;

    println!(
        "tunnel for box {} started in the background (PID {})",
        rec.box_id, rec.pid
    );
    for m in rec.mappings() {
        println!("  {LOCAL_BIND_HOST}:{} -> {}:{}", m.local, rec.box_id, m.remote);
    }
    println!("log: {}", registry.log_path(box_id, first).display());
    Ok(())
}

/// Foreground engine: bind, claim the registry slot, then run the session until a signal.
async fn run_tunnel(
    cfg: &Config,
    registry: &Registry,
    box_id: &str,
    mappings: &[PortMapping],
    profile: TunnelProfile,
) -> anyhow::Result<()> {
    let client = Arc::new(GboxApi::new(
        &cfg.api.base_url,
        &cfg.api.api_key,
        profile,
        cfg.tunnel.request_timeout,
    )?);

    let session = Session::new(
        TunnelConfig {
            box_id: box_id.to_string(),
            remote_ports: TunnelConfig::remote_ports_of(mappings),
            profile,
        },
        cfg.tunnel.session_options(),
        client.clone(),
    );
    let listeners = session.listen(mappings).await?;
    api::ensure_running(&*client, box_id).await?;

    // The record doubles as the readiness signal for a supervisor, so it is written only
    // once every port is bound and the box is known to be up.
    let procs = SystemProcesses::new();
    let rec = SessionRecord::new(std::process::id(), box_id, &listeners.mappings(), profile);
    let guard = registry.write(&rec, &procs)?;

    tracing::info!(
        box_id,
        profile = %profile,
        ports = %mappings.iter().map(|m| m.to_string()).collect::<Vec<_>>().join(","),
        record = %guard.path().display(),
        "gbox-tunnel: starting"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown: signal");
        let _ = shutdown_tx.send(true);
    });

    let res = session.run(&listeners, shutdown_rx).await;
    listeners.close();
    drop(guard);
    res
}

async fn stop(registry: &Registry, box_id: &str) -> anyhow::Result<()> {
    let procs: Arc<dyn ProcessTable> = Arc::new(SystemProcesses::new());
    let stopped = registry.stop_box(box_id, procs).await?;
    if stopped.is_empty() {
        println!("no tunnels running for box {box_id}");
        return Ok(());
    }
    for rec in &stopped {
        println!("stopped tunnel for box {} (PID {})", rec.box_id, rec.pid);
    }
    Ok(())
}

async fn kill(registry: &Registry, pid: u32) -> anyhow::Result<()> {
    let procs: Arc<dyn ProcessTable> = Arc::new(SystemProcesses::new());
    let removed = registry.kill(pid, procs).await?;
    match removed.first() {
        Some(rec) => println!("killed tunnel for box {} (PID {pid})", rec.box_id),
        None => println!("killed orphaned tunnel process (PID {pid})"),
    }
    Ok(())
}

/// Used by `list` when no API key is configured: every record is kept as-is.
struct NoBoxLookup;

#[async_trait]
impl BoxLookup for NoBoxLookup {
    async fn box_status(&self, _box_id: &str) -> anyhow::Result<BoxStatus> {
        anyhow::bail!("no api key configured; box status not checked")
    }
}

async fn list(cfg: &Config, registry: &Registry, json: bool) -> anyhow::Result<()> {
    let procs: Arc<dyn ProcessTable> = Arc::new(SystemProcesses::new());
    let report = if cfg.api.api_key.is_empty() {
        registry.reconcile(procs, &NoBoxLookup).await?
    } else {
        // Profile only affects the API prefix; box lookups use the versioned path.
        let api = GboxApi::new(
            &cfg.api.base_url,
            &cfg.api.api_key,
            TunnelProfile::Adb,
            cfg.tunnel.request_timeout,
        )?;
        registry.reconcile(procs, &api).await?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", render_table(&report));
    }
    Ok(())
}

fn render_table(r: &Reconciliation) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    if r.sessions.is_empty() {
        out.push_str("no tunnels running\n");
    } else {
        let _ = writeln!(
            out,
            "{:<8} {:<24} {:<13} {:<20} {}",
            "PID", "BOX", "PROFILE", "STARTED", "PORTS"
        );
        for s in &r.sessions {
            let ports = s
                .mappings()
                .iter()
                .map(|m| format!("{}->{}", m.local, m.remote))
                .collect::<Vec<_>>()
                .join(",");
            let _ = writeln!(
                out,
                "{:<8} {:<24} {:<13} {:<20} {}",
                s.pid,
                s.box_id,
                s.profile.as_str(),
                humantime::format_rfc3339_seconds(s.started_at).to_string(),
                ports
            );
        }
    }

    if !r.orphans.is_empty() {
        out.push_str("\norphaned tunnel processes (no record; stop with `kill <pid>`):\n");
        for p in &r.orphans {
            let _ = writeln!(
                out,
                "{:<8} {}",
                p.pid,
                p.command.as_deref().unwrap_or(p.name.as_str())
            );
        }
    }
    if !r.killed.is_empty() {
        let _ = writeln!(
            out,
            "\nstopped {} tunnel(s) whose box is no longer running",
            r.killed.len()
        );
    }
    out
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
