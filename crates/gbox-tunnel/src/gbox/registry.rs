use std::{
    collections::HashSet,
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::gbox::{
    api::BoxLookup,
    net::PortMapping,
    process::{ProcessInfo, ProcessTable},
    tunnel::profile::TunnelProfile,
};

const FILE_PREFIX: &str = "gbox-tunnel-";

/// One running tunnel process, persisted so other invocations can list and stop it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub pid: u32,
    #[serde(rename = "boxid")]
    pub box_id: String,
    #[serde(rename = "localports")]
    pub local_ports: Vec<u16>,
    #[serde(rename = "remoteports")]
    pub remote_ports: Vec<u16>,
    #[serde(with = "rfc3339")]
    pub started_at: SystemTime,
    #[serde(default)]
    pub profile: TunnelProfile,
}

impl SessionRecord {
    pub fn new(pid: u32, box_id: &str, mappings: &[PortMapping], profile: TunnelProfile) -> Self {
        Self {
            pid,
            box_id: box_id.to_string(),
            local_ports: mappings.iter().map(|m| m.local).collect(),
            remote_ports: mappings.iter().map(|m| m.remote).collect(),
            started_at: now_seconds(),
            profile,
        }
    }

    pub fn first_local_port(&self) -> Option<u16> {
        self.local_ports.first().copied()
    }

    pub fn mappings(&self) -> Vec<PortMapping> {
        self.local_ports
            .iter()
            .zip(&self.remote_ports)
            .map(|(l, r)| PortMapping::new(*l, *r))
            .collect()
    }
}

/// Whole seconds, which is what the record format can carry.
fn now_seconds() -> SystemTime {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    UNIX_EPOCH + Duration::from_secs(secs)
}

mod rfc3339 {
    use std::time::SystemTime;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&humantime::format_rfc3339_seconds(*t))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SystemTime, D::Error> {
        let s = String::deserialize(d)?;
        humantime::parse_rfc3339_weak(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("a tunnel for box {box_id} on local port {port} is already running (PID {pid})")]
    AlreadyRunning { box_id: String, port: u16, pid: u32 },
    #[error("registry: record has no local ports")]
    NoPorts,
    #[error("registry: {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("registry: {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("registry: pid {0} is not a known tunnel process")]
    UnknownPid(u32),
    #[error("registry: terminate pid {pid}: {msg}")]
    Terminate { pid: u32, msg: String },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> RegistryError + '_ {
    move |source| RegistryError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Result of reconciling the registry against the OS and the box API.
#[derive(Debug, Default, Serialize)]
pub struct Reconciliation {
    /// Records whose process is alive, oldest first.
    pub sessions: Vec<SessionRecord>,
    /// Tunnel processes with no record.
    pub orphans: Vec<ProcessInfo>,
    /// Records removed because their process is gone.
    pub stale: Vec<SessionRecord>,
    /// Processes terminated because their box is no longer running.
    pub killed: Vec<SessionRecord>,
    /// Record files that could not be parsed and were removed.
    pub unreadable: Vec<PathBuf>,
}

/// Directory of `gbox-tunnel-<box>-<port>.json` records and their `.log` siblings.
#[derive(Debug, Clone)]
pub struct Registry {
    dir: PathBuf,
}

impl Registry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn stem(box_id: &str, port: u16) -> String {
        format!("{FILE_PREFIX}{}-{port}", sanitize(box_id))
    }

    pub fn record_path(&self, box_id: &str, port: u16) -> PathBuf {
        self.dir.join(format!("{}.json", Self::stem(box_id, port)))
    }

    pub fn log_path(&self, box_id: &str, port: u16) -> PathBuf {
        self.dir.join(format!("{}.log", Self::stem(box_id, port)))
    }

    fn log_path_for(record_path: &Path) -> PathBuf {
        record_path.with_extension("log")
    }

    pub fn ensure_dir(&self) -> Result<(), RegistryError> {
        fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))
    }

    /// Creates the record for `rec`'s first local port.
    ///
    /// Fails with [`RegistryError::AlreadyRunning`] if a record for the same box and port
    /// belongs to another live process. A record left by a dead process is replaced.
    pub fn write(
        &self,
        rec: &SessionRecord,
        procs: &dyn ProcessTable,
    ) -> Result<RecordGuard, RegistryError> {
        let port = rec.first_local_port().ok_or(RegistryError::NoPorts)?;
        self.ensure_dir()?;
        let path = self.record_path(&rec.box_id, port);
        let data = serde_json::to_vec_pretty(rec).map_err(|source| RegistryError::Decode {
            path: path.clone(),
            source,
        })?;

        let mut replaced_stale = false;
        loop {
            match create_exclusive(&path, &data, rec.pid) {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), pid = rec.pid, "registry: record written");
                    return Ok(RecordGuard {
                        path,
                        pid: rec.pid,
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists && !replaced_stale => {
                    if let Ok(existing) = read_record(&path) {
                        if existing.pid != rec.pid && procs.is_alive(existing.pid) {
                            return Err(RegistryError::AlreadyRunning {
                                box_id: rec.box_id.clone(),
                                port,
                                pid: existing.pid,
                            });
                        }
                    }
                    tracing::debug!(path = %path.display(), "registry: replacing stale record");
                    remove_if_exists(&path)?;
                    replaced_stale = true;
                }
                Err(err) => return Err(io_err(&path)(err)),
            }
        }
    }

    /// Removes the record for `box_id`/`port` if it belongs to `pid`, keeping the log.
    /// Returns whether a record was removed.
    pub fn remove(&self, box_id: &str, port: u16, pid: u32) -> Result<bool, RegistryError> {
        remove_owned(&self.record_path(box_id, port), pid)
    }

    fn purge(&self, record_path: &Path) -> Result<(), RegistryError> {
        remove_if_exists(record_path)?;
        remove_if_exists(&Self::log_path_for(record_path))
    }

    fn entries(&self) -> Result<Vec<(PathBuf, Result<SessionRecord, RegistryError>)>, RegistryError> {
        let rd = match fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_err(&self.dir)(err)),
        };
        let mut out = Vec::new();
        for ent in rd {
            let ent = ent.map_err(io_err(&self.dir))?;
            let path = ent.path();
            let is_record = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(FILE_PREFIX) && n.ends_with(".json"));
            if !is_record {
                continue;
            }
            let rec = read_record(&path);
            out.push((path, rec));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    /// Every parseable record, oldest first. Does not check liveness.
    pub fn list(&self) -> Result<Vec<SessionRecord>, RegistryError> {
        let mut out: Vec<SessionRecord> = self
            .entries()?
            .into_iter()
            .filter_map(|(_, r)| r.ok())
            .collect();
        out.sort_by_key(|r| r.started_at);
        Ok(out)
    }

    pub fn find(&self, box_id: &str) -> Result<Vec<SessionRecord>, RegistryError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| r.box_id == box_id)
            .collect())
    }

    /// Brings the registry in line with reality:
    /// - records of dead processes are removed together with their logs;
    /// - live tunnels whose box is gone or stopped are terminated and removed;
    /// - tunnel processes without a record are reported as orphans.
    ///
    /// Box lookup failures are logged and leave the record alone. Running it twice in a row
    /// with nothing changing in between gives the same `sessions`.
    pub async fn reconcile(
        &self,
        procs: Arc<dyn ProcessTable>,
        boxes: &dyn BoxLookup,
    ) -> Result<Reconciliation, RegistryError> {
        let running = {
            let procs = procs.clone();
            tokio::task::spawn_blocking(move || procs.tunnel_processes())
                .await
                .unwrap_or_default()
        };

        let mut out = Reconciliation::default();
        let mut recorded: HashSet<u32> = HashSet::new();

        for (path, rec) in self.entries()? {
            let rec = match rec {
                Ok(rec) => rec,
                Err(err) => {
                    tracing::warn!(path = %path.display(), err = %err, "registry: removing unreadable record");
                    self.purge(&path)?;
                    out.unreadable.push(path);
                    continue;
                }
            };
            recorded.insert(rec.pid);

            if !procs.is_alive(rec.pid) {
                tracing::info!(pid = rec.pid, box_id = %rec.box_id, "registry: removing stale record");
                self.purge(&path)?;
                out.stale.push(rec);
                continue;
            }

            match boxes.box_status(&rec.box_id).await {
                Ok(status) if status.is_running() => out.sessions.push(rec),
                Ok(status) => {
                    tracing::info!(
                        pid = rec.pid,
                        box_id = %rec.box_id,
                        status = ?status,
                        "registry: box is not running; stopping its tunnel"
                    );
                    match terminate(&procs, rec.pid).await {
                        Ok(()) => {
                            self.purge(&path)?;
                            out.killed.push(rec);
                        }
                        Err(err) => {
                            tracing::warn!(pid = rec.pid, err = %err, "registry: failed to stop tunnel");
                            out.sessions.push(rec);
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(box_id = %rec.box_id, err = %format!("{err:#}"), "registry: box lookup failed");
                    out.sessions.push(rec);
                }
            }
        }

        out.orphans = running
            .into_iter()
            .filter(|p| !recorded.contains(&p.pid))
            .collect();
        out.sessions.sort_by_key(|r| r.started_at);
        Ok(out)
    }

    /// Terminates every tunnel of `box_id` and removes their records and logs.
    pub async fn stop_box(
        &self,
        box_id: &str,
        procs: Arc<dyn ProcessTable>,
    ) -> Result<Vec<SessionRecord>, RegistryError> {
        let mut stopped = Vec::new();
        for (path, rec) in self.entries()? {
            let Ok(rec) = rec else { continue };
            if rec.box_id != box_id {
                continue;
            }
            if procs.is_alive(rec.pid) {
                terminate(&procs, rec.pid).await?;
            }
            self.purge(&path)?;
            stopped.push(rec);
        }
        Ok(stopped)
    }

    /// Terminates `pid` if it is a recorded tunnel or an orphaned one, and removes any
    /// records it owned.
    pub async fn kill(
        &self,
        pid: u32,
        procs: Arc<dyn ProcessTable>,
    ) -> Result<Vec<SessionRecord>, RegistryError> {
        let owned: Vec<(PathBuf, SessionRecord)> = self
            .entries()?
            .into_iter()
            .filter_map(|(p, r)| r.ok().map(|r| (p, r)))
            .filter(|(_, r)| r.pid == pid)
            .collect();

        if owned.is_empty() {
            let lookup = procs.clone();
            let is_tunnel = tokio::task::spawn_blocking(move || lookup.tunnel_processes())
                .await
                .unwrap_or_default()
                .iter()
                .any(|p| p.pid == pid);
            if !is_tunnel {
                return Err(RegistryError::UnknownPid(pid));
            }
        }

        terminate(&procs, pid).await?;
        let mut removed = Vec::with_capacity(owned.len());
        for (path, rec) in owned {
            self.purge(&path)?;
            removed.push(rec);
        }
        Ok(removed)
    }
}

async fn terminate(procs: &Arc<dyn ProcessTable>, pid: u32) -> Result<(), RegistryError> {
    let procs = procs.clone();
    tokio::task::spawn_blocking(move || procs.terminate(pid))
        .await
        .map_err(|e| RegistryError::Terminate {
            pid,
            msg: e.to_string(),
        })?
        .map_err(|e| RegistryError::Terminate {
            pid,
            msg: format!("{e:#}"),
        })
}

/// Removes the record when the owning process exits normally.
#[derive(Debug)]
pub struct RecordGuard {
    path: PathBuf,
    pid: u32,
}

impl RecordGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RecordGuard {
    fn drop(&mut self) {
        if let Err(err) = remove_owned(&self.path, self.pid) {
            tracing::warn!(err = %err, "registry: failed to remove record");
        }
    }
}

/// Bytes outside `[A-Za-z0-9_-]` become `_`.
pub fn sanitize(box_id: &str) -> String {
    box_id
        .bytes()
        .map(|b| {
            if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
                b as char
            } else {
                '_'
            }
        })
        .collect()
}

fn read_record(path: &Path) -> Result<SessionRecord, RegistryError> {
    let data = fs::read(path).map_err(io_err(path))?;
    serde_json::from_slice(&data).map_err(|source| RegistryError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

/// Writes to a private temp file and links it into place so readers never see a partial
/// record and two writers cannot both win.
fn create_exclusive(path: &Path, data: &[u8], pid: u32) -> io::Result<()> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{name}.{pid}.tmp"));
    fs::write(&tmp, data)?;
    let res = fs::hard_link(&tmp, path);
    let _ = fs::remove_file(&tmp);
    res
}

/// Leaves a record that has been claimed by another process. An unreadable record is
/// removed.
fn remove_owned(path: &Path, pid: u32) -> Result<bool, RegistryError> {
    match read_record(path) {
        Ok(rec) if rec.pid != pid => Ok(false),
        Err(RegistryError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => Ok(false),
        _ => {
            remove_if_exists(path)?;
            Ok(true)
        }
    }
}

fn remove_if_exists(path: &Path) -> Result<(), RegistryError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(path)(err)),
    }
}
