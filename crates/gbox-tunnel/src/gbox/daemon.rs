use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::{Duration, Instant},
};

use anyhow::Context;

use crate::gbox::{
    config::API_KEY_ENV,
    process::FOREGROUND_FLAG,
    registry::{Registry, SessionRecord},
};

pub const READY_TIMEOUT: Duration = Duration::from_secs(15);

/// Set in a supervised child's environment; it then logs to stderr regardless of config.
pub const SUPERVISED_ENV: &str = "GBOX_TUNNEL_SUPERVISED";

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const TAIL_LINES: usize = 20;

/// Flags never forwarded on a child's command line; their values travel in the environment.
const SECRET_FLAGS: &[&str] = &["--api-key"];

/// Runs a tunnel in the background by re-executing a binary with `--foreground`.
///
/// The child is ready once it has written its registry record; exiting first is a failure
/// reported together with the end of its log.
#[derive(Debug, Clone)]
pub struct Supervisor {
    exe: PathBuf,
    ready_timeout: Duration,
}

impl Supervisor {
    pub fn current_exe() -> anyhow::Result<Self> {
        let exe = std::env::current_exe().context("daemon: locate current executable")?;
        Ok(Self::new(exe, READY_TIMEOUT))
    }

    pub fn new(exe: impl Into<PathBuf>, ready_timeout: Duration) -> Self {
        Self {
            exe: exe.into(),
            ready_timeout,
        }
    }

    pub async fn spawn(
        &self,
        registry: &Registry,
        box_id: &str,
        first_local_port: u16,
        args: Vec<OsString>,
        api_key: Option<&str>,
    ) -> anyhow::Result<SessionRecord> {
        registry.ensure_dir()?;
        let log_path = registry.log_path(box_id, first_local_port);
        let log = fs::File::create(&log_path)
            .with_context(|| format!("daemon: create log {}", log_path.display()))?;
        let log_err = log
            .try_clone()
            .with_context(|| format!("daemon: dup log {}", log_path.display()))?;

        let mut cmd = Command::new(&self.exe);
        cmd.args(scrub_args(args))
            .arg(FOREGROUND_FLAG)
            .env(SUPERVISED_ENV, "1")
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        if let Some(key) = api_key {
            cmd.env(API_KEY_ENV, key);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("daemon: spawn {}", self.exe.display()))?;
        let pid = child.id();
        tracing::debug!(pid, log = %log_path.display(), "daemon: child started");

        let deadline = Instant::now() + self.ready_timeout;
        loop {
            if let Some(status) = child.try_wait().context("daemon: wait for child")? {
                // A crashed child cannot clean up after itself.
                let _ = registry.remove(box_id, first_local_port, pid);
                anyhow::bail!(
                    "tunnel process exited during startup ({status}); log {}:\n{}",
                    log_path.display(),
                    log_tail(&log_path, TAIL_LINES)
                );
            }

            if let Some(rec) = registry
                .find(box_id)?
                .into_iter()
                .find(|r| r.pid == pid)
            {
                return Ok(rec);
            }

            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                let _ = registry.remove(box_id, first_local_port, pid);
                anyhow::bail!(
                    "tunnel process did not become ready within {}; log {}:\n{}",
                    humantime::format_duration(self.ready_timeout),
                    log_path.display(),
                    log_tail(&log_path, TAIL_LINES)
                );
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// `args` without [`SECRET_FLAGS`] and their values, in both `--flag value` and
/// `--flag=value` form. Everything after `--` is kept as is.
pub fn scrub_args(args: impl IntoIterator<Item = OsString>) -> Vec<OsString> {
    let mut out = Vec::new();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        let s = arg.to_string_lossy();
        if s == "--" {
            out.push(arg);
            out.extend(args);
            break;
        }
        if SECRET_FLAGS.iter().any(|f| *f == s) {
            args.next();
            continue;
        }
        let inline = SECRET_FLAGS
            .iter()
            .any(|f| s.strip_prefix(f).is_some_and(|rest| rest.starts_with('=')));
        if !inline {
            out.push(arg);
        }
    }
    out
}

/// Last `n` lines of a log file, or a placeholder if it cannot be read.
pub fn log_tail(path: &Path, n: usize) -> String {
    match fs::read(path) {
        Ok(data) => {
            let text = String::from_utf8_lossy(&data);
            let lines: Vec<&str> = text.lines().collect();
            let start = lines.len().saturating_sub(n);
            let tail = lines[start..].join("\n");
            if tail.trim().is_empty() {
                "(log is empty)".to_string()
            } else {
                tail
            }
        }
        Err(err) => format!("(log unavailable: {err})"),
    }
}
