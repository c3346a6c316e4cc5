use std::{path::Path, time::Duration};
#[cfg(unix)]
use std::process::Command;

use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, Signal, System};

/// Subcommands that run a tunnel engine in the foreground.
pub const TUNNEL_SUBCOMMANDS: &[&str] = &["start", "port-forward"];

pub const FOREGROUND_FLAG: &str = "--foreground";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub command: Option<String>,
}

/// The OS process view the session registry reconciles against.
pub trait ProcessTable: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;

    /// Running processes whose command line looks like a foreground tunnel of this tool.
    fn tunnel_processes(&self) -> Vec<ProcessInfo>;

    /// SIGTERM, then SIGKILL if the process is still there shortly after.
    fn terminate(&self, pid: u32) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct SystemProcesses {
    exe_name: String,
    self_pid: u32,
}

impl SystemProcesses {
    pub fn new() -> Self {
        let exe_name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());
        Self {
            exe_name,
            self_pid: std::process::id(),
        }
    }

    fn snapshot() -> System {
        System::new_with_specifics(
            RefreshKind::new().with_processes(ProcessRefreshKind::everything()),
        )
    }
}

impl Default for SystemProcesses {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SystemProcesses {
    fn is_alive(&self, pid: u32) -> bool {
        let mut sys = System::new();
        let pid = Pid::from_u32(pid);
        sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        sys.process(pid).is_some()
    }

    fn tunnel_processes(&self) -> Vec<ProcessInfo> {
        let sys = Self::snapshot();
        let mut out = Vec::new();
        for (pid, p) in sys.processes() {
            let pid = pid.as_u32();
            if pid == self.self_pid {
                continue;
            }
            let args: Vec<String> = p
                .cmd()
                .iter()
                .map(|a| a.to_string_lossy().into_owned())
                .collect();
            if !is_tunnel_command(&self.exe_name, &args) {
                continue;
            }
            out.push(ProcessInfo {
                pid,
                name: p.name().to_string_lossy().into_owned(),
                command: Some(args.join(" ")),
            });
        }
        out.sort_by_key(|p| p.pid);
        out
    }

    fn terminate(&self, pid: u32) -> anyhow::Result<()> {
        let mut sys = Self::snapshot();
        let spid = Pid::from_u32(pid);

        let Some(p) = sys.process(spid) else {
            tracing::debug!(pid, "process: already gone");
            return Ok(());
        };
        if p.kill_with(Signal::Term) != Some(true) {
            p.kill();
        }

        // Give it a moment to release its ports and remove its own record.
        for _ in 0..20 {
            std::thread::sleep(Duration::from_millis(100));
            sys.refresh_processes(ProcessesToUpdate::Some(&[spid]), true);
            if sys.process(spid).is_none() {
                return Ok(());
            }
        }

        tracing::warn!(pid, "process: did not exit after SIGTERM; sending SIGKILL");
        if let Some(p) = sys.process(spid) {
            if !p.kill() {
                anyhow::bail!("process: failed to kill pid {pid}");
            }
        }
        Ok(())
    }
}

/// `<exe> [global flags] <start|port-forward> ... --foreground ...`
pub fn is_tunnel_command(exe_name: &str, args: &[String]) -> bool {
    let Some(arg0) = args.first() else {
        return false;
    };
    let stem = Path::new(arg0)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    if stem != exe_name {
        return false;
    }
    let rest = &args[1..];
    rest.iter().any(|a| a == FOREGROUND_FLAG)
        && rest.iter().any(|a| TUNNEL_SUBCOMMANDS.contains(&a.as_str()))
}

/// Best-effort lookup of whoever is listening on a local TCP port.
pub fn find_process_on_port(port: u16) -> Option<ProcessInfo> {
    #[cfg(target_os = "linux")]
    {
        find_with_ss(port).or_else(|| find_with_lsof(port))
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    {
        find_with_lsof(port)
    }

    #[cfg(not(unix))]
    {
        let _ = port;
        None
    }
}

#[cfg(unix)]
fn find_with_lsof(port: u16) -> Option<ProcessInfo> {
    let output = Command::new("lsof")
        .args(["-nP", &format!("-iTCP:{port}"), "-sTCP:LISTEN"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_lsof(&stdout).map(|(name, pid)| ProcessInfo {
        pid,
        name,
        command: process_command(pid),
    })
}

#[cfg(target_os = "linux")]
fn find_with_ss(port: u16) -> Option<ProcessInfo> {
    let output = Command::new("ss")
        .args(["-Htlnp", &format!("sport = :{port}")])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_ss(&stdout).map(|(name, pid)| ProcessInfo {
        pid,
        name,
        command: process_command(pid),
    })
}

#[cfg(unix)]
fn process_command(pid: u32) -> Option<String> {
    let out = Command::new("ps")
        .args(["-p", &pid.to_string(), "-o", "args="])
        .output()
        .ok()?;
    if !out.status.success() {
        return None;
    }
    let cmd = String::from_utf8_lossy(&out.stdout).trim().to_string();
    (!cmd.is_empty()).then_some(cmd)
}

/// `COMMAND PID USER FD TYPE DEVICE SIZE/OFF NODE NAME`; first data row wins.
fn parse_lsof(out: &str) -> Option<(String, u32)> {
    for line in out.lines().skip(1) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 2 {
            if let Ok(pid) = parts[1].parse::<u32>() {
                return Some((parts[0].to_string(), pid));
            }
        }
    }
    None
}

/// Extracts `users:(("name",pid=1234,fd=5))`.
fn parse_ss(out: &str) -> Option<(String, u32)> {
    for line in out.lines() {
        let Some(start) = line.find("users:((\"") else {
            continue;
        };
        let rest = &line[start + "users:((\"".len()..];
        let name_end = rest.find('"')?;
        let name = rest[..name_end].to_string();
        let pid_start = rest.find("pid=")? + 4;
        let pid_rest = &rest[pid_start..];
        let pid_end = pid_rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(pid_rest.len());
        let pid = pid_rest[..pid_end].parse().ok()?;
        return Some((name, pid));
    }
    None
}
