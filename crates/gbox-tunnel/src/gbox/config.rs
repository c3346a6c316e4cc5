use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

use crate::gbox::{
    runtime_paths,
    tunnel::{multiplexer::MuxOptions, session::SessionOptions},
};

pub const CONFIG_ENV: &str = "GBOX_TUNNEL_CONFIG";
pub const API_KEY_ENV: &str = "GBOX_API_KEY";
pub const DEFAULT_BASE_URL: &str = "https://gbox.ai";

const CANDIDATES: [&str; 3] = ["gbox-tunnel.toml", "gbox-tunnel.yaml", "gbox-tunnel.yml"];

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

/// Flag, then `GBOX_TUNNEL_CONFIG`, then `./gbox-tunnel.{toml,yaml,yml}`, then the per-user
/// config dir. `None` when nothing was named and no default file exists.
pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<Option<ResolvedConfigPath>> {
    if let Some(p) = explicit_flag_path {
        return Ok(Some(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        }));
    }

    // clap already folds the env var into the flag; this covers callers that bypass clap.
    if let Some(p) = std::env::var_os(CONFIG_ENV) {
        if !p.is_empty() {
            return Ok(Some(ResolvedConfigPath {
                path: normalize_explicit_path(Path::new(&p))?,
                source: ConfigPathSource::Env,
            }));
        }
    }

    if let Some(p) = discover_config_path(Path::new(".")) {
        return Ok(Some(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        }));
    }

    Ok(default_config_dir()
        .and_then(|d| discover_config_path(&d))
        .map(|path| ResolvedConfigPath {
            path,
            source: ConfigPathSource::Default,
        }))
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }
    if p.is_dir() {
        return Ok(discover_config_path(p).unwrap_or_else(|| p.join(CANDIDATES[0])));
    }
    Ok(p.to_path_buf())
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    CANDIDATES
        .iter()
        .map(|c| dir.join(c))
        .find(|p| fs::metadata(p).map(|m| m.is_file()).unwrap_or(false))
}

fn default_config_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "gbox", "gbox-tunnel").map(|p| p.config_dir().to_path_buf())
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api: ApiConfig,
    pub logging: LoggingConfig,
    pub tunnel: TunnelTimings,
    pub registry_dir: PathBuf,
}

#[derive(Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub api_key: String,
}

impl std::fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &if self.api_key.is_empty() { "" } else { "<redacted>" })
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct TunnelTimings {
    pub ack_timeout: Duration,
    pub retry_interval: Duration,
    pub connect_attempts: u32,
    pub connect_retry_delay: Duration,
    pub dial_timeout: Duration,
    pub request_timeout: Duration,
}

impl TunnelTimings {
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            connect_attempts: self.connect_attempts,
            connect_retry_delay: self.connect_retry_delay,
            retry_interval: self.retry_interval,
            dial_timeout: self.dial_timeout,
            mux: MuxOptions {
                ack_timeout: self.ack_timeout,
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    api: Option<FileApi>,
    logging: Option<FileLogging>,
    tunnel: Option<FileTunnel>,
    registry: Option<FileRegistry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileApi {
    base_url: Option<String>,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTunnel {
    ack_timeout_ms: Option<i64>,
    retry_interval_ms: Option<i64>,
    connect_attempts: Option<i64>,
    connect_retry_delay_ms: Option<i64>,
    dial_timeout_ms: Option<i64>,
    request_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileRegistry {
    dir: Option<PathBuf>,
}

/// Loads `path` if given, otherwise returns the defaults.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let Some(path) = path else {
        return Config::from_file_config(FileConfig::default(), None);
    };

    let data = match fs::read(path) {
        Ok(d) => d,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "config: file not found; using defaults");
            return Config::from_file_config(FileConfig::default(), path.parent());
        }
        Err(err) => return Err(err).with_context(|| format!("config: read {}", path.display())),
    };
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            ext
        ),
    };

    Config::from_file_config(fc, path.parent())
}

fn millis(v: Option<i64>, default_ms: u64) -> Duration {
    match v {
        Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
        _ => Duration::from_millis(default_ms),
    }
}

fn non_empty(v: Option<String>, default: &str) -> String {
    match v.map(|s| s.trim().to_string()) {
        Some(s) if !s.is_empty() => s,
        _ => default.to_string(),
    }
}

impl Config {
    fn from_file_config(fc: FileConfig, config_dir: Option<&Path>) -> anyhow::Result<Config> {
        let api = fc.api.unwrap_or(FileApi {
            base_url: None,
            api_key: None,
        });
        let logging = fc.logging.map_or_else(
            || LoggingConfig {
                level: "info".into(),
                format: "text".into(),
                output: "stderr".into(),
                add_source: false,
            },
            |l| LoggingConfig {
                level: non_empty(l.level, "info").to_ascii_lowercase(),
                format: non_empty(l.format, "text").to_ascii_lowercase(),
                output: non_empty(l.output, "stderr"),
                add_source: l.add_source,
            },
        );
        if !matches!(logging.format.as_str(), "text" | "json") {
            anyhow::bail!(
                "config: logging.format must be text or json, got {:?}",
                logging.format
            );
        }

        let t = fc.tunnel;
        let t = t.as_ref();
        let tunnel = TunnelTimings {
            ack_timeout: millis(t.and_then(|t| t.ack_timeout_ms), 10_000),
            retry_interval: millis(t.and_then(|t| t.retry_interval_ms), 3_000),
            connect_attempts: t
                .and_then(|t| t.connect_attempts)
                .filter(|n| *n > 0)
                .map(|n| n.min(u32::MAX as i64) as u32)
                .unwrap_or(3),
            connect_retry_delay: millis(t.and_then(|t| t.connect_retry_delay_ms), 2_000),
            dial_timeout: millis(t.and_then(|t| t.dial_timeout_ms), 10_000),
            request_timeout: millis(t.and_then(|t| t.request_timeout_ms), 15_000),
        };

        let registry_dir = runtime_paths::resolve_registry_dir(
            config_dir.unwrap_or_else(|| Path::new(".")),
            fc.registry.and_then(|r| r.dir),
        )?;

        Ok(Config {
            api: ApiConfig {
                base_url: non_empty(api.base_url, DEFAULT_BASE_URL),
                api_key: api.api_key.map(|k| k.trim().to_string()).unwrap_or_default(),
            },
            logging,
            tunnel,
            registry_dir,
        })
    }

    /// Command-line and environment values win over the file.
    pub fn apply_overrides(&mut self, base_url: Option<String>, api_key: Option<String>) {
        if let Some(u) = base_url.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()) {
            self.api.base_url = u;
        }
        if let Some(k) = api_key.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()) {
            self.api.api_key = k;
        }
    }
}
