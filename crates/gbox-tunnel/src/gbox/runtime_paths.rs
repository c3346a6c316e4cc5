use std::path::{Component, Path, PathBuf};

use directories::ProjectDirs;

/// Where session records and their logs live. A relative `configured` path is taken
/// relative to the config file's directory.
pub fn resolve_registry_dir(config_dir: &Path, configured: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let mut p = match configured {
        Some(p) => {
            if p.as_os_str().is_empty() {
                anyhow::bail!("registry dir: empty path");
            }
            if p.is_relative() {
                config_dir.join(p)
            } else {
                p
            }
        }
        None => default_registry_dir(),
    };

    p = normalize_path(p);
    if p.as_os_str().is_empty() {
        anyhow::bail!("registry dir: empty path");
    }
    Ok(p)
}

fn default_registry_dir() -> PathBuf {
    match ProjectDirs::from("com", "gbox", "gbox-tunnel") {
        Some(proj) => proj.cache_dir().join("tunnels"),
        // No home directory (e.g. a bare service account): fall back to the temp dir.
        None => std::env::temp_dir().join("gbox-tunnel").join("tunnels"),
    }
}

fn normalize_path(p: PathBuf) -> PathBuf {
    // Component-level cleanup only; `..` is kept as written.
    let mut out = PathBuf::new();
    for c in p.components() {
        if matches!(c, Component::CurDir) {
            continue;
        }
        out.push(c.as_os_str());
    }
    out
}
