//! Bootstrap helpers for personactl.
//!
//! Everything personactl keeps on disk lives under `~/.personactl/`:
//! `.env`, `settings.json`, `config.toml`, and the generation marker.

use std::path::{Path, PathBuf};

/// Base directory: `~/.personactl`.
pub fn personactl_base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".personactl")
}

/// Path to the personactl-specific `.env` file: `~/.personactl/.env`.
pub fn personactl_env_path() -> PathBuf {
    personactl_base_dir().join(".env")
}

/// Load `./.env`, then `~/.personactl/.env`.
///
/// dotenvy never overwrites existing env vars, so the effective priority is:
///
///   explicit env vars > `./.env` > `~/.personactl/.env`
pub fn load_personactl_env() {
    let _ = dotenvy::dotenv();
    load_env_file(&personactl_env_path());
}

/// Load one dotenv file if it exists. Returns whether anything was loaded.
pub fn load_env_file(path: &Path) -> bool {
    if !path.exists() {
        return false;
    }
    match dotenvy::from_path(path) {
        Ok(()) => true,
        Err(e) => {
            eprintln!("Warning: failed to load {}: {}", path.display(), e);
            false
        }
    }
}
