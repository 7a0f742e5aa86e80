//! Load core config from file and environment.

use std::path::{Path, PathBuf};

use ssc_core::CoreConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value {value:?} for {var}")]
    Env { var: &'static str, value: String },
}

/// File: ~/.config/ssc/config.toml or /etc/ssc/config.toml (first that exists).
/// Env overrides: SSC_POST_EXPIRY_INTERVAL_MS, SSC_SHUTDOWN_GRACE_MS, SSC_MAX_DATAGRAM_SIZE.
pub fn load() -> Result<CoreConfig, ConfigError> {
    load_from(&config_paths(), |var| std::env::var(var).ok())
}

fn load_from(paths: &[PathBuf], env: impl Fn(&str) -> Option<String>) -> Result<CoreConfig, ConfigError> {
    let mut c = match paths.iter().find(|p| p.exists()) {
        Some(path) => load_file(path)?,
        None => CoreConfig::default(),
    };
    if let Some(v) = override_var(&env, "SSC_POST_EXPIRY_INTERVAL_MS")? {
        c.post_expiry_interval_ms = v;
    }
    if let Some(v) = override_var(&env, "SSC_SHUTDOWN_GRACE_MS")? {
        c.shutdown_grace_ms = v;
    }
    if let Some(v) = override_var(&env, "SSC_MAX_DATAGRAM_SIZE")? {
        c.max_datagram_size = v;
    }
    Ok(c)
}

fn override_var<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match env(var) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Env { var, value }),
        None => Ok(None),
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/ssc/config.toml"));
    }
    out.push(PathBuf::from("/etc/ssc/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<CoreConfig, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
