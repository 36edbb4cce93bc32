#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_AUTH_USER_HEADER: &str = "x-user-id";
pub const DEFAULT_MAX_UPLOAD_MB: u64 = 512;
pub const DEFAULT_DATABASE_FILE: &str = "tubeshare.db";

/// Fully resolved settings the backend runs with.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub uploads_root: PathBuf,
    pub database_path: PathBuf,
    pub port: u16,
    pub host: String,
    pub auth_user_header: String,
    pub max_upload_bytes: usize,
}

/// Values supplied on the command line. They win over everything else.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub uploads_root: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub env_path: Option<PathBuf>,
}

/// Resolves the runtime configuration. Precedence is CLI overrides, then the
/// process environment, then the `.env` file, then built-in defaults.
pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    build_runtime_config(&file_vars, env_var_string, overrides)
}

fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeConfig> {
    let uploads_root = overrides
        .uploads_root
        .or_else(|| lookup_value("UPLOADS_ROOT", file_vars, &env_lookup).map(PathBuf::from))
        .ok_or_else(|| anyhow!("UPLOADS_ROOT not set"))?;
    let database_path = overrides
        .database_path
        .or_else(|| lookup_value("DATABASE_PATH", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| uploads_root.join(DEFAULT_DATABASE_FILE));
    let port = overrides
        .port
        .or_else(|| {
            lookup_value("TUBESHARE_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_PORT);
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup_value("TUBESHARE_HOST", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let auth_user_header = lookup_value("AUTH_USER_HEADER", file_vars, &env_lookup)
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_else(|| DEFAULT_AUTH_USER_HEADER.to_string());
    let max_upload_mb = match lookup_value("MAX_UPLOAD_MB", file_vars, &env_lookup) {
        Some(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("MAX_UPLOAD_MB must be a whole number, got {raw:?}"))?,
        None => DEFAULT_MAX_UPLOAD_MB,
    };
    let max_upload_bytes = usize::try_from(max_upload_mb.saturating_mul(1024 * 1024))
        .context("MAX_UPLOAD_MB does not fit in memory on this platform")?;

    Ok(RuntimeConfig {
        uploads_root,
        database_path,
        port,
        host,
        auth_user_header,
        max_upload_bytes,
    })
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

/// Parses a dotenv-style file. A missing file is not an error.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
