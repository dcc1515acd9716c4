//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;

/// What teardown (drop) does when the release function fails.
/// Either way the failure is logged and never propagated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeardownPolicy {
    /// Log only.
    Log,
    /// Log, then trip a debug assertion (no-op in release builds).
    #[default]
    Assert,
}

impl FromStr for TeardownPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "log" => Ok(TeardownPolicy::Log),
            "assert" => Ok(TeardownPolicy::Assert),
            other => Err(format!("invalid teardown policy: {other}")),
        }
    }
}

/// Core configuration. File: ~/.config/zhandle/config.toml or /etc/zhandle/config.toml.
/// Env override: ZHANDLE_TEARDOWN.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Teardown failure handling (default "assert").
    #[serde(default)]
    pub teardown: TeardownPolicy,
}

/// Load config: merge default, then config file (if present), then env vars.
/// Called once by the host binding at startup; pass the result to `Releaser::with_config`.
pub fn load() -> Config {
    load_from(&config_paths(), std::env::var("ZHANDLE_TEARDOWN").ok())
}

fn load_from(paths: &[PathBuf], teardown_env: Option<String>) -> Config {
    let mut c = load_file(paths).unwrap_or_default();
    apply_env(&mut c, teardown_env);
    c
}

/// Parse a config file body.
pub fn parse(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(s)
}

fn apply_env(c: &mut Config, teardown: Option<String>) {
    if let Some(s) = teardown {
        match s.parse() {
            Ok(policy) => c.teardown = policy,
            Err(e) => log::warn!("ignoring ZHANDLE_TEARDOWN: {e}"),
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/zhandle/config.toml"));
    }
    out.push(PathBuf::from("/etc/zhandle/config.toml"));
    out
}

fn load_file(paths: &[PathBuf]) -> Option<Config> {
    for p in paths {
        if p.exists() {
            match std::fs::read_to_string(p) {
                Ok(s) => match parse(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => log::warn!("ignoring {}: {e}", p.display()),
                },
                Err(e) => log::warn!("cannot read {}: {e}", p.display()),
            }
            break;
        }
    }
    None
}
