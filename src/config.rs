//! Configuration management for gputel
//!
//! Backends are configured through a flat string mapping ([`BackendVars`]) that is
//! handed to every startup function. The mapping is usually produced from the
//! `[devices]` table of `config.toml`, with command-line overrides layered on top.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Resolved configuration mapping passed to backend startup functions
pub type BackendVars = HashMap<String, String>;

/// Default refresh interval for a backend sampler
pub const DEFAULT_REFRESH: Duration = Duration::from_secs(1);

/// gputel configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General options
    #[serde(default)]
    pub general: GeneralConfig,
    /// Backend options, stringified into [`BackendVars`]
    #[serde(default)]
    pub devices: BTreeMap<String, toml::Value>,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// How often consumers pull merged results, in milliseconds
    #[serde(default = "default_update_interval")]
    pub update_interval_ms: u32,
}

fn default_update_interval() -> u32 {
    1000 // 1 second
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: default_update_interval(),
        }
    }
}

impl Config {
    /// Get the default configuration directory
    ///
    /// Returns `~/.config/gputel` on Unix-like systems,
    /// or `%APPDATA%\gputel` on Windows.
    pub fn default_path() -> PathBuf {
        let config_dir = if cfg!(windows) {
            std::env::var("APPDATA")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("."))
        } else {
            std::env::var("HOME")
                .map(|home| PathBuf::from(home).join(".config"))
                .unwrap_or_else(|_| PathBuf::from(".config"))
        };

        config_dir.join("gputel")
    }

    /// Load configuration from the default path, falling back to defaults if absent
    pub fn load() -> Result<Self> {
        let config_file = Self::default_path().join("config.toml");
        if !config_file.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&config_file)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_toml(&contents)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Override a single backend option
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.devices
            .insert(key.into(), toml::Value::String(value.into()));
    }

    /// Consumer update interval
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(u64::from(self.general.update_interval_ms.max(1)))
    }

    /// Flatten the `[devices]` table into the mapping handed to startup functions
    pub fn vars(&self) -> BackendVars {
        let mut vars = BackendVars::new();
        for (key, value) in &self.devices {
            let text = match value {
                toml::Value::String(s) => s.clone(),
                toml::Value::Boolean(b) => b.to_string(),
                toml::Value::Integer(i) => i.to_string(),
                toml::Value::Float(f) => f.to_string(),
                toml::Value::Datetime(d) => d.to_string(),
                toml::Value::Array(_) | toml::Value::Table(_) => {
                    log::warn!("ignoring non-scalar device option '{}'", key);
                    continue;
                }
            };
            vars.insert(key.clone(), text);
        }
        vars
    }
}

/// How a backend was asked to behave
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enablement {
    /// Explicitly force-enabled: failures are fatal to startup
    Forced,
    /// Explicitly disabled
    Disabled,
    /// Not mentioned: enable if hardware is detected
    Auto,
}

impl Enablement {
    /// Resolve from any of the given keys. `"true"` on any key wins over `"false"`.
    pub fn from_vars(vars: &BackendVars, keys: &[&str]) -> Self {
        let value_is = |want: &str| {
            keys.iter().any(|k| {
                vars.get(*k)
                    .map(|v| v.trim().eq_ignore_ascii_case(want))
                    .unwrap_or(false)
            })
        };
        if value_is("true") {
            Enablement::Forced
        } else if value_is("false") {
            Enablement::Disabled
        } else {
            Enablement::Auto
        }
    }

    pub fn is_forced(self) -> bool {
        self == Enablement::Forced
    }
}

/// Read `key` as a refresh interval, defaulting to one second
pub fn refresh_interval(vars: &BackendVars, key: &str) -> Result<Duration> {
    match vars.get(key) {
        Some(value) => parse_duration(value)
            .map_err(|e| Error::Config(format!("{}: {}", key, e))),
        None => Ok(DEFAULT_REFRESH),
    }
}

/// Parse a duration such as `"2s"`, `"500ms"`, `"1m30s"` or `"1.5s"`.
///
/// The result must be strictly positive.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let invalid = || Error::InvalidDuration(format!("'{}'", input));
    let s = input.trim();
    if s.is_empty() {
        return Err(invalid());
    }
    if s.starts_with('-') {
        return Err(Error::InvalidDuration(format!("'{}' must be positive", input)));
    }
    let s = s.strip_prefix('+').unwrap_or(s);
    if s == "0" {
        return Err(Error::InvalidDuration(format!("'{}' must be positive", input)));
    }

    let mut total_nanos = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let number = &rest[..num_len];
        if number.is_empty() || number == "." || number.matches('.').count() > 1 {
            return Err(invalid());
        }
        let value: f64 = number.parse().map_err(|_| invalid())?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "" => return Err(Error::InvalidDuration(format!("'{}' is missing a unit", input))),
            unit => {
                return Err(Error::InvalidDuration(format!(
                    "unknown unit '{}' in '{}'",
                    unit, input
                )))
            }
        };
        rest = &rest[unit_len..];
        total_nanos += value * scale;
    }

    if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
        return Err(invalid());
    }
    let nanos = total_nanos.round() as u64;
    if nanos == 0 {
        return Err(Error::InvalidDuration(format!("'{}' must be positive", input)));
    }
    Ok(Duration::from_nanos(nanos))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BackendVars {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("250us").unwrap(), Duration::from_micros(250));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_duration_rejects_bad_input() {
        for bad in ["", "0", "0s", "-1s", "5", "5x", "s", "1..5s", "."] {
            assert!(parse_duration(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_enablement() {
        assert_eq!(
            Enablement::from_vars(&vars(&[("amd", "true")]), &["amd", "amdgpu"]),
            Enablement::Forced
        );
        assert_eq!(
            Enablement::from_vars(&vars(&[("amdgpu", "false")]), &["amd", "amdgpu"]),
            Enablement::Disabled
        );
        assert_eq!(
            Enablement::from_vars(&vars(&[("amd", "false"), ("amdgpu", "true")]), &["amd", "amdgpu"]),
            Enablement::Forced
        );
        assert_eq!(
            Enablement::from_vars(&vars(&[("other", "true")]), &["amd"]),
            Enablement::Auto
        );
    }

    #[test]
    fn test_refresh_interval_default_and_override() {
        assert_eq!(refresh_interval(&vars(&[]), "amd-refresh").unwrap(), DEFAULT_REFRESH);
        assert_eq!(
            refresh_interval(&vars(&[("amd-refresh", "250ms")]), "amd-refresh").unwrap(),
            Duration::from_millis(250)
        );
        let err = refresh_interval(&vars(&[("amd-refresh", "soon")]), "amd-refresh").unwrap_err();
        assert!(err.to_string().contains("amd-refresh"));
    }

    #[test]
    fn test_config_vars_stringify_scalars() {
        let config = Config::from_toml(
            r#"
            [general]
            update_interval_ms = 500

            [devices]
            amd = true
            amd-refresh = "2s"
            nvidia = false
            level = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.update_interval(), Duration::from_millis(500));
        let vars = config.vars();
        assert_eq!(vars.get("amd").map(String::as_str), Some("true"));
        assert_eq!(vars.get("amd-refresh").map(String::as_str), Some("2s"));
        assert_eq!(vars.get("nvidia").map(String::as_str), Some("false"));
        assert_eq!(vars.get("level").map(String::as_str), Some("3"));
    }

    #[test]
    fn test_default_config_and_override() {
        let mut config = Config::default();
        assert_eq!(config.general.update_interval_ms, 1000);
        assert!(config.vars().is_empty());
        config.set("apple", "true");
        assert_eq!(config.vars().get("apple").map(String::as_str), Some("true"));
    }

    #[test]
    fn test_malformed_config_is_error() {
        assert!(matches!(
            Config::from_toml("[general\nupdate_interval_ms = "),
            Err(Error::Config(_))
        ));
    }
}
