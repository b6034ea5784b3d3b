// Copyright 2016 Google Inc. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::RegistryError;

/// Tuning knobs for discovery polling, connect retry, and request timeouts.
///
/// Defaults mirror the constants observed in the original implementation
/// (500ms poll interval, 20 connect retries, a 4-interval startup grace
/// period) so behavior under default configuration matches what plugin
/// authors have already tuned their processes against. The `execute_timeout`
/// field has no analogue in the original: it's a deliberate addition (see
/// design notes) since `Execute` shares a plugin's single client connection
/// with nothing else, but a wedged or slow plugin must not be allowed to
/// block the host indefinitely.
///
/// Layering follows the same convention as this workspace's reference
/// gateway process: compiled-in [`Default`], optionally overridden by a
/// TOML file ([`RegistryConfig::load`]), then by environment variables
/// ([`RegistryConfig::apply_env_overrides`]), then by whatever the caller
/// sets directly on the struct afterward.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How often the polling discovery backend rescans its directory.
    pub poll_interval: Duration,
    /// How many times to retry connecting to a freshly spawned plugin's
    /// socket before giving up.
    pub connect_retry_count: u32,
    /// Delay between connect retries.
    pub connect_retry_interval: Duration,
    /// Grace period after spawning a plugin process before the first connect
    /// attempt, given as a multiple of `connect_retry_interval`.
    pub startup_grace_multiplier: u32,
    /// Debounce window for the event-driven discovery backend: filesystem
    /// events for the same path within this window are coalesced.
    pub debounce_interval: Duration,
    /// Upper bound on a single `Execute` call, including any reconnect/reload
    /// recovery attempts it triggers. `None` disables the timeout.
    pub execute_timeout: Option<Duration>,
}

impl RegistryConfig {
    pub fn startup_grace_period(&self) -> Duration {
        self.connect_retry_interval * self.startup_grace_multiplier
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            poll_interval: Duration::from_millis(500),
            connect_retry_count: 20,
            connect_retry_interval: Duration::from_millis(500),
            startup_grace_multiplier: 4,
            debounce_interval: Duration::from_millis(100),
            execute_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl RegistryConfig {
    /// Reads `path` as a TOML file, layers it over [`RegistryConfig::default`],
    /// then applies [`RegistryConfig::apply_env_overrides`] on top. Unknown
    /// TOML keys are rejected (a typo'd tunable should fail loudly rather than
    /// silently doing nothing); missing keys fall back to their default.
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let content = std::fs::read_to_string(path)?;
        let file: RegistryConfigFile =
            toml::from_str(&content).map_err(|e| RegistryError::ConfigError(e.to_string()))?;
        let mut config = RegistryConfig::from(file);
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Overrides whichever fields have a matching `PLUGINREG_*` environment
    /// variable set, leaving the rest untouched. Called automatically by
    /// [`RegistryConfig::load`]; callers that build a `RegistryConfig` purely
    /// from [`Default`] can call this directly to still pick up env overrides
    /// without requiring a TOML file to exist.
    pub fn apply_env_overrides(&mut self) -> Result<(), RegistryError> {
        if let Some(ms) = env_u64("PLUGINREG_POLL_INTERVAL_MS")? {
            self.poll_interval = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64("PLUGINREG_CONNECT_RETRY_COUNT")? {
            self.connect_retry_count = n as u32;
        }
        if let Some(ms) = env_u64("PLUGINREG_CONNECT_RETRY_INTERVAL_MS")? {
            self.connect_retry_interval = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64("PLUGINREG_STARTUP_GRACE_MULTIPLIER")? {
            self.startup_grace_multiplier = n as u32;
        }
        if let Some(ms) = env_u64("PLUGINREG_DEBOUNCE_INTERVAL_MS")? {
            self.debounce_interval = Duration::from_millis(ms);
        }
        if let Ok(raw) = std::env::var("PLUGINREG_EXECUTE_TIMEOUT_SECS") {
            self.execute_timeout = if raw.eq_ignore_ascii_case("none") || raw.is_empty() {
                None
            } else {
                let secs: u64 = raw
                    .parse()
                    .map_err(|_| RegistryError::ConfigError(format!("invalid PLUGINREG_EXECUTE_TIMEOUT_SECS: {raw}")))?;
                Some(Duration::from_secs(secs))
            };
        }
        Ok(())
    }
}

fn env_u64(var: &str) -> Result<Option<u64>, RegistryError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|_| RegistryError::ConfigError(format!("invalid {var}: {raw}"))),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(RegistryError::ConfigError(format!("{var}: {e}"))),
    }
}

/// The TOML-facing shape of [`RegistryConfig`]: plain integers/millisecond
/// counts rather than `Duration`, matching how the gateway process's own
/// config file represents durations, and with every field optional so a
/// file only needs to name the tunables it actually overrides.
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RegistryConfigFile {
    poll_interval_ms: u64,
    connect_retry_count: u32,
    connect_retry_interval_ms: u64,
    startup_grace_multiplier: u32,
    debounce_interval_ms: u64,
    execute_timeout_secs: Option<u64>,
}

impl Default for RegistryConfigFile {
    fn default() -> Self {
        let d = RegistryConfig::default();
        RegistryConfigFile {
            poll_interval_ms: d.poll_interval.as_millis() as u64,
            connect_retry_count: d.connect_retry_count,
            connect_retry_interval_ms: d.connect_retry_interval.as_millis() as u64,
            startup_grace_multiplier: d.startup_grace_multiplier,
            debounce_interval_ms: d.debounce_interval.as_millis() as u64,
            execute_timeout_secs: d.execute_timeout.map(|t| t.as_secs()),
        }
    }
}

impl From<RegistryConfigFile> for RegistryConfig {
    fn from(f: RegistryConfigFile) -> Self {
        RegistryConfig {
            poll_interval: Duration::from_millis(f.poll_interval_ms),
            connect_retry_count: f.connect_retry_count,
            connect_retry_interval: Duration::from_millis(f.connect_retry_interval_ms),
            startup_grace_multiplier: f.startup_grace_multiplier,
            debounce_interval: Duration::from_millis(f.debounce_interval_ms),
            execute_timeout: f.execute_timeout_secs.map(Duration::from_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_layers_toml_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pluginreg.toml");
        std::fs::write(&path, "poll_interval_ms = 250\nconnect_retry_count = 5\n").unwrap();

        let config = RegistryConfig::load(&path).unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.connect_retry_count, 5);
        // Untouched by the file, still the compiled-in default.
        assert_eq!(config.startup_grace_multiplier, 4);
    }

    #[test]
    fn env_override_beats_both_default_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pluginreg.toml");
        std::fs::write(&path, "poll_interval_ms = 250\n").unwrap();

        // SAFETY-equivalent: tests in this module run single-threaded enough
        // for this to be deterministic (no other test in this file touches
        // this variable), matching the pattern used by other env-override
        // tests in this workspace's reference gateway crate.
        std::env::set_var("PLUGINREG_POLL_INTERVAL_MS", "999");
        let config = RegistryConfig::load(&path);
        std::env::remove_var("PLUGINREG_POLL_INTERVAL_MS");

        assert_eq!(config.unwrap().poll_interval, Duration::from_millis(999));
    }

    #[test]
    fn rejects_unknown_toml_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pluginreg.toml");
        std::fs::write(&path, "not_a_real_field = 1\n").unwrap();
        assert!(RegistryConfig::load(&path).is_err());
    }

    #[test]
    fn rejects_malformed_env_value() {
        let mut config = RegistryConfig::default();
        std::env::set_var("PLUGINREG_CONNECT_RETRY_COUNT", "not-a-number");
        let result = config.apply_env_overrides();
        std::env::remove_var("PLUGINREG_CONNECT_RETRY_COUNT");
        assert!(result.is_err());
    }
}
