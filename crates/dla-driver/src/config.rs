//! Runtime configuration
//!
//! A [`DeviceConfig`] is fixed when the [`crate::Device`] is opened and
//! applies uniformly to every instance. Defaults suit production hardware;
//! [`DeviceConfig::from_env`] overlays the environment switches field
//! engineers already use.

use std::fmt;
use std::time::Duration;
use tracing::warn;

/// Disable the architecture-hash check (`1` to disable).
pub const ENV_DISABLE_ARCH_CHECK: &str = "DLA_DISABLE_ARCH_CHECK";
/// Disable the build-version check (`1` to disable).
pub const ENV_DISABLE_VERSION_CHECK: &str = "DLA_DISABLE_VERSION_CHECK";
/// Run the external-memory self test at device open (any value).
pub const ENV_MEMORY_TEST: &str = "COREDLA_RUNTIME_MEMORY_TEST";
/// Use polling instead of interrupts (`1` to enable).
pub const ENV_POLLING: &str = "DLA_RUNTIME_POLLING";
/// Completion wait timeout in whole seconds.
pub const ENV_WAIT_TIMEOUT_SECS: &str = "DLA_WAIT_TIMEOUT_SECS";

/// Largest timeout accepted from [`ENV_WAIT_TIMEOUT_SECS`] (one year)
pub const MAX_WAIT_TIMEOUT_SECS: u64 = 365 * 24 * 60 * 60;

/// How job completion reaches the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// Hardware interrupt updates the completion tracker
    #[default]
    Interrupt,
    /// The waiting thread reads the completion counter itself
    Polling,
}

impl fmt::Display for CompletionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => write!(f, "interrupt"),
            Self::Polling => write!(f, "polling"),
        }
    }
}

/// Device-wide runtime configuration
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Upper bound on one [`crate::Device::wait_for_dla`] call
    pub wait_timeout: Duration,

    /// Interrupt or polling completion
    pub completion_mode: CompletionMode,

    /// Sleep between completion-counter reads in polling mode
    pub poll_interval: Duration,

    /// Accept graphs whose architecture hash differs from the hardware's
    pub skip_arch_check: bool,

    /// Accept graphs whose build version differs from the hardware's
    pub skip_version_check: bool,

    /// Run [`crate::Device::run_memory_test`] while opening
    pub memory_test: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(1000),
            completion_mode: CompletionMode::Interrupt,
            poll_interval: Duration::from_micros(100),
            skip_arch_check: false,
            skip_version_check: false,
            memory_test: false,
        }
    }
}

impl DeviceConfig {
    /// Defaults overlaid with the process environment
    pub fn from_env() -> Self {
        Self::default().with_env_lookup(|key| std::env::var(key).ok())
    }

    /// Overlay values produced by `lookup` (environment-style key/value source)
    #[must_use]
    pub fn with_env_lookup(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str| lookup(key).is_some_and(|v| v.trim() == "1");

        if flag(ENV_DISABLE_ARCH_CHECK) {
            self.skip_arch_check = true;
        }
        if flag(ENV_DISABLE_VERSION_CHECK) {
            self.skip_version_check = true;
        }
        if flag(ENV_POLLING) {
            self.completion_mode = CompletionMode::Polling;
        }
        if lookup(ENV_MEMORY_TEST).is_some() {
            self.memory_test = true;
        }
        if let Some(raw) = lookup(ENV_WAIT_TIMEOUT_SECS) {
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs > MAX_WAIT_TIMEOUT_SECS => {
                    warn!("Clamping {ENV_WAIT_TIMEOUT_SECS}={secs} to {MAX_WAIT_TIMEOUT_SECS}");
                    self.wait_timeout = Duration::from_secs(MAX_WAIT_TIMEOUT_SECS);
                }
                Ok(secs) if secs > 0 => self.wait_timeout = Duration::from_secs(secs),
                _ => warn!("Ignoring {ENV_WAIT_TIMEOUT_SECS}={raw:?}: expected a positive integer"),
            }
        }
        self
    }

    /// Set the completion wait timeout
    #[must_use]
    pub const fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Set the completion mode
    #[must_use]
    pub const fn with_completion_mode(mut self, mode: CompletionMode) -> Self {
        self.completion_mode = mode;
        self
    }

    /// Set the polling interval
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Skip the architecture-hash check
    #[must_use]
    pub const fn with_skip_arch_check(mut self, skip: bool) -> Self {
        self.skip_arch_check = skip;
        self
    }

    /// Skip the build-version check
    #[must_use]
    pub const fn with_skip_version_check(mut self, skip: bool) -> Self {
        self.skip_version_check = skip;
        self
    }

    /// Run the memory self test while opening
    #[must_use]
    pub const fn with_memory_test(mut self, enabled: bool) -> Self {
        self.memory_test = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = DeviceConfig::default();
        assert_eq!(cfg.completion_mode, CompletionMode::Interrupt);
        assert_eq!(cfg.wait_timeout, Duration::from_secs(1000));
        assert!(!cfg.skip_arch_check);
        assert!(!cfg.memory_test);
    }

    #[test]
    fn test_env_overrides() {
        let cfg = DeviceConfig::default().with_env_lookup(lookup(&[
            (ENV_DISABLE_ARCH_CHECK, "1"),
            (ENV_POLLING, "1"),
            (ENV_MEMORY_TEST, ""),
            (ENV_WAIT_TIMEOUT_SECS, "30"),
        ]));
        assert!(cfg.skip_arch_check);
        assert!(!cfg.skip_version_check);
        assert_eq!(cfg.completion_mode, CompletionMode::Polling);
        assert!(cfg.memory_test);
        assert_eq!(cfg.wait_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_env_flag_requires_one() {
        let cfg = DeviceConfig::default().with_env_lookup(lookup(&[
            (ENV_DISABLE_VERSION_CHECK, "yes"),
            (ENV_WAIT_TIMEOUT_SECS, "soon"),
        ]));
        assert!(!cfg.skip_version_check);
        assert_eq!(cfg.wait_timeout, Duration::from_secs(1000));
    }

    #[test]
    fn test_env_timeout_is_clamped() {
        let max = u64::MAX.to_string();
        let cfg = DeviceConfig::default().with_env_lookup(lookup(&[(ENV_WAIT_TIMEOUT_SECS, &max)]));
        assert_eq!(cfg.wait_timeout, Duration::from_secs(MAX_WAIT_TIMEOUT_SECS));

        let cfg = DeviceConfig::default().with_env_lookup(lookup(&[(ENV_WAIT_TIMEOUT_SECS, "0")]));
        assert_eq!(cfg.wait_timeout, Duration::from_secs(1000));
    }

    #[test]
    fn test_builder() {
        let cfg = DeviceConfig::default()
            .with_completion_mode(CompletionMode::Polling)
            .with_wait_timeout(Duration::from_millis(50))
            .with_skip_version_check(true);
        assert_eq!(cfg.completion_mode, CompletionMode::Polling);
        assert_eq!(cfg.wait_timeout, Duration::from_millis(50));
        assert!(cfg.skip_version_check);
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(CompletionMode::Interrupt.to_string(), "interrupt");
        assert_eq!(CompletionMode::Polling.to_string(), "polling");
    }
}
