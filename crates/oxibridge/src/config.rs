//! Bridge configuration.
//!
//! Configuration is plain data: build a [`BridgeConfig`] in code or read it
//! from the environment with [`BridgeConfig::from_env`], then hand it to
//! [`crate::Bridge::builder`].
//!
//! # Environment
//!
//! - `OXIBRIDGE_LOG` - log level (`error`, `warn`, `info`, `debug`, `trace`)
//! - `OXIBRIDGE_VIOLATION` - `abort` (default) or `panic`

use oxibridge_log::Level;
use std::fmt;
use std::str::FromStr;

/// Environment variable selecting the [`ViolationPolicy`].
pub const VIOLATION_ENV: &str = "OXIBRIDGE_VIOLATION";

/// What a native copy/dispose hook does when it detects a lifetime invariant
/// violation.
///
/// Hooks are `extern "C"`, so a panic cannot unwind out of them and still
/// ends the process; `Panic` exists to route the failure through the panic
/// hook (message, location, `RUST_BACKTRACE`) before that happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ViolationPolicy {
    /// Log and call `std::process::abort`.
    #[default]
    Abort = 0,
    /// Log and panic.
    Panic = 1,
}

impl ViolationPolicy {
    pub(crate) const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ViolationPolicy::Panic,
            _ => ViolationPolicy::Abort,
        }
    }
}

/// Error returned when a policy name cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsePolicyError(String);

impl fmt::Display for ParsePolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid violation policy: {}", self.0)
    }
}

impl std::error::Error for ParsePolicyError {}

impl FromStr for ViolationPolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(ViolationPolicy::Abort),
            "panic" => Ok(ViolationPolicy::Panic),
            _ => Err(ParsePolicyError(s.to_string())),
        }
    }
}

/// Settings applied when a [`crate::Bridge`] is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Level to set on the global logger. `None` leaves it untouched.
    pub log_level: Option<Level>,
    /// Behaviour of the native hooks on a lifetime invariant violation.
    pub violation_policy: ViolationPolicy,
    /// Initial capacity of each identity map.
    pub registry_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            log_level: None,
            violation_policy: ViolationPolicy::Abort,
            registry_capacity: 64,
        }
    }
}

impl BridgeConfig {
    /// Reads `OXIBRIDGE_LOG` and `OXIBRIDGE_VIOLATION`.
    ///
    /// Unset or unparsable variables keep their defaults; an unparsable
    /// value is reported with a warning.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = BridgeConfig::default();

        if let Ok(value) = std::env::var(oxibridge_log::LEVEL_ENV) {
            match value.parse() {
                Ok(level) => config.log_level = Some(level),
                Err(err) => oxibridge_log::warn!("{err}"),
            }
        }
        if let Ok(value) = std::env::var(VIOLATION_ENV) {
            match value.parse() {
                Ok(policy) => config.violation_policy = policy,
                Err(err) => oxibridge_log::warn!("{err}"),
            }
        }

        config
    }

    /// Sets the log level.
    #[must_use]
    pub fn with_log_level(mut self, level: Level) -> Self {
        self.log_level = Some(level);
        self
    }

    /// Sets the violation policy.
    #[must_use]
    pub fn with_violation_policy(mut self, policy: ViolationPolicy) -> Self {
        self.violation_policy = policy;
        self
    }

    /// Sets the initial identity map capacity.
    #[must_use]
    pub fn with_registry_capacity(mut self, capacity: usize) -> Self {
        self.registry_capacity = capacity;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_parse() {
        assert_eq!("abort".parse(), Ok(ViolationPolicy::Abort));
        assert_eq!(" PANIC ".parse(), Ok(ViolationPolicy::Panic));
        assert!("ignore".parse::<ViolationPolicy>().is_err());
    }

    #[test]
    fn test_policy_u8_round_trip() {
        for policy in [ViolationPolicy::Abort, ViolationPolicy::Panic] {
            assert_eq!(ViolationPolicy::from_u8(policy as u8), policy);
        }
    }

    #[test]
    fn test_builder_methods() {
        let config = BridgeConfig::default()
            .with_log_level(Level::Debug)
            .with_violation_policy(ViolationPolicy::Panic)
            .with_registry_capacity(8);

        assert_eq!(config.log_level, Some(Level::Debug));
        assert_eq!(config.violation_policy, ViolationPolicy::Panic);
        assert_eq!(config.registry_capacity, 8);
    }

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.log_level, None);
        assert_eq!(config.violation_policy, ViolationPolicy::Abort);
    }
}
