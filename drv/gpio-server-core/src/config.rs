// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Agent configuration.
//!
//! One TOML document selects the backend and parameterizes the safety
//! policy. Everything has a default; an empty file is a valid strict
//! configuration with the mock disabled.
//!
//! ```toml
//! mock_mode = false
//! listen_path = "/run/gpio-agent.sock"
//! default_pull_mode = "None"
//!
//! [policy]
//! security_level = "Strict"
//! max_concurrent_ops = 16
//! operation_timeout_ms = 1000
//! restricted_pins = [5, 6]
//! allowed_pins = []
//! allowed_operations = []
//! ```

use std::collections::BTreeSet;
use std::time::Duration;

use serde::Deserialize;

use drv_gpio_api::{PinSet, Pull, SecurityLevel};

use crate::policy::PolicyConfig;

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    /// A field survived parsing but has a value the agent cannot run with.
    Invalid(&'static str),
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "reading config: {e}"),
            ConfigError::Parse(e) => write!(f, "parsing config: {e}"),
            ConfigError::Invalid(what) => {
                write!(f, "invalid config: {what}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicySection {
    pub security_level: SecurityLevel,
    pub allow_critical_pins: bool,
    pub max_concurrent_ops: u32,
    pub operation_timeout_ms: u64,
    pub allowed_operations: Vec<String>,
    pub restricted_pins: Vec<u8>,
    pub allowed_pins: Vec<u8>,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            security_level: SecurityLevel::Strict,
            allow_critical_pins: false,
            max_concurrent_ops: 16,
            operation_timeout_ms: 1000,
            allowed_operations: Vec::new(),
            restricted_pins: Vec::new(),
            allowed_pins: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub mock_mode: bool,
    pub listen_path: String,
    pub default_pull_mode: Pull,
    pub audit_enabled: bool,
    pub audit_ring_entries: usize,
    pub policy: PolicySection,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            mock_mode: false,
            listen_path: "/run/gpio-agent.sock".to_string(),
            default_pull_mode: Pull::None,
            audit_enabled: true,
            audit_ring_entries: 128,
            policy: PolicySection::default(),
        }
    }
}

impl AgentConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig =
            toml::from_str(text).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.policy.max_concurrent_ops == 0 {
            return Err(ConfigError::Invalid("max_concurrent_ops is zero"));
        }
        if self.policy.operation_timeout_ms == 0 {
            return Err(ConfigError::Invalid("operation_timeout_ms is zero"));
        }
        if self.audit_ring_entries == 0 {
            return Err(ConfigError::Invalid("audit_ring_entries is zero"));
        }
        if self.listen_path.is_empty() {
            return Err(ConfigError::Invalid("listen_path is empty"));
        }
        Ok(())
    }

    pub fn policy_config(&self) -> PolicyConfig {
        PolicyConfig {
            security_level: self.policy.security_level,
            allow_critical_pins: self.policy.allow_critical_pins,
            max_concurrent_ops: self.policy.max_concurrent_ops,
            operation_timeout: Duration::from_millis(
                self.policy.operation_timeout_ms,
            ),
            allowed_operations: self
                .policy
                .allowed_operations
                .iter()
                .cloned()
                .collect::<BTreeSet<_>>(),
            restricted_pins: self
                .policy
                .restricted_pins
                .iter()
                .copied()
                .collect::<PinSet>(),
            allowed_pins: self
                .policy
                .allowed_pins
                .iter()
                .copied()
                .collect::<PinSet>(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_the_default() {
        let config = AgentConfig::from_toml_str("").unwrap();
        assert!(!config.mock_mode);
        assert!(config.audit_enabled);
        assert_eq!(config.policy.security_level, SecurityLevel::Strict);
        assert_eq!(config.policy.max_concurrent_ops, 16);
    }

    #[test]
    fn full_document_round_trips() {
        let text = r#"
            mock_mode = true
            listen_path = "/tmp/agent.sock"
            default_pull_mode = "Down"

            [policy]
            security_level = "Paranoid"
            allow_critical_pins = false
            max_concurrent_ops = 4
            operation_timeout_ms = 250
            allowed_operations = ["read", "write"]
            restricted_pins = [5]
            allowed_pins = [17, 18]
        "#;
        let config = AgentConfig::from_toml_str(text).unwrap();
        assert!(config.mock_mode);
        assert_eq!(config.default_pull_mode, Pull::Down);

        let policy = config.policy_config();
        assert_eq!(policy.max_concurrent_ops, 4);
        assert_eq!(
            policy.operation_timeout,
            Duration::from_millis(250)
        );
        assert!(policy.restricted_pins.contains(5));
        assert!(policy.allowed_pins.contains(18));
        assert!(policy.allowed_operations.contains("read"));
    }

    #[test]
    fn zero_cap_is_rejected() {
        let text = "[policy]\nmax_concurrent_ops = 0\n";
        assert!(matches!(
            AgentConfig::from_toml_str(text),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(matches!(
            AgentConfig::from_toml_str("mok_mode = true\n"),
            Err(ConfigError::Parse(_))
        ));
    }
}
