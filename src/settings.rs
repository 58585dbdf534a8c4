//! JSON settings for the engine
//!
//! Settings files are read by the CLI (`--config`) and by
//! [`ProxyHandle::apply_settings`](crate::controller::ProxyHandle::apply_settings);
//! the same shape is produced by the config dump.

use crate::access::ClientAllowlist;
use crate::certificate::{CaMaterial, KeyAlgorithm};
use crate::config::{ProxyConfig, DEFAULT_TRANSPARENT_PORT};
use crate::error::{Error, Result};
use crate::matcher::Matcher;
use crate::rules::{RuleSet, RuleSpec};
use crate::throttle::ThrottleConfig;
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectSettings {
    pub enabled: bool,
}

impl Default for InspectSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleSettings {
    pub enabled: bool,
    pub latency_ms: u64,
    pub downstream_bps: u64,
    pub upstream_bps: u64,
    pub only_selected_hosts: bool,
    pub selected_hosts: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllowlistSettings {
    pub enabled: bool,
    pub ips: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransparentSettings {
    pub enabled: bool,
    pub listen_port: u16,
}

impl Default for TransparentSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_port: DEFAULT_TRANSPARENT_PORT,
        }
    }
}

/// Paths of a CA pair to load
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaPaths {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Everything configurable, in file form
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca: Option<CaPaths>,
    pub inspect: InspectSettings,
    pub throttle: ThrottleSettings,
    pub client_allowlist: AllowlistSettings,
    pub transparent: TransparentSettings,
    pub rules: Vec<RuleSpec>,
}

impl EngineSettings {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::invalid_argument(format!("invalid settings: {}", e)))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("failed to read settings {}", path.display()), e))?;
        Self::from_json(&text)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::internal(format!("failed to serialize settings: {}", e)))
    }

    /// Settings describing `config`; CA paths are not tracked
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            listen_addr: config.listen_addr.map(|addr| addr.to_string()),
            ca: None,
            inspect: InspectSettings {
                enabled: config.inspect_enabled,
            },
            throttle: ThrottleSettings {
                enabled: config.throttle.enabled,
                latency_ms: config.throttle.latency_ms,
                downstream_bps: config.throttle.downstream_bps,
                upstream_bps: config.throttle.upstream_bps,
                only_selected_hosts: config.throttle.only_selected_hosts,
                selected_hosts: config
                    .throttle
                    .selected_hosts
                    .iter()
                    .map(|m| m.as_str().to_string())
                    .collect(),
            },
            client_allowlist: AllowlistSettings {
                enabled: config.client_allowlist.is_enabled(),
                ips: config.client_allowlist.ips().map(|ip| ip.to_string()).collect(),
            },
            transparent: TransparentSettings {
                enabled: config.transparent.enabled,
                listen_port: config.transparent.port,
            },
            rules: config.rules.to_specs(),
        }
    }

    /// Apply everything except the listener settings onto `config`
    ///
    /// Every field is validated before anything is written, so an error
    /// leaves `config` untouched.
    pub fn apply_live(&self, config: &mut ProxyConfig) -> Result<()> {
        let ca = match &self.ca {
            Some(paths) => Some(Arc::new(CaMaterial::load(&paths.cert_path, &paths.key_path)?)),
            None => None,
        };
        let selected_hosts = self
            .throttle
            .selected_hosts
            .iter()
            .map(|pattern| Matcher::compile(pattern))
            .collect::<Result<Vec<_>>>()?;
        let mut allowlist = ClientAllowlist::new();
        allowlist.set_enabled(self.client_allowlist.enabled);
        for ip in &self.client_allowlist.ips {
            allowlist.add_ip(ip)?;
        }
        let rules = RuleSet::from_specs(&self.rules)?;

        if ca.is_some() {
            config.ca = ca;
        }
        config.inspect_enabled = self.inspect.enabled;
        config.throttle = ThrottleConfig {
            enabled: self.throttle.enabled,
            latency_ms: self.throttle.latency_ms,
            downstream_bps: self.throttle.downstream_bps,
            upstream_bps: self.throttle.upstream_bps,
            only_selected_hosts: self.throttle.only_selected_hosts,
            selected_hosts,
        };
        config.client_allowlist = allowlist;
        config.rules = rules;
        Ok(())
    }
}

/// Loaded CA as shown in dumps
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaSummary {
    pub common_name: String,
    pub algorithm: KeyAlgorithm,
    pub not_after: String,
}

impl CaSummary {
    pub fn of(ca: &CaMaterial) -> Self {
        let not_after = DateTime::from_timestamp(ca.not_after().unix_timestamp(), 0)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default();
        Self {
            common_name: ca.common_name().to_string(),
            algorithm: ca.algorithm(),
            not_after,
        }
    }
}

/// Output of `dump_config`
#[derive(Debug, Clone, Serialize)]
pub struct ConfigDump {
    pub state: String,
    pub running: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub local_addrs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_loaded: Option<CaSummary>,
    #[serde(flatten)]
    pub settings: EngineSettings,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StatusCode;

    const SAMPLE: &str = r#"{
        "listen_addr": "127.0.0.1:8888",
        "inspect": { "enabled": false },
        "throttle": {
            "enabled": true,
            "latency_ms": 150,
            "downstream_bps": 4096,
            "only_selected_hosts": true,
            "selected_hosts": ["*.example.com"]
        },
        "client_allowlist": { "enabled": true, "ips": ["10.0.0.1", "::ffff:10.0.0.2"] },
        "rules": [
            { "action": "status_rewrite", "matcher": "api.example.com/v1/*", "from": 200, "to": 503 },
            { "action": "map_local_text", "matcher": "*.test.local", "text": "hi" }
        ]
    }"#;

    #[test]
    fn test_parse_and_apply() {
        let settings = EngineSettings::from_json(SAMPLE).unwrap();
        assert_eq!(settings.transparent.listen_port, 8889);
        assert_eq!(settings.throttle.upstream_bps, 0);

        let mut config = ProxyConfig::default();
        settings.apply_live(&mut config).unwrap();
        assert!(!config.inspect_enabled);
        assert!(config.throttle.enabled);
        assert_eq!(config.throttle.selected_hosts.len(), 1);
        assert!(config.client_allowlist.admit("10.0.0.2".parse().unwrap()));
        assert!(!config.client_allowlist.admit("10.0.0.3".parse().unwrap()));
        assert_eq!(config.rules.len(), 2);
        // Listener settings are left to the controller.
        assert!(config.listen_addr.is_none());
    }

    #[test]
    fn test_invalid_entries_leave_config_untouched() {
        let mut settings = EngineSettings::from_json(SAMPLE).unwrap();
        settings.client_allowlist.ips.push("not-an-ip".into());

        let mut config = ProxyConfig::default();
        let err = settings.apply_live(&mut config).unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
        assert!(config.inspect_enabled);
        assert!(config.rules.is_empty());
    }

    #[test]
    fn test_missing_ca_files_are_io() {
        let settings = EngineSettings {
            ca: Some(CaPaths {
                cert_path: "/nonexistent/ca.pem".into(),
                key_path: "/nonexistent/ca.key".into(),
            }),
            ..Default::default()
        };
        let err = settings.apply_live(&mut ProxyConfig::default()).unwrap_err();
        assert_eq!(err.code(), StatusCode::Io);
    }

    #[test]
    fn test_config_round_trip() {
        let mut config = ProxyConfig::default();
        EngineSettings::from_json(SAMPLE).unwrap().apply_live(&mut config).unwrap();

        let dumped = EngineSettings::from_config(&config);
        assert_eq!(dumped.rules.len(), 2);
        assert_eq!(dumped.throttle.selected_hosts, vec!["*.example.com".to_string()]);
        assert!(dumped.client_allowlist.ips.contains(&"10.0.0.2".to_string()));

        let text = dumped.to_json_pretty().unwrap();
        assert_eq!(EngineSettings::from_json(&text).unwrap(), dumped);
    }

    #[test]
    fn test_bad_json() {
        let err = EngineSettings::from_json("{ \"rules\": 5 }").unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
    }
}
