//! Configuration snapshots
//!
//! Sessions read one immutable [`ProxyConfig`] when they start. Mutations clone
//! the current snapshot, apply the change and publish the result, so a failed
//! change leaves the published configuration untouched.

use crate::access::ClientAllowlist;
use crate::certificate::CaMaterial;
use crate::error::Result;
use crate::rules::RuleSet;
use crate::throttle::ThrottleConfig;
use crate::transparent::{DestinationResolver, SystemDestinationResolver};
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::Arc;

/// Default port of the transparent listener
pub const DEFAULT_TRANSPARENT_PORT: u16 = 8889;

/// Transparent listener settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransparentConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for TransparentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: DEFAULT_TRANSPARENT_PORT,
        }
    }
}

/// Everything a session needs to know
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_addr: Option<SocketAddr>,
    pub inspect_enabled: bool,
    pub ca: Option<Arc<CaMaterial>>,
    pub throttle: ThrottleConfig,
    pub client_allowlist: ClientAllowlist,
    pub transparent: TransparentConfig,
    pub rules: RuleSet,
    pub resolver: Arc<dyn DestinationResolver>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: None,
            inspect_enabled: true,
            ca: None,
            throttle: ThrottleConfig::default(),
            client_allowlist: ClientAllowlist::default(),
            transparent: TransparentConfig::default(),
            rules: RuleSet::default(),
            resolver: Arc::new(SystemDestinationResolver),
        }
    }
}

/// Copy-on-write holder of the current configuration
#[derive(Debug)]
pub struct ConfigStore {
    current: RwLock<Arc<ProxyConfig>>,
    writer: Mutex<()>,
}

impl ConfigStore {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
            writer: Mutex::new(()),
        }
    }

    /// The configuration new sessions will use
    pub fn snapshot(&self) -> Arc<ProxyConfig> {
        self.current.read().clone()
    }

    /// Apply `change` to a copy and publish it if the change succeeds
    pub fn update<T>(&self, change: impl FnOnce(&mut ProxyConfig) -> Result<T>) -> Result<T> {
        let _writer = self.writer.lock();
        let mut next = ProxyConfig::clone(&self.snapshot());
        let out = change(&mut next)?;
        *self.current.write() = Arc::new(next);
        Ok(out)
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new(ProxyConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::matcher::Matcher;
    use crate::rules::{Rule, RuleAction};

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::default();
        assert!(config.inspect_enabled);
        assert!(config.listen_addr.is_none());
        assert_eq!(config.transparent.port, 8889);
        assert!(!config.transparent.enabled);
        assert!(config.rules.is_empty());
    }

    #[test]
    fn test_snapshot_isolation() {
        let store = ConfigStore::default();
        let before = store.snapshot();

        store
            .update(|config| {
                config.inspect_enabled = false;
                config.rules.push(Rule::new(Matcher::compile("*").unwrap(), RuleAction::Allow)?);
                Ok(())
            })
            .unwrap();

        assert!(before.inspect_enabled);
        assert!(before.rules.is_empty());

        let after = store.snapshot();
        assert!(!after.inspect_enabled);
        assert_eq!(after.rules.len(), 1);
    }

    #[test]
    fn test_failed_update_publishes_nothing() {
        let store = ConfigStore::default();
        let result: Result<()> = store.update(|config| {
            config.inspect_enabled = false;
            Err(Error::invalid_argument("rejected"))
        });
        assert!(result.is_err());
        assert!(store.snapshot().inspect_enabled);
    }
}
