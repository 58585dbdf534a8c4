//! Proxy controller
//!
//! [`ProxyHandle`] owns the configuration store and the listener tasks. Every
//! mutator validates into a copy of the current configuration and publishes
//! it only on success, so running sessions keep the snapshot they started with
//! and new sessions pick up the change.

use crate::certificate::CaMaterial;
use crate::config::{ConfigStore, ProxyConfig};
use crate::error::{Error, Result};
use crate::matcher::Matcher;
use crate::proxy::{run_listener, ListenerKind, SHUTDOWN_GRACE};
use crate::rules::{parse_destination, Rule, RuleAction};
use crate::settings::{CaSummary, ConfigDump, EngineSettings};
use crate::transparent::DestinationResolver;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Lifecycle of a [`ProxyHandle`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Created,
    Configured,
    Running,
    Stopped,
}

impl fmt::Display for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProxyState::Created => "created",
            ProxyState::Configured => "configured",
            ProxyState::Running => "running",
            ProxyState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct Lifecycle {
    state: ProxyState,
    local_addrs: Vec<SocketAddr>,
    // Set while `start` binds from its snapshot
    starting: bool,
}

impl Lifecycle {
    fn listeners_frozen(&self) -> bool {
        self.starting || self.state == ProxyState::Running
    }
}

struct RunningProxy {
    shutdown: watch::Sender<bool>,
    listeners: Vec<JoinHandle<()>>,
}

/// Which settings a configuration call touches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    /// Applied to new sessions while running
    Live,
    /// Only accepted while stopped
    Listener,
}

/// Parse `host:port`; `localhost` maps to the IPv4 loopback
pub fn parse_listen_addr(addr: &str) -> Result<SocketAddr> {
    let addr = addr.trim();
    if let Ok(parsed) = addr.parse::<SocketAddr>() {
        return Ok(parsed);
    }
    let invalid = || Error::invalid_argument(format!("invalid listen address: {:?}", addr));
    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    let port: u16 = port.parse().map_err(|_| invalid())?;
    if host.eq_ignore_ascii_case("localhost") {
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
    }
    let host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
    let ip: IpAddr = host.parse().map_err(|_| invalid())?;
    Ok(SocketAddr::new(ip, port))
}

/// Handle to one proxy engine instance
pub struct ProxyHandle {
    store: Arc<ConfigStore>,
    lifecycle: Mutex<Lifecycle>,
    running: tokio::sync::Mutex<Option<RunningProxy>>,
}

impl ProxyHandle {
    /// Create a handle; an empty `listen_addr` leaves the address unset
    pub fn new(listen_addr: &str) -> Result<Self> {
        let mut config = ProxyConfig::default();
        if !listen_addr.trim().is_empty() {
            config.listen_addr = Some(parse_listen_addr(listen_addr)?);
        }
        Ok(Self {
            store: Arc::new(ConfigStore::new(config)),
            lifecycle: Mutex::new(Lifecycle {
                state: ProxyState::Created,
                local_addrs: Vec::new(),
                starting: false,
            }),
            running: tokio::sync::Mutex::new(None),
        })
    }

    fn configure<T>(&self, scope: Scope, change: impl FnOnce(&mut ProxyConfig) -> Result<T>) -> Result<T> {
        let mut lifecycle = self.lifecycle.lock();
        if scope == Scope::Listener && lifecycle.listeners_frozen() {
            return Err(Error::invalid_state("listener settings cannot change while running"));
        }
        let out = self.store.update(change)?;
        if lifecycle.state == ProxyState::Created {
            lifecycle.state = ProxyState::Configured;
        }
        Ok(out)
    }

    pub fn set_listen_addr(&self, addr: &str) -> Result<()> {
        let addr = parse_listen_addr(addr)?;
        self.configure(Scope::Listener, |config| {
            config.listen_addr = Some(addr);
            Ok(())
        })
    }

    /// Change the port, keeping the address (loopback when none was set)
    pub fn set_port(&self, port: u16) -> Result<()> {
        self.configure(Scope::Listener, |config| {
            let ip = config
                .listen_addr
                .map(|addr| addr.ip())
                .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
            config.listen_addr = Some(SocketAddr::new(ip, port));
            Ok(())
        })
    }

    /// Load the root CA used to issue leaf certificates
    pub fn load_ca(&self, cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<()> {
        let ca = Arc::new(CaMaterial::load(cert_path.as_ref(), key_path.as_ref())?);
        info!("Loaded CA {:?} ({})", ca.common_name(), ca.algorithm());
        self.configure(Scope::Live, |config| {
            config.ca = Some(ca);
            Ok(())
        })
    }

    pub fn set_ca(&self, ca: Arc<CaMaterial>) -> Result<()> {
        self.configure(Scope::Live, |config| {
            config.ca = Some(ca);
            Ok(())
        })
    }

    pub fn set_inspect_enabled(&self, enabled: bool) -> Result<()> {
        self.configure(Scope::Live, |config| {
            config.inspect_enabled = enabled;
            Ok(())
        })
    }

    pub fn set_throttle_enabled(&self, enabled: bool) -> Result<()> {
        self.configure(Scope::Live, |config| {
            config.throttle.enabled = enabled;
            Ok(())
        })
    }

    pub fn set_throttle_latency_ms(&self, latency_ms: u64) -> Result<()> {
        self.configure(Scope::Live, |config| {
            config.throttle.latency_ms = latency_ms;
            Ok(())
        })
    }

    pub fn set_throttle_downstream_bps(&self, bps: u64) -> Result<()> {
        self.configure(Scope::Live, |config| {
            config.throttle.downstream_bps = bps;
            Ok(())
        })
    }

    pub fn set_throttle_upstream_bps(&self, bps: u64) -> Result<()> {
        self.configure(Scope::Live, |config| {
            config.throttle.upstream_bps = bps;
            Ok(())
        })
    }

    pub fn set_throttle_only_selected_hosts(&self, only_selected: bool) -> Result<()> {
        self.configure(Scope::Live, |config| {
            config.throttle.only_selected_hosts = only_selected;
            Ok(())
        })
    }

    pub fn throttle_hosts_clear(&self) -> Result<()> {
        self.configure(Scope::Live, |config| {
            config.throttle.selected_hosts.clear();
            Ok(())
        })
    }

    pub fn throttle_hosts_add(&self, pattern: &str) -> Result<()> {
        let matcher = Matcher::compile(pattern)?;
        self.configure(Scope::Live, |config| {
            config.throttle.selected_hosts.push(matcher);
            Ok(())
        })
    }

    pub fn set_client_allowlist_enabled(&self, enabled: bool) -> Result<()> {
        self.configure(Scope::Live, |config| {
            config.client_allowlist.set_enabled(enabled);
            Ok(())
        })
    }

    pub fn client_allowlist_clear(&self) -> Result<()> {
        self.configure(Scope::Live, |config| {
            config.client_allowlist.clear();
            Ok(())
        })
    }

    pub fn client_allowlist_add_ip(&self, ip: &str) -> Result<()> {
        self.configure(Scope::Live, |config| config.client_allowlist.add_ip(ip))
    }

    pub fn set_transparent_enabled(&self, enabled: bool) -> Result<()> {
        self.configure(Scope::Listener, |config| {
            config.transparent.enabled = enabled;
            Ok(())
        })
    }

    pub fn set_transparent_port(&self, port: u16) -> Result<()> {
        self.configure(Scope::Listener, |config| {
            config.transparent.port = port;
            Ok(())
        })
    }

    /// Replace how transparent connections find their original destination
    pub fn set_destination_resolver(&self, resolver: Arc<dyn DestinationResolver>) -> Result<()> {
        self.configure(Scope::Live, |config| {
            config.resolver = resolver;
            Ok(())
        })
    }

    pub fn rules_clear(&self) -> Result<()> {
        self.configure(Scope::Live, |config| {
            config.rules.clear();
            Ok(())
        })
    }

    fn add_rule(&self, matcher: &str, action: RuleAction) -> Result<()> {
        let rule = Rule::new(Matcher::compile(matcher)?, action)?;
        self.configure(Scope::Live, |config| {
            config.rules.push(rule);
            Ok(())
        })
    }

    pub fn rules_add_allow(&self, matcher: &str) -> Result<()> {
        self.add_rule(matcher, RuleAction::Allow)
    }

    pub fn rules_add_map_local_file(
        &self,
        matcher: &str,
        path: impl Into<PathBuf>,
        status: u16,
        content_type: Option<&str>,
    ) -> Result<()> {
        self.add_rule(
            matcher,
            RuleAction::MapLocalFile {
                path: path.into(),
                status,
                content_type: content_type.map(str::to_string),
            },
        )
    }

    pub fn rules_add_map_local_text(
        &self,
        matcher: &str,
        text: impl Into<Bytes>,
        status: u16,
        content_type: Option<&str>,
    ) -> Result<()> {
        self.add_rule(
            matcher,
            RuleAction::MapLocalText {
                text: text.into(),
                status,
                content_type: content_type.map(str::to_string),
            },
        )
    }

    pub fn rules_add_map_remote(&self, matcher: &str, destination: &str) -> Result<()> {
        let destination = parse_destination(destination)?;
        self.add_rule(matcher, RuleAction::MapRemote { destination })
    }

    /// `from = None` rewrites every status
    pub fn rules_add_status_rewrite(&self, matcher: &str, from: Option<u16>, to: u16) -> Result<()> {
        self.add_rule(matcher, RuleAction::StatusRewrite { from, to })
    }

    /// Apply a whole settings document atomically
    ///
    /// While running, listener settings must match the current ones.
    pub fn apply_settings(&self, settings: &EngineSettings) -> Result<()> {
        let listen_addr = settings
            .listen_addr
            .as_deref()
            .map(parse_listen_addr)
            .transpose()?;

        let mut lifecycle = self.lifecycle.lock();
        let running = lifecycle.listeners_frozen();
        self.store.update(|config| {
            let listener_changed = listen_addr.is_some_and(|addr| Some(addr) != config.listen_addr)
                || settings.transparent.enabled != config.transparent.enabled
                || settings.transparent.listen_port != config.transparent.port;
            if running && listener_changed {
                return Err(Error::invalid_state("listener settings cannot change while running"));
            }
            settings.apply_live(config)?;
            if let Some(addr) = listen_addr {
                config.listen_addr = Some(addr);
            }
            config.transparent.enabled = settings.transparent.enabled;
            config.transparent.port = settings.transparent.listen_port;
            Ok(())
        })?;
        if lifecycle.state == ProxyState::Created {
            lifecycle.state = ProxyState::Configured;
        }
        Ok(())
    }

    async fn bind_listeners(config: &ProxyConfig) -> Result<Vec<(ListenerKind, TcpListener)>> {
        let listen_addr = config
            .listen_addr
            .ok_or_else(|| Error::invalid_state("no listen address configured"))?;

        let mut listeners = Vec::new();
        let main = TcpListener::bind(listen_addr)
            .await
            .map_err(|e| Error::io(format!("failed to bind {}", listen_addr), e))?;
        listeners.push((ListenerKind::Explicit, main));

        if config.transparent.enabled {
            let addr = SocketAddr::new(listen_addr.ip(), config.transparent.port);
            let transparent = TcpListener::bind(addr)
                .await
                .map_err(|e| Error::io(format!("failed to bind transparent listener {}", addr), e))?;
            listeners.push((ListenerKind::Transparent, transparent));
        }
        Ok(listeners)
    }

    /// Bind the listeners and start accepting
    ///
    /// Listener settings are rejected from the moment the snapshot is taken,
    /// so the bound sockets always match the published configuration.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(Error::invalid_state("proxy is already running"));
        }

        let config = {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.starting = true;
            self.store.snapshot()
        };
        let bound = Self::bind_listeners(&config).await;

        let mut lifecycle = self.lifecycle.lock();
        lifecycle.starting = false;
        let listeners = bound?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut local_addrs = Vec::new();
        let mut handles = Vec::new();
        for (kind, listener) in listeners {
            let local = listener.local_addr()?;
            info!("Proxy {} listener bound on {}", kind, local);
            local_addrs.push(local);
            handles.push(tokio::spawn(run_listener(
                listener,
                kind,
                self.store.clone(),
                shutdown_rx.clone(),
            )));
        }

        *running = Some(RunningProxy {
            shutdown: shutdown_tx,
            listeners: handles,
        });
        lifecycle.state = ProxyState::Running;
        lifecycle.local_addrs = local_addrs;
        Ok(())
    }

    /// Stop accepting and wind down sessions; no-op when not running
    ///
    /// A concurrent `start` waits until the previous listeners are drained.
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        let Some(proxy) = running.take() else {
            return Ok(());
        };

        info!("Stopping proxy");
        let _ = proxy.shutdown.send(true);
        for mut handle in proxy.listeners {
            // Listeners abort their own sessions after the grace period.
            match tokio::time::timeout(SHUTDOWN_GRACE + Duration::from_secs(1), &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Listener task failed: {}", e),
                Err(_) => {
                    warn!("Listener did not finish in time, aborting");
                    handle.abort();
                }
            }
        }

        let mut lifecycle = self.lifecycle.lock();
        lifecycle.state = ProxyState::Stopped;
        lifecycle.local_addrs.clear();
        drop(running);
        info!("Proxy stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.state() == ProxyState::Running
    }

    pub fn state(&self) -> ProxyState {
        self.lifecycle.lock().state
    }

    /// Bound listener addresses, main listener first
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.lifecycle.lock().local_addrs.clone()
    }

    /// The configuration new sessions would receive
    pub fn snapshot(&self) -> Arc<ProxyConfig> {
        self.store.snapshot()
    }

    pub fn settings(&self) -> EngineSettings {
        EngineSettings::from_config(&self.store.snapshot())
    }

    /// Current configuration and lifecycle as JSON
    pub fn dump_config(&self) -> Result<String> {
        let config = self.store.snapshot();
        let (state, local_addrs) = {
            let lifecycle = self.lifecycle.lock();
            (lifecycle.state, lifecycle.local_addrs.clone())
        };
        let dump = ConfigDump {
            state: state.to_string(),
            running: state == ProxyState::Running,
            local_addrs: local_addrs.iter().map(|addr| addr.to_string()).collect(),
            ca_loaded: config.ca.as_deref().map(CaSummary::of),
            settings: EngineSettings::from_config(&config),
        };
        serde_json::to_string_pretty(&dump)
            .map_err(|e| Error::internal(format!("failed to serialize config: {}", e)))
    }

    /// Rule list as JSON, in evaluation order
    pub fn dump_rules(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.store.snapshot().rules.to_specs())
            .map_err(|e| Error::internal(format!("failed to serialize rules: {}", e)))
    }

    /// Stop and release everything
    pub async fn destroy(self) -> Result<()> {
        self.stop().await
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        if let Some(proxy) = self.running.get_mut().take() {
            let _ = proxy.shutdown.send(true);
        }
    }
}

impl fmt::Debug for ProxyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lifecycle = self.lifecycle.lock();
        f.debug_struct("ProxyHandle")
            .field("state", &lifecycle.state)
            .field("local_addrs", &lifecycle.local_addrs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StatusCode;

    #[test]
    fn test_parse_listen_addr() {
        assert_eq!(parse_listen_addr("127.0.0.1:8888").unwrap().port(), 8888);
        assert_eq!(
            parse_listen_addr("localhost:9000").unwrap(),
            "127.0.0.1:9000".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_listen_addr("[::1]:8080").unwrap().is_ipv6());
        for bad in ["8888", "example.com:80", "127.0.0.1:99999", "127.0.0.1:"] {
            assert_eq!(parse_listen_addr(bad).unwrap_err().code(), StatusCode::InvalidArgument, "{}", bad);
        }
    }

    #[test]
    fn test_new_and_configure() {
        let handle = ProxyHandle::new("").unwrap();
        assert_eq!(handle.state(), ProxyState::Created);
        assert!(handle.snapshot().listen_addr.is_none());
        assert!(ProxyHandle::new("nonsense").is_err());

        handle.set_port(0).unwrap();
        assert_eq!(handle.state(), ProxyState::Configured);
        assert_eq!(handle.snapshot().listen_addr, Some("127.0.0.1:0".parse().unwrap()));
    }

    #[test]
    fn test_invalid_rule_changes_nothing() {
        let handle = ProxyHandle::new("127.0.0.1:0").unwrap();
        handle.rules_add_allow("*.example.com").unwrap();
        assert!(handle.rules_add_status_rewrite("example.com:0", None, 404).is_err());
        assert!(handle.rules_add_map_local_text("*", "x", 42, None).is_err());
        assert!(handle.rules_add_map_remote("*", "ftp://example.com").is_err());
        assert_eq!(handle.snapshot().rules.len(), 1);
    }

    #[tokio::test]
    async fn test_start_requires_listen_addr() {
        let handle = ProxyHandle::new("").unwrap();
        let err = handle.start().await.unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidState);
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let handle = ProxyHandle::new("127.0.0.1:0").unwrap();
        handle.stop().await.unwrap();
        assert_eq!(handle.state(), ProxyState::Created);

        handle.start().await.unwrap();
        assert!(handle.is_running());
        assert_eq!(handle.local_addrs().len(), 1);
        assert_ne!(handle.local_addrs()[0].port(), 0);

        assert_eq!(handle.start().await.unwrap_err().code(), StatusCode::InvalidState);
        assert_eq!(handle.set_port(9999).unwrap_err().code(), StatusCode::InvalidState);
        assert_eq!(
            handle.set_transparent_enabled(true).unwrap_err().code(),
            StatusCode::InvalidState
        );
        handle.set_inspect_enabled(false).unwrap();

        handle.stop().await.unwrap();
        assert_eq!(handle.state(), ProxyState::Stopped);
        assert!(handle.local_addrs().is_empty());
        handle.stop().await.unwrap();

        handle.start().await.unwrap();
        handle.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_is_io() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let handle = ProxyHandle::new(&occupied.local_addr().unwrap().to_string()).unwrap();
        assert_eq!(handle.start().await.unwrap_err().code(), StatusCode::Io);
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_apply_settings_while_running() {
        let handle = ProxyHandle::new("127.0.0.1:0").unwrap();
        handle.start().await.unwrap();

        let mut settings = handle.settings();
        settings.listen_addr = None;
        settings.inspect.enabled = false;
        settings.rules.push(crate::rules::RuleSpec::Allow {
            matcher: "*".into(),
        });
        handle.apply_settings(&settings).unwrap();
        assert!(!handle.snapshot().inspect_enabled);

        settings.transparent.enabled = true;
        assert_eq!(
            handle.apply_settings(&settings).unwrap_err().code(),
            StatusCode::InvalidState
        );
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_listener_settings_frozen_while_starting() {
        let handle = ProxyHandle::new("127.0.0.1:0").unwrap();
        handle.lifecycle.lock().starting = true;
        assert_eq!(handle.set_port(9999).unwrap_err().code(), StatusCode::InvalidState);
        let mut settings = handle.settings();
        settings.transparent.enabled = true;
        assert_eq!(
            handle.apply_settings(&settings).unwrap_err().code(),
            StatusCode::InvalidState
        );
        handle.set_inspect_enabled(false).unwrap();

        handle.lifecycle.lock().starting = false;
        handle.set_port(0).unwrap();
        handle.start().await.unwrap();
        assert!(!handle.lifecycle.lock().starting);
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_waits_for_stop_to_drain() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpStream;

        let handle = Arc::new(ProxyHandle::new("127.0.0.1:0").unwrap());
        handle.start().await.unwrap();
        let first_addr = handle.local_addrs()[0];

        // A tunnel waiting for its first client byte outlives the shutdown signal.
        let mut parked = TcpStream::connect(first_addr).await.unwrap();
        parked
            .write_all(b"CONNECT parked.test:443 HTTP/1.1\r\nHost: parked.test:443\r\n\r\n")
            .await
            .unwrap();
        let mut reply = [0u8; 64];
        let n = parked.read(&mut reply).await.unwrap();
        assert!(String::from_utf8_lossy(&reply[..n]).starts_with("HTTP/1.1 200"));

        let stopping = tokio::spawn({
            let handle = handle.clone();
            async move { handle.stop().await }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(!stopping.is_finished());
        assert_eq!(handle.state(), ProxyState::Running);
        assert_eq!(handle.set_port(0).unwrap_err().code(), StatusCode::InvalidState);

        handle.start().await.unwrap();
        stopping.await.unwrap().unwrap();

        assert_eq!(handle.state(), ProxyState::Running);
        let addrs = handle.local_addrs();
        assert_eq!(addrs.len(), 1);
        TcpStream::connect(addrs[0]).await.unwrap();

        handle.stop().await.unwrap();
        assert_eq!(handle.state(), ProxyState::Stopped);
    }

    #[test]
    fn test_dump_config() {
        let handle = ProxyHandle::new("127.0.0.1:8888").unwrap();
        handle.rules_add_status_rewrite("api.example.com", Some(200), 503).unwrap();
        let dump: serde_json::Value = serde_json::from_str(&handle.dump_config().unwrap()).unwrap();
        assert_eq!(dump["state"], "configured");
        assert_eq!(dump["running"], false);
        assert_eq!(dump["listen_addr"], "127.0.0.1:8888");
        assert_eq!(dump["rules"][0]["action"], "status_rewrite");

        handle.rules_add_allow("*.example.com").unwrap();
        handle.rules_add_status_rewrite("*", None, 418).unwrap();
        let rules: serde_json::Value = serde_json::from_str(&handle.dump_rules().unwrap()).unwrap();
        let actions: Vec<_> = rules
            .as_array()
            .unwrap()
            .iter()
            .map(|rule| rule["action"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(actions, ["status_rewrite", "allow", "status_rewrite"]);

        let mut settings = handle.settings();
        settings.rules = serde_json::from_value(rules).unwrap();
        handle.apply_settings(&settings).unwrap();
        assert_eq!(handle.snapshot().rules.len(), 3);
    }
}
