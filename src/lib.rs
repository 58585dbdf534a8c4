//! crab-mitm - an interactive TLS-intercepting HTTP(S) proxy engine
//!
//! Provides:
//! - Explicit proxy listener (CONNECT and absolute-form requests)
//! - TLS interception with leaf certificates issued from a local CA
//! - Ordered rules: allow, map local, map remote, status rewrite
//! - Latency and bandwidth shaping, optionally scoped to selected hosts
//! - Client IP allowlist
//! - Transparent listener for redirected traffic
//!
//! [`ProxyHandle`] is the entry point for hosts embedding the engine.

pub mod access;
pub mod certificate;
pub mod config;
pub mod controller;
pub mod error;
mod exchange;
pub mod logging;
pub mod matcher;
pub mod proxy;
pub mod rewind;
pub mod rules;
pub mod settings;
pub mod throttle;
pub mod tls;
pub mod transparent;
pub mod upstream;

pub use certificate::{generate, generate_ca_files, CaMaterial, KeyAlgorithm};
pub use controller::{ProxyHandle, ProxyState};
pub use error::{Error, Result, StatusCode};
pub use logging::{set_log_sink, LogLevel, LogSink};
pub use matcher::Matcher;
pub use proxy::SessionState;
pub use rules::{Decision, Rule, RuleAction, RuleSet, RuleSpec};
pub use settings::EngineSettings;
pub use throttle::{throttled_copy, ThrottleConfig};
pub use transparent::{DestinationResolver, StaticDestination, SystemDestinationResolver};
