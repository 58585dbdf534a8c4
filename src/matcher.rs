//! Host and path patterns shared by rules and throttle scoping
//!
//! Grammar: `[scheme://]host[:port][/path]`
//!
//! * host: `*`, an exact name or IP (`[v6]` in brackets), `*.suffix` for any
//!   subdomain of `suffix` (not the apex), or `~regex` matched case-insensitively
//!   against the whole host. A regex host ends at the first `/`.
//! * path: a prefix, or an anchored glob when it contains `*`. A `?` in the
//!   pattern path makes it match against path and query together.

use crate::error::{Error, Result};
use regex::{Regex, RegexBuilder};
use std::fmt;
use std::net::Ipv6Addr;

#[derive(Debug, Clone)]
enum HostPattern {
    Any,
    Exact(String),
    /// Stored with its leading dot
    Wildcard(String),
    Regex(Regex),
}

#[derive(Debug, Clone)]
enum PathPattern {
    Any,
    Prefix(String),
    Glob(Regex),
}

/// Compiled matcher
#[derive(Debug, Clone)]
pub struct Matcher {
    raw: String,
    host: HostPattern,
    port: Option<u16>,
    path: PathPattern,
    match_query: bool,
}

impl Matcher {
    /// Compile a pattern string
    pub fn compile(pattern: &str) -> Result<Self> {
        let raw = pattern.trim();
        if raw.is_empty() {
            return Err(Error::invalid_argument("matcher must not be empty"));
        }

        let rest = match raw.find("://") {
            Some(idx) => {
                let scheme = raw[..idx].to_ascii_lowercase();
                if scheme != "http" && scheme != "https" {
                    return Err(Error::invalid_argument(format!(
                        "unsupported scheme in matcher {}: {}",
                        raw, scheme
                    )));
                }
                &raw[idx + 3..]
            }
            None => raw,
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], Some(&rest[idx..])),
            None => (rest, None),
        };

        let (host, port) = if let Some(expr) = authority.strip_prefix('~') {
            (compile_regex_host(raw, expr)?, None)
        } else {
            let (host, port) = split_pattern_authority(raw, authority)?;
            (compile_host(raw, host)?, port)
        };

        let match_query = path.map(|p| p.contains('?')).unwrap_or(false);
        let path = match path {
            None => PathPattern::Any,
            Some(p) if p.contains('*') => PathPattern::Glob(compile_glob(raw, p)?),
            Some(p) => PathPattern::Prefix(p.to_string()),
        };

        Ok(Self {
            raw: raw.to_string(),
            host,
            port,
            path,
            match_query,
        })
    }

    /// The pattern as given by the caller
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Match a host (optionally `host:port`) and a path with optional query
    pub fn matches(&self, host: &str, path: &str) -> bool {
        let (host, port) = split_authority(host);
        self.matches_target(host, port, path)
    }

    /// Match an already split target
    pub fn matches_target(&self, host: &str, port: Option<u16>, path_and_query: &str) -> bool {
        if !self.matches_host(host) {
            return false;
        }
        if let Some(expected) = self.port {
            if port != Some(expected) {
                return false;
            }
        }

        let subject = if self.match_query {
            path_and_query
        } else {
            path_and_query
                .split_once('?')
                .map(|(path, _)| path)
                .unwrap_or(path_and_query)
        };

        match &self.path {
            PathPattern::Any => true,
            PathPattern::Prefix(prefix) => subject.starts_with(prefix.as_str()),
            PathPattern::Glob(re) => re.is_match(subject),
        }
    }

    /// Host-only match, ignoring port and path
    pub fn matches_host(&self, host: &str) -> bool {
        let host = normalize_request_host(host);
        match &self.host {
            HostPattern::Any => true,
            HostPattern::Exact(expected) => host == *expected,
            HostPattern::Wildcard(suffix) => host.len() > suffix.len() && host.ends_with(suffix.as_str()),
            HostPattern::Regex(re) => re.is_match(&host),
        }
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn normalize_request_host(host: &str) -> String {
    let host = host.trim().trim_end_matches('.');
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    host.to_ascii_lowercase()
}

/// Split `host[:port]` coming from a request, tolerating bracketed IPv6
pub(crate) fn split_authority(authority: &str) -> (&str, Option<u16>) {
    if let Some(rest) = authority.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
            return (host, port);
        }
        return (authority, None);
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host, Some(port)),
            Err(_) => (authority, None),
        },
        _ => (authority, None),
    }
}

fn split_pattern_authority<'a>(raw: &str, authority: &'a str) -> Result<(&'a str, Option<u16>)> {
    let parse_port = |text: &str| -> Result<u16> {
        match text.parse::<u16>() {
            Ok(port) if port != 0 => Ok(port),
            _ => Err(Error::invalid_argument(format!("invalid port in matcher {}: {}", raw, text))),
        }
    };

    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| Error::invalid_argument(format!("unterminated IPv6 literal in matcher {}", raw)))?;
        let port = match tail {
            "" => None,
            t => match t.strip_prefix(':') {
                Some(p) => Some(parse_port(p)?),
                None => {
                    return Err(Error::invalid_argument(format!("unexpected text after IPv6 literal in matcher {}", raw)))
                }
            },
        };
        return Ok((host, port));
    }

    if authority.matches(':').count() > 1 {
        // Bare IPv6 literal without brackets, no port possible.
        return Ok((authority, None));
    }

    match authority.split_once(':') {
        Some((host, port)) => Ok((host, Some(parse_port(port)?))),
        None => Ok((authority, None)),
    }
}

fn valid_host_chars(host: &str) -> bool {
    host.bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_'))
}

fn compile_host(raw: &str, host: &str) -> Result<HostPattern> {
    if host.is_empty() {
        return Err(Error::invalid_argument(format!("matcher {} has no host", raw)));
    }
    if host == "*" {
        return Ok(HostPattern::Any);
    }

    if let Some(suffix) = host.strip_prefix("*.") {
        let suffix = suffix.trim_end_matches('.');
        if suffix.is_empty() || suffix.contains('*') || !valid_host_chars(suffix) {
            return Err(Error::invalid_argument(format!("invalid wildcard host in matcher {}", raw)));
        }
        return Ok(HostPattern::Wildcard(format!(".{}", suffix.to_ascii_lowercase())));
    }

    if host.contains('*') {
        return Err(Error::invalid_argument(format!(
            "wildcard is only allowed as a leading \"*.\" label in matcher {}",
            raw
        )));
    }

    if host.parse::<Ipv6Addr>().is_ok() {
        return Ok(HostPattern::Exact(host.to_ascii_lowercase()));
    }

    let host = host.trim_end_matches('.');
    if host.is_empty() || !valid_host_chars(host) {
        return Err(Error::invalid_argument(format!("invalid host in matcher {}", raw)));
    }
    Ok(HostPattern::Exact(host.to_ascii_lowercase()))
}

fn compile_regex_host(raw: &str, expr: &str) -> Result<HostPattern> {
    if expr.is_empty() {
        return Err(Error::invalid_argument(format!("empty host regex in matcher {}", raw)));
    }
    RegexBuilder::new(&format!("^(?:{})$", expr))
        .case_insensitive(true)
        .build()
        .map(HostPattern::Regex)
        .map_err(|e| Error::invalid_argument(format!("invalid host regex in matcher {}: {}", raw, e)))
}

/// Anchored glob where `*` matches any run of characters
fn compile_glob(raw: &str, path: &str) -> Result<Regex> {
    let mut expr = String::with_capacity(path.len() + 8);
    expr.push('^');
    for (i, literal) in path.split('*').enumerate() {
        if i > 0 {
            expr.push_str(".*");
        }
        expr.push_str(&regex::escape(literal));
    }
    expr.push('$');

    Regex::new(&expr)
        .map_err(|e| Error::invalid_argument(format!("invalid path glob in matcher {}: {}", raw, e)))
}
