//! Ordered rule set evaluated once per HTTP exchange
//!
//! Rules are checked in insertion order and the first matching rule decides
//! what happens to the exchange.

use crate::error::{Error, Result};
use crate::matcher::Matcher;
use bytes::Bytes;
use hyper::header::HeaderValue;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

/// Content type used for text responses without an explicit one
pub const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// What a matching rule does
#[derive(Debug, Clone)]
pub enum RuleAction {
    /// Forward unchanged and stop evaluating
    Allow,
    /// Answer from a file read at request time
    MapLocalFile {
        path: PathBuf,
        status: u16,
        content_type: Option<String>,
    },
    /// Answer with fixed text
    MapLocalText {
        text: Bytes,
        status: u16,
        content_type: Option<String>,
    },
    /// Send the request to a different origin
    MapRemote { destination: Url },
    /// Replace the upstream status code
    StatusRewrite { from: Option<u16>, to: u16 },
}

/// A matcher paired with its action
#[derive(Debug, Clone)]
pub struct Rule {
    matcher: Matcher,
    action: RuleAction,
}

impl Rule {
    /// Validate and build a rule
    pub fn new(matcher: Matcher, action: RuleAction) -> Result<Self> {
        match &action {
            RuleAction::Allow => {}
            RuleAction::MapLocalFile {
                path,
                status,
                content_type,
            } => {
                if path.as_os_str().is_empty() {
                    return Err(Error::invalid_argument("map-local file path must not be empty"));
                }
                validate_status(*status)?;
                validate_content_type(content_type.as_deref())?;
            }
            RuleAction::MapLocalText {
                status,
                content_type,
                ..
            } => {
                validate_status(*status)?;
                validate_content_type(content_type.as_deref())?;
            }
            RuleAction::MapRemote { destination } => validate_destination(destination)?,
            RuleAction::StatusRewrite { from, to } => {
                if let Some(from) = from {
                    validate_status(*from)?;
                }
                validate_status(*to)?;
            }
        }
        Ok(Self { matcher, action })
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    pub fn action(&self) -> &RuleAction {
        &self.action
    }

    /// Serializable form of this rule
    pub fn to_spec(&self) -> RuleSpec {
        let matcher = self.matcher.as_str().to_string();
        match &self.action {
            RuleAction::Allow => RuleSpec::Allow { matcher },
            RuleAction::MapLocalFile {
                path,
                status,
                content_type,
            } => RuleSpec::MapLocalFile {
                matcher,
                path: path.clone(),
                status: *status,
                content_type: content_type.clone(),
            },
            RuleAction::MapLocalText {
                text,
                status,
                content_type,
            } => RuleSpec::MapLocalText {
                matcher,
                text: String::from_utf8_lossy(text).into_owned(),
                status: *status,
                content_type: content_type.clone(),
            },
            RuleAction::MapRemote { destination } => RuleSpec::MapRemote {
                matcher,
                destination: destination.to_string(),
            },
            RuleAction::StatusRewrite { from, to } => RuleSpec::StatusRewrite {
                matcher,
                from: *from,
                to: *to,
            },
        }
    }

    /// Compile a serialized rule
    pub fn from_spec(spec: &RuleSpec) -> Result<Self> {
        let matcher = Matcher::compile(spec.matcher())?;
        let action = match spec {
            RuleSpec::Allow { .. } => RuleAction::Allow,
            RuleSpec::MapLocalFile {
                path,
                status,
                content_type,
                ..
            } => RuleAction::MapLocalFile {
                path: path.clone(),
                status: *status,
                content_type: content_type.clone(),
            },
            RuleSpec::MapLocalText {
                text,
                status,
                content_type,
                ..
            } => RuleAction::MapLocalText {
                text: Bytes::from(text.clone()),
                status: *status,
                content_type: content_type.clone(),
            },
            RuleSpec::MapRemote { destination, .. } => RuleAction::MapRemote {
                destination: parse_destination(destination)?,
            },
            RuleSpec::StatusRewrite { from, to, .. } => RuleAction::StatusRewrite {
                from: *from,
                to: *to,
            },
        };
        Self::new(matcher, action)
    }
}

fn validate_status(status: u16) -> Result<()> {
    if (100..=599).contains(&status) {
        Ok(())
    } else {
        Err(Error::invalid_argument(format!("status code out of range: {}", status)))
    }
}

fn validate_content_type(content_type: Option<&str>) -> Result<()> {
    match content_type {
        Some(value) if value.trim().is_empty() || HeaderValue::from_str(value).is_err() => Err(
            Error::invalid_argument(format!("invalid content type: {:?}", value)),
        ),
        _ => Ok(()),
    }
}

fn validate_destination(destination: &Url) -> Result<()> {
    if !matches!(destination.scheme(), "http" | "https") {
        return Err(Error::invalid_argument(format!(
            "map-remote destination must be http or https: {}",
            destination
        )));
    }
    if destination.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(Error::invalid_argument(format!(
            "map-remote destination has no host: {}",
            destination
        )));
    }
    Ok(())
}

/// Parse and validate a map-remote destination URL
pub fn parse_destination(destination: &str) -> Result<Url> {
    let url = Url::parse(destination.trim()).map_err(|e| {
        Error::invalid_argument(format!("invalid map-remote destination {}: {}", destination, e))
    })?;
    validate_destination(&url)?;
    Ok(url)
}

/// Body of a locally answered exchange
#[derive(Debug, Clone)]
pub enum LocalBody {
    Text(Bytes),
    File(PathBuf),
}

/// Outcome of evaluating the rule set for one request
#[derive(Debug, Clone)]
pub enum Decision {
    Forward,
    Respond {
        status: u16,
        body: LocalBody,
        content_type: Option<String>,
        matcher: String,
    },
    RewriteStatus {
        from: Option<u16>,
        to: u16,
        matcher: String,
    },
    MapRemote {
        destination: Url,
        matcher: String,
    },
}

impl Decision {
    /// Pattern of the rule that produced this decision
    pub fn matcher(&self) -> Option<&str> {
        match self {
            Decision::Forward => None,
            Decision::Respond { matcher, .. }
            | Decision::RewriteStatus { matcher, .. }
            | Decision::MapRemote { matcher, .. } => Some(matcher),
        }
    }
}

/// Ordered list of rules
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    pub fn clear(&mut self) {
        self.rules.clear();
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    /// First matching rule decides
    pub fn evaluate(&self, host: &str, port: Option<u16>, path_and_query: &str) -> Decision {
        let Some(rule) = self
            .rules
            .iter()
            .find(|rule| rule.matcher.matches_target(host, port, path_and_query))
        else {
            return Decision::Forward;
        };

        let matcher = rule.matcher.as_str().to_string();
        match &rule.action {
            RuleAction::Allow => Decision::Forward,
            RuleAction::MapLocalFile {
                path,
                status,
                content_type,
            } => Decision::Respond {
                status: *status,
                body: LocalBody::File(path.clone()),
                content_type: content_type.clone(),
                matcher,
            },
            RuleAction::MapLocalText {
                text,
                status,
                content_type,
            } => Decision::Respond {
                status: *status,
                body: LocalBody::Text(text.clone()),
                content_type: content_type.clone(),
                matcher,
            },
            RuleAction::MapRemote { destination } => Decision::MapRemote {
                destination: destination.clone(),
                matcher,
            },
            RuleAction::StatusRewrite { from, to } => Decision::RewriteStatus {
                from: *from,
                to: *to,
                matcher,
            },
        }
    }

    pub fn to_specs(&self) -> Vec<RuleSpec> {
        self.rules.iter().map(Rule::to_spec).collect()
    }

    /// Compile every serialized rule; nothing is returned if any of them is invalid
    pub fn from_specs(specs: &[RuleSpec]) -> Result<Self> {
        let rules = specs.iter().map(Rule::from_spec).collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }
}

/// Status rewrite applies when `from` is unset or equals the actual status
pub fn rewritten_status(actual: u16, from: Option<u16>, to: u16) -> u16 {
    match from {
        Some(expected) if expected != actual => actual,
        _ => to,
    }
}

/// Request URL after map-remote
///
/// Scheme, host and port come from the destination. The destination path wins
/// unless it is `/`, and the destination query wins when present.
pub fn remap_url(destination: &Url, path_and_query: &str) -> Url {
    let (path, query) = match path_and_query.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path_and_query, None),
    };

    let mut url = destination.clone();
    if destination.path().is_empty() || destination.path() == "/" {
        url.set_path(if path.is_empty() { "/" } else { path });
    }
    if destination.query().is_none() {
        url.set_query(query);
    }
    url
}

/// Content type of a local response
pub fn local_content_type(body: &LocalBody, explicit: Option<&str>) -> String {
    if let Some(content_type) = explicit {
        return content_type.to_string();
    }
    match body {
        LocalBody::Text(_) => TEXT_CONTENT_TYPE.to_string(),
        LocalBody::File(path) => guess_content_type(path).to_string(),
    }
}

fn guess_content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "application/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "txt" | "log" => TEXT_CONTENT_TYPE,
        "csv" => "text/csv",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "pdf" => "application/pdf",
        "wasm" => "application/wasm",
        "mp4" => "video/mp4",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
}

fn default_status() -> u16 {
    200
}

/// Serialized rule, used by settings files and rule dumps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RuleSpec {
    Allow {
        matcher: String,
    },
    MapLocalFile {
        matcher: String,
        path: PathBuf,
        #[serde(default = "default_status")]
        status: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content_type: Option<String>,
    },
    MapLocalText {
        matcher: String,
        text: String,
        #[serde(default = "default_status")]
        status: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content_type: Option<String>,
    },
    MapRemote {
        matcher: String,
        destination: String,
    },
    StatusRewrite {
        matcher: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<u16>,
        to: u16,
    },
}

impl RuleSpec {
    pub fn matcher(&self) -> &str {
        match self {
            RuleSpec::Allow { matcher }
            | RuleSpec::MapLocalFile { matcher, .. }
            | RuleSpec::MapLocalText { matcher, .. }
            | RuleSpec::MapRemote { matcher, .. }
            | RuleSpec::StatusRewrite { matcher, .. } => matcher,
        }
    }
}
