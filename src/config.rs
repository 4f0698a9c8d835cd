//! Configuration for the stub server.
//!
//! Defines the ordered rule list (request matchers plus response
//! definitions) and global settings. Everything is validated once at load
//! time; a document that fails validation never produces a config.

use hyper::header::{HeaderName, HeaderValue};
use hyper::{HeaderMap, Method, StatusCode, Uri};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while loading or validating a configuration document.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("rule {rule}: {reason}")]
    InvalidRule { rule: String, reason: String },
}

/// Main configuration for the stub server.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct StubServerConfig {
    /// Rules in priority order (first match wins)
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,

    /// Global settings
    #[serde(default)]
    pub settings: GlobalSettings,
}

impl StubServerConfig {
    /// Load configuration from a file. `.json` files are parsed as JSON,
    /// everything else as YAML.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_yaml_str(&content)
        }
    }

    /// Parse and validate a YAML document.
    ///
    /// The document is either a mapping with `rules`/`settings` or a bare
    /// list of rules.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let value: serde_yaml::Value = serde_yaml::from_str(yaml)?;
        let value = match value {
            serde_yaml::Value::Sequence(rules) => {
                let mut document = serde_yaml::Mapping::new();
                document.insert("rules".into(), serde_yaml::Value::Sequence(rules));
                serde_yaml::Value::Mapping(document)
            }
            serde_yaml::Value::Null => serde_yaml::Value::Mapping(serde_yaml::Mapping::new()),
            other => other,
        };
        let config: Self = serde_yaml::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON document (mapping or bare array of rules).
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        let value = match value {
            serde_json::Value::Array(rules) => serde_json::json!({ "rules": rules }),
            other => other,
        };
        let config: Self = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (i, rule) in self.rules.iter().enumerate() {
            rule.validate().map_err(|reason| ConfigError::InvalidRule {
                rule: rule.label(i),
                reason,
            })?;
        }
        Ok(())
    }
}

/// A single rule: a request predicate paired with a response.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleDefinition {
    /// Optional identifier, used in logs
    #[serde(default)]
    pub id: Option<String>,

    /// Optional free-form description
    #[serde(default)]
    pub description: Option<String>,

    /// Request matcher (omitted = match everything)
    #[serde(default)]
    pub request: RequestMatcher,

    /// Response to return
    pub response: ResponseDefinition,
}

impl RuleDefinition {
    /// Human readable label for diagnostics: the id, the description, or the
    /// position in the rule list.
    pub fn label(&self, index: usize) -> String {
        self.id
            .clone()
            .or_else(|| self.description.clone())
            .unwrap_or_else(|| format!("#{}", index))
    }

    fn validate(&self) -> Result<(), String> {
        self.request.validate()?;
        self.response.validate()
    }
}

/// Request matching configuration. Every field is optional; an absent field
/// matches any request.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RequestMatcher {
    /// HTTP method (case-insensitive)
    #[serde(default)]
    pub method: Option<String>,

    /// Exact request path
    #[serde(default, alias = "path")]
    pub uri: Option<String>,

    /// Required headers and their exact values
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Required query parameters and their exact values
    #[serde(default, alias = "query")]
    pub queries: HashMap<String, String>,

    /// Exact request body text
    #[serde(default)]
    pub text: Option<String>,

    /// Request body must equal the contents of this file
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// XPath expression evaluated against an XML body
    #[serde(default)]
    pub xpath: Option<XPathMatcher>,
}

impl RequestMatcher {
    /// Validate the request matcher.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(method) = &self.method {
            Method::from_bytes(method.as_bytes())
                .map_err(|_| format!("invalid method: {:?}", method))?;
        }

        if let Some(uri) = &self.uri {
            if !uri.starts_with('/') {
                return Err(format!("uri must start with '/': {:?}", uri));
            }
        }

        for name in self.headers.keys() {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| format!("invalid header name: {:?}", name))?;
        }

        if let Some(file) = &self.file {
            if !file.is_file() {
                return Err(format!("request file not found: {}", file.display()));
            }
        }

        if let Some(xpath) = &self.xpath {
            xpath.validate()?;
        }

        Ok(())
    }
}

/// XPath body matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct XPathMatcher {
    /// XPath 1.0 expression
    pub expression: String,
    /// Expected textual result
    pub value: String,
}

impl XPathMatcher {
    fn validate(&self) -> Result<(), String> {
        // Evaluating against an empty document surfaces syntax errors
        // without needing a request body.
        let package = sxd_document::Package::new();
        let document = package.as_document();
        sxd_xpath::evaluate_xpath(&document, &self.expression)
            .map(|_| ())
            .map_err(|e| format!("invalid xpath {:?}: {}", self.expression, e))
    }
}

/// Response definition: exactly one body source plus optional overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawResponseDefinition")]
pub struct ResponseDefinition {
    /// Body source
    pub body: ResponseBody,

    /// Status override
    pub status: Option<StatusCode>,

    /// Headers laid over the computed defaults
    pub headers: HeaderMap,
}

impl ResponseDefinition {
    /// Validate the response definition.
    pub fn validate(&self) -> Result<(), String> {
        if let ResponseBody::File(path) = &self.body {
            if !path.is_file() {
                return Err(format!("response file not found: {}", path.display()));
            }
        }
        Ok(())
    }
}

/// Response body source.
#[derive(Debug, Clone)]
pub enum ResponseBody {
    /// Literal text
    Text(String),
    /// File read fresh for every request
    File(PathBuf),
    /// Forward the request upstream and relay the reply
    Proxy(ProxyTarget),
}

impl ResponseBody {
    /// Get content type for this body. Proxied responses carry the
    /// upstream's own headers.
    pub fn content_type(&self) -> Option<&'static str> {
        match self {
            ResponseBody::Text(_) => Some("text/plain; charset=utf-8"),
            ResponseBody::File(_) => Some("application/octet-stream"),
            ResponseBody::Proxy(_) => None,
        }
    }
}

/// Upstream target of a proxy response.
#[derive(Debug, Clone)]
pub struct ProxyTarget {
    pub url: Uri,
}

/// Wire shape of a response definition before validation.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawResponseDefinition {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    file: Option<PathBuf>,
    #[serde(default)]
    proxy: Option<RawProxy>,
    #[serde(default)]
    status: Option<u16>,
    #[serde(default)]
    headers: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawProxy {
    url: String,
}

impl TryFrom<RawResponseDefinition> for ResponseDefinition {
    type Error = String;

    fn try_from(raw: RawResponseDefinition) -> Result<Self, Self::Error> {
        let body = match (raw.text, raw.file, raw.proxy) {
            (Some(text), None, None) => ResponseBody::Text(text),
            (None, Some(file), None) => ResponseBody::File(file),
            (None, None, Some(proxy)) => ResponseBody::Proxy(parse_proxy_target(&proxy.url)?),
            (None, None, None) => {
                return Err("response needs one of `text`, `file` or `proxy`".to_string())
            }
            _ => {
                return Err(
                    "response must have only one of `text`, `file` or `proxy`".to_string(),
                )
            }
        };

        let status = raw
            .status
            .map(|code| {
                StatusCode::from_u16(code)
                    .ok()
                    .filter(|_| (100..=599).contains(&code))
                    .ok_or_else(|| format!("invalid status code: {}", code))
            })
            .transpose()?;

        let mut headers = HeaderMap::with_capacity(raw.headers.len());
        for (name, value) in &raw.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| format!("invalid response header name: {:?}", name))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| format!("invalid value for response header {}: {:?}", name, value))?;
            headers.insert(name, value);
        }

        Ok(Self {
            body,
            status,
            headers,
        })
    }
}

fn parse_proxy_target(url: &str) -> Result<ProxyTarget, String> {
    let uri: Uri = url
        .parse()
        .map_err(|e| format!("invalid proxy url {:?}: {}", url, e))?;

    match uri.scheme_str() {
        Some("http") => {}
        Some(other) => {
            return Err(format!(
                "unsupported proxy url scheme {:?} (only http is supported)",
                other
            ))
        }
        None => return Err(format!("proxy url must be absolute: {:?}", url)),
    }

    if uri.authority().is_none() {
        return Err(format!("proxy url has no host: {:?}", url));
    }

    Ok(ProxyTarget { url: uri })
}

/// Global settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalSettings {
    /// Log all matched rules
    #[serde(default = "default_true")]
    pub log_matches: bool,

    /// Log unmatched requests
    #[serde(default = "default_true")]
    pub log_unmatched: bool,

    /// Upper bound for a proxied exchange, in milliseconds
    #[serde(default = "default_proxy_timeout_ms")]
    pub proxy_timeout_ms: u64,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            log_matches: true,
            log_unmatched: true,
            proxy_timeout_ms: default_proxy_timeout_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_proxy_timeout_ms() -> u64 {
    5_000
}
