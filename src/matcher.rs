//! Request matching logic.
//!
//! Matches incoming requests against rule definitions. Each rule's request
//! section is compiled into a list of predicates that must all hold; rules
//! are tried in declaration order and the first match wins.

use crate::config::{ConfigError, RequestMatcher, RuleDefinition};
use bytes::Bytes;
use hyper::{HeaderMap, Method, Uri};
use std::collections::HashMap;

/// Immutable snapshot of one decoded request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    method: Method,
    path: String,
    headers: HeaderMap,
    query: HashMap<String, Vec<String>>,
    body: Bytes,
}

impl RequestContext {
    /// Build a context from the decoded request parts.
    pub fn new(method: Method, uri: &Uri, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            method,
            path: decode_path(uri.path()),
            headers,
            query: parse_query_string(uri.query().unwrap_or("")),
            body,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// All values of a query parameter, in request order.
    pub fn query_values(&self, name: &str) -> &[String] {
        self.query.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Body decoded as UTF-8, if it is valid UTF-8.
    pub fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

/// One request dimension a rule can constrain.
#[derive(Debug, Clone)]
enum Predicate {
    Method(String),
    Path(String),
    Header { name: String, value: String },
    Query { name: String, value: String },
    Text(String),
    Body(Bytes),
    XPath { expression: String, value: String },
}

impl Predicate {
    fn matches(&self, ctx: &RequestContext) -> bool {
        match self {
            Predicate::Method(method) => ctx.method.as_str().eq_ignore_ascii_case(method),
            Predicate::Path(path) => ctx.path == *path,
            // HeaderMap lookups are case-insensitive on the name
            Predicate::Header { name, value } => ctx
                .headers
                .get_all(name.as_str())
                .iter()
                .any(|v| v.as_bytes() == value.as_bytes()),
            Predicate::Query { name, value } => {
                ctx.query_values(name).iter().any(|v| v == value)
            }
            Predicate::Text(text) => ctx.body_text() == Some(text.as_str()),
            Predicate::Body(expected) => ctx.body == *expected,
            Predicate::XPath { expression, value } => ctx
                .body_text()
                .and_then(|body| extract_xpath(body, expression))
                .map(|actual| actual == *value)
                .unwrap_or(false),
        }
    }
}

/// Composite AND over the predicates of one rule.
#[derive(Debug, Clone, Default)]
pub struct CompiledMatcher {
    predicates: Vec<Predicate>,
}

impl CompiledMatcher {
    /// Compile a request matcher. Body files are read here, once.
    pub fn compile(matcher: &RequestMatcher) -> std::io::Result<Self> {
        let mut predicates = Vec::new();

        // Cheap checks first; the result does not depend on the order.
        if let Some(method) = &matcher.method {
            predicates.push(Predicate::Method(method.clone()));
        }
        if let Some(uri) = &matcher.uri {
            predicates.push(Predicate::Path(uri.clone()));
        }
        for (name, value) in &matcher.headers {
            predicates.push(Predicate::Header {
                name: name.to_ascii_lowercase(),
                value: value.clone(),
            });
        }
        for (name, value) in &matcher.queries {
            predicates.push(Predicate::Query {
                name: name.clone(),
                value: value.clone(),
            });
        }
        if let Some(text) = &matcher.text {
            predicates.push(Predicate::Text(text.clone()));
        }
        if let Some(file) = &matcher.file {
            predicates.push(Predicate::Body(Bytes::from(std::fs::read(file)?)));
        }
        if let Some(xpath) = &matcher.xpath {
            predicates.push(Predicate::XPath {
                expression: xpath.expression.clone(),
                value: xpath.value.clone(),
            });
        }

        Ok(Self { predicates })
    }

    /// True iff every predicate holds (vacuously true when there are none).
    pub fn matches(&self, ctx: &RequestContext) -> bool {
        self.predicates.iter().all(|p| p.matches(ctx))
    }
}

/// Result of matching a request against the rule list.
#[derive(Debug)]
pub struct MatchResult<'a> {
    /// Position of the rule in the configuration
    pub index: usize,
    /// The matched rule
    pub rule: &'a RuleDefinition,
}

/// Rule match index: each rule paired with its compiled matcher, in
/// declaration order.
#[derive(Debug, Clone, Default)]
pub struct Matcher {
    entries: Vec<(CompiledMatcher, RuleDefinition)>,
}

impl Matcher {
    /// Create a new matcher from rule definitions.
    pub fn new(rules: &[RuleDefinition]) -> Result<Self, ConfigError> {
        let entries = rules
            .iter()
            .enumerate()
            .map(|(i, rule)| {
                CompiledMatcher::compile(&rule.request)
                    .map(|matcher| (matcher, rule.clone()))
                    .map_err(|e| ConfigError::InvalidRule {
                        rule: rule.label(i),
                        reason: format!("cannot read request file: {}", e),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { entries })
    }

    /// Rules in declaration order.
    pub fn rules(&self) -> impl ExactSizeIterator<Item = &RuleDefinition> {
        self.entries.iter().map(|(_, rule)| rule)
    }

    /// Find the first matching rule for a request.
    pub fn find_match(&self, ctx: &RequestContext) -> Option<MatchResult<'_>> {
        self.entries
            .iter()
            .enumerate()
            .find(|(_, (matcher, _))| matcher.matches(ctx))
            .map(|(index, (_, rule))| MatchResult { index, rule })
    }
}

/// Evaluate an XPath expression against an XML document and render the
/// result as text. `None` when the body is not XML, the expression fails,
/// or a node-set comes back empty.
pub fn extract_xpath(body: &str, expression: &str) -> Option<String> {
    use sxd_document::parser;
    use sxd_xpath::{evaluate_xpath, Value};

    let package = parser::parse(body).ok()?;
    let document = package.as_document();

    match evaluate_xpath(&document, expression).ok()? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(format_number(n)),
        Value::Boolean(b) => Some(b.to_string()),
        Value::Nodeset(nodes) => nodes.document_order_first().map(|node| node.string_value()),
    }
}

/// XPath `string()` spelling of a number. Integers beyond 2^53 are not
/// exact in an f64 and keep the float rendering.
fn format_number(n: f64) -> String {
    const MAX_EXACT: f64 = 9_007_199_254_740_992.0;

    if n.is_nan() {
        "NaN".to_string()
    } else if n == f64::INFINITY {
        "Infinity".to_string()
    } else if n == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else if n.fract() == 0.0 && n.abs() < MAX_EXACT {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// Percent-decode a request path; invalid UTF-8 keeps the raw path.
fn decode_path(path: &str) -> String {
    urlencoding::decode(path)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| path.to_string())
}

/// Parse a query string into a multimap of decoded names and values.
fn parse_query_string(query: &str) -> HashMap<String, Vec<String>> {
    let mut params: HashMap<String, Vec<String>> = HashMap::new();
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        params
            .entry(key.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StubServerConfig;
    use hyper::header::HeaderValue;

    const FOO_XML: &str = "<request><parameters><id>1</id></parameters></request>";
    const BAR_XML: &str = "<request><parameters><id>2</id></parameters></request>";

    fn request(method: Method, uri: &str) -> RequestContext {
        RequestContext::new(method, &uri.parse().unwrap(), HeaderMap::new(), Bytes::new())
    }

    fn request_with_body(method: Method, uri: &str, body: &str) -> RequestContext {
        RequestContext::new(
            method,
            &uri.parse().unwrap(),
            HeaderMap::new(),
            Bytes::from(body.to_string()),
        )
    }

    fn request_with_header(uri: &str, name: &'static str, value: &str) -> RequestContext {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_str(value).unwrap());
        RequestContext::new(Method::GET, &uri.parse().unwrap(), headers, Bytes::new())
    }

    fn load(yaml: &str) -> Matcher {
        let config = StubServerConfig::from_yaml_str(yaml).unwrap();
        Matcher::new(&config.rules).unwrap()
    }

    fn matched_index(yaml: &str, ctx: &RequestContext) -> Option<usize> {
        load(yaml).find_match(ctx).map(|m| m.index)
    }

    #[test]
    fn test_method_matching() {
        let yaml = r#"
- request: { method: get, uri: /get }
  response: { text: response_for_get_method }
"#;
        assert_eq!(matched_index(yaml, &request(Method::GET, "/get")), Some(0));
        assert_eq!(matched_index(yaml, &request(Method::POST, "/get")), None);
    }

    #[test]
    fn test_exact_path_matching() {
        let yaml = r#"
- request: { uri: /api/users }
  response: { text: users }
"#;
        assert!(matched_index(yaml, &request(Method::GET, "/api/users")).is_some());
        assert!(matched_index(yaml, &request(Method::GET, "/api/users/")).is_none());
        assert!(matched_index(yaml, &request(Method::GET, "/api")).is_none());
    }

    #[test]
    fn test_path_is_percent_decoded() {
        let yaml = r#"
- request: { uri: "/a b" }
  response: { text: spaced }
"#;
        let ctx = request(Method::GET, "/a%20b");
        assert_eq!(ctx.path(), "/a b");
        assert_eq!(matched_index(yaml, &ctx), Some(0));

        // Not valid UTF-8 once decoded; compared as sent
        let ctx = request(Method::GET, "/bad%FF");
        assert_eq!(ctx.path(), "/bad%FF");
    }

    #[test]
    fn test_query_matching() {
        let yaml = r#"
- request:
    uri: /query
    queries: { param: foo }
  response: { text: response_for_query_request }
"#;
        assert!(matched_index(yaml, &request(Method::GET, "/query?param=foo")).is_some());
        assert!(matched_index(yaml, &request(Method::GET, "/query?other=1&param=foo")).is_some());
        assert!(matched_index(yaml, &request(Method::GET, "/query?param=foo2")).is_none());
        assert!(matched_index(yaml, &request(Method::GET, "/query?param2=foo")).is_none());
        assert!(matched_index(yaml, &request(Method::GET, "/query")).is_none());
    }

    #[test]
    fn test_query_values_are_decoded() {
        let ctx = request(Method::GET, "/search?name=John%20Doe&tag=a&tag=b");
        assert_eq!(ctx.query_values("name"), ["John Doe".to_string()]);
        assert_eq!(ctx.query_values("tag"), ["a".to_string(), "b".to_string()]);
        assert!(ctx.query_values("missing").is_empty());
    }

    #[test]
    fn test_header_matching() {
        let yaml = r#"
- request:
    uri: /header
    headers: { Content-Type: application/json }
  response: { text: response_for_header_request }
"#;
        let ctx = request_with_header("/header", "content-type", "application/json");
        assert!(matched_index(yaml, &ctx).is_some());

        let ctx = request_with_header("/header", "content-type", "application/xml");
        assert!(matched_index(yaml, &ctx).is_none());

        assert!(matched_index(yaml, &request(Method::GET, "/header")).is_none());
    }

    #[test]
    fn test_text_body_matching() {
        let yaml = r#"
- request: { text: text_request }
  response: { text: response_for_text_request }
"#;
        let ctx = request_with_body(Method::POST, "/", "text_request");
        assert!(matched_index(yaml, &ctx).is_some());

        let ctx = request_with_body(Method::POST, "/", "text_request ");
        assert!(matched_index(yaml, &ctx).is_none());

        let invalid_utf8 = RequestContext::new(
            Method::POST,
            &"/".parse().unwrap(),
            HeaderMap::new(),
            Bytes::from_static(&[0xff, 0xfe]),
        );
        assert!(matched_index(yaml, &invalid_utf8).is_none());
    }

    #[test]
    fn test_file_body_matching() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "foo.request").unwrap();
        let yaml = format!(
            "- request: {{ file: \"{}\" }}\n  response: {{ text: response_for_file_request }}\n",
            file.path().display()
        );

        let ctx = request_with_body(Method::POST, "/", "foo.request");
        assert!(matched_index(&yaml, &ctx).is_some());

        let ctx = request_with_body(Method::POST, "/", "bar.request");
        assert!(matched_index(&yaml, &ctx).is_none());
    }

    #[test]
    fn test_xpath_matching() {
        let yaml = r#"
- request:
    uri: /xpath
    xpath:
      expression: /request/parameters/id/text()
      value: "1"
  response: { text: response_for_xpath_request }
"#;
        let ctx = request_with_body(Method::POST, "/xpath", FOO_XML);
        assert!(matched_index(yaml, &ctx).is_some());

        let ctx = request_with_body(Method::POST, "/xpath", BAR_XML);
        assert!(matched_index(yaml, &ctx).is_none());

        let ctx = request_with_body(Method::POST, "/xpath", "this is <not xml");
        assert!(matched_index(yaml, &ctx).is_none());

        assert!(matched_index(yaml, &request(Method::POST, "/xpath")).is_none());
    }

    #[test]
    fn test_extract_xpath_values() {
        assert_eq!(
            extract_xpath(FOO_XML, "/request/parameters/id/text()").as_deref(),
            Some("1")
        );
        assert_eq!(extract_xpath(FOO_XML, "/request/parameters/id").as_deref(), Some("1"));
        assert_eq!(extract_xpath(FOO_XML, "count(//id)").as_deref(), Some("1"));
        assert_eq!(extract_xpath(FOO_XML, "1 div 2").as_deref(), Some("0.5"));
        assert_eq!(extract_xpath(FOO_XML, "//id = 1").as_deref(), Some("true"));
        assert_eq!(extract_xpath(FOO_XML, "/request/missing"), None);

        assert_eq!(
            extract_xpath(FOO_XML, "100000000000000000000").as_deref(),
            Some("100000000000000000000")
        );
        assert_eq!(
            extract_xpath(FOO_XML, "9007199254740991").as_deref(),
            Some("9007199254740991")
        );
        assert_eq!(extract_xpath(FOO_XML, "1 div 0").as_deref(), Some("Infinity"));
        assert_eq!(extract_xpath(FOO_XML, "-1 div 0").as_deref(), Some("-Infinity"));
        assert_eq!(extract_xpath(FOO_XML, "0 div 0").as_deref(), Some("NaN"));

        let many = "<a><b>first</b><b>second</b></a>";
        assert_eq!(extract_xpath(many, "//b").as_deref(), Some("first"));
    }

    #[test]
    fn test_first_match_wins() {
        let yaml = r#"
- id: broad
  request: { uri: /api/users }
  response: { text: broad }
- id: narrow
  request: { method: GET, uri: /api/users }
  response: { text: narrow }
"#;
        let matcher = load(yaml);
        let result = matcher.find_match(&request(Method::GET, "/api/users")).unwrap();
        assert_eq!(result.index, 0);
        assert_eq!(result.rule.id.as_deref(), Some("broad"));
    }

    #[test]
    fn test_match_result_carries_its_own_rule() {
        let matcher = load(
            r#"
- id: users
  request: { uri: /users }
  response: { text: users }
- id: orders
  request: { uri: /orders }
  response: { text: orders }
"#,
        );
        assert_eq!(matcher.rules().len(), 2);

        let result = matcher.find_match(&request(Method::GET, "/orders")).unwrap();
        assert_eq!(result.index, 1);
        assert_eq!(result.rule.id.as_deref(), Some("orders"));
    }

    #[test]
    fn test_falls_through_to_later_rules() {
        let yaml = r#"
- request: { uri: /xml, xpath: { expression: /a/text(), value: x } }
  response: { text: xml }
- request: { uri: /xml }
  response: { text: fallback }
"#;
        let ctx = request_with_body(Method::POST, "/xml", "not xml at all");
        assert_eq!(matched_index(yaml, &ctx), Some(1));

        let ctx = request_with_body(Method::POST, "/xml", "<a>x</a>");
        assert_eq!(matched_index(yaml, &ctx), Some(0));
    }

    #[test]
    fn test_empty_matcher_matches_everything() {
        let yaml = r#"
- response: { text: foo }
"#;
        assert_eq!(matched_index(yaml, &request(Method::DELETE, "/anything?x=1")), Some(0));
        assert_eq!(
            matched_index(yaml, &request_with_body(Method::PUT, "/", "payload")),
            Some(0)
        );
    }

    #[test]
    fn test_omitting_a_predicate_only_widens() {
        let narrow = r#"
- request: { method: GET, uri: /a, queries: { q: "1" } }
  response: { text: foo }
"#;
        let wide = r#"
- request: { method: GET, uri: /a }
  response: { text: foo }
"#;
        let requests = [
            request(Method::GET, "/a?q=1"),
            request(Method::GET, "/a?q=2"),
            request(Method::GET, "/a"),
            request(Method::POST, "/a?q=1"),
            request(Method::GET, "/b?q=1"),
        ];
        for ctx in &requests {
            if matched_index(narrow, ctx).is_some() {
                assert!(matched_index(wide, ctx).is_some(), "{:?}", ctx);
            }
        }
    }

    #[test]
    fn test_matching_is_repeatable() {
        let matcher = load(
            r#"
- request: { uri: /known }
  response: { text: foo }
"#,
        );
        let ctx = request(Method::GET, "/unknown");
        for _ in 0..3 {
            assert!(matcher.find_match(&ctx).is_none());
        }
    }
}
