//! Per-request glue between the matcher and the resolver.

use crate::config::{ConfigError, RuleDefinition, StubServerConfig};
use crate::matcher::{Matcher, RequestContext};
use crate::proxy::{Forwarder, HttpForwarder};
use crate::resolver::{no_match_response, ResponseDescriptor, ResponseResolver};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Stub request handler
///
/// Owns the loaded rules and everything derived from them. Nothing in here
/// changes after construction, so one instance is shared by every
/// connection of a server.
pub struct StubHandler {
    config: StubServerConfig,
    matcher: Matcher,
    resolver: ResponseResolver,
}

impl StubHandler {
    /// Create a handler that proxies through a plain HTTP client.
    pub fn new(config: StubServerConfig) -> Result<Self, ConfigError> {
        let timeout = Duration::from_millis(config.settings.proxy_timeout_ms);
        Self::with_forwarder(config, Arc::new(HttpForwarder::new(timeout)))
    }

    /// Create a handler with a custom upstream forwarder.
    pub fn with_forwarder(
        config: StubServerConfig,
        forwarder: Arc<dyn Forwarder>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let matcher = Matcher::new(&config.rules)?;

        info!(rules = config.rules.len(), "Stub handler initialized");

        Ok(Self {
            config,
            matcher,
            resolver: ResponseResolver::new(forwarder),
        })
    }

    pub fn rules(&self) -> &[RuleDefinition] {
        &self.config.rules
    }

    /// Answer one request: first matching rule, or the no-match response.
    /// Resolve failures become error responses; this never fails.
    pub async fn handle(&self, ctx: &RequestContext) -> ResponseDescriptor {
        let settings = &self.config.settings;

        let Some(result) = self.matcher.find_match(ctx) else {
            if settings.log_unmatched {
                warn!(
                    method = %ctx.method(),
                    path = %ctx.path(),
                    "No matching rule found"
                );
            }
            return no_match_response();
        };

        let rule = result.rule.label(result.index);
        if settings.log_matches {
            info!(
                rule = %rule,
                method = %ctx.method(),
                path = %ctx.path(),
                "Request matched rule"
            );
        }

        match self.resolver.resolve(&result.rule.response, ctx).await {
            Ok(response) => {
                debug!(rule = %rule, status = %response.status, "Resolved response");
                response
            }
            Err(e) => {
                warn!(rule = %rule, error = %e, "Failed to resolve response");
                e.to_response()
            }
        }
    }
}
