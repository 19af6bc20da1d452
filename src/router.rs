//! Routing table: resolves a request URI to an upstream endpoint and its
//! compiled modifier program. Built once at startup, shared read-only.

use crate::config::{Config, MatchKind};
use crate::error::ProxyError;
use crate::modifier::{self, Modifier};
use regex::Regex;
use std::sync::Arc;
use url::Url;

#[derive(Debug)]
enum RouteRule {
    Exact(String),
    Prefix(String),
    Regex(Regex),
}

/// Everything a session needs about its selected upstream.
#[derive(Debug)]
pub struct RouteTarget {
    /// Upstream endpoint as a `ws://` or `wss://` URL.
    pub addr: String,
    /// Overrides the forwarded Host header when non-empty.
    pub host_override: String,
    /// Headers applied to the upgrade request with set semantics.
    pub headers: Vec<(String, String)>,
    /// Ordered frame modifiers for the client→upstream direction.
    pub modifiers: Vec<Modifier>,
}

struct RouteEntry {
    rules: Vec<RouteRule>,
    target: Arc<RouteTarget>,
}

pub struct Router {
    entries: Vec<RouteEntry>,
}

impl Router {
    /// Compiles the routing table. Route regexes, payload regexes and
    /// upstream addresses are all validated here so bad configuration is
    /// fatal at startup rather than at match time.
    pub fn from_config(config: &Config) -> Result<Router, ProxyError> {
        let mut entries = Vec::with_capacity(config.servers.len());
        for server in &config.servers {
            let mut rules = Vec::with_capacity(server.matcher.path.len());
            for rule in &server.matcher.path {
                rules.push(match rule.kind {
                    MatchKind::Exact => RouteRule::Exact(rule.value.clone()),
                    MatchKind::Prefix => RouteRule::Prefix(rule.value.clone()),
                    MatchKind::Regex => RouteRule::Regex(Regex::new(&rule.value)?),
                });
            }

            let upstream = &server.upstream;
            let addr = format!("{}://{}:{}", upstream.scheme, upstream.ip, upstream.port);
            let parsed = Url::parse(&addr)?;
            if parsed.host_str().is_none() {
                return Err(ProxyError::Config(format!(
                    "upstream address {addr} has no host"
                )));
            }

            let headers = upstream
                .overrides
                .headers
                .iter()
                .map(|h| (h.key.clone(), h.value.clone()))
                .collect();
            let modifiers = modifier::compile_program(&upstream.overrides.websocket_payload)?;

            entries.push(RouteEntry {
                rules,
                target: Arc::new(RouteTarget {
                    addr,
                    host_override: upstream.overrides.host.clone(),
                    headers,
                    modifiers,
                }),
            });
        }
        Ok(Router { entries })
    }

    /// Scans servers and rules in declaration order; the first match
    /// wins. A regex rule is terminal: the first one considered ends the
    /// whole scan with its match result as the answer, whether or not it
    /// matched.
    pub fn find(&self, uri: &str) -> Option<Arc<RouteTarget>> {
        for entry in &self.entries {
            for rule in &entry.rules {
                match rule {
                    RouteRule::Exact(value) if value == uri => {
                        return Some(Arc::clone(&entry.target));
                    }
                    RouteRule::Prefix(value) if uri.starts_with(value.as_str()) => {
                        return Some(Arc::clone(&entry.target));
                    }
                    RouteRule::Regex(regex) => {
                        return regex.is_match(uri).then(|| Arc::clone(&entry.target));
                    }
                    _ => {}
                }
            }
        }
        None
    }
}
