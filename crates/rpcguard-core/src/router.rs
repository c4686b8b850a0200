//! Method router — fans a call out to every interceptor whose pattern matches.
//!
//! Patterns are compiled once into three immutable partitions:
//!
//! ```text
//! "*"               → global
//! "billing.Ledger/*"   → by_service["billing.Ledger"]
//! "billing.Ledger/Get" → exact["billing.Ledger/Get"]
//! ```
//!
//! A call to `S/M` runs `global ++ by_service[S] ++ exact["S/M"]`, in that
//! order. All matching partitions fire; this is not first-match-wins.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::chain::{compose, Interceptor, SharedInterceptor};
use crate::envelope::{CallEnvelope, Payload};
use crate::error::{CallError, ConfigError};
use crate::handler::{CallHandler, Handler};

/// A parsed route pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoutePattern {
    /// `*`
    Global,
    /// `<service>/*`
    Service(String),
    /// `<service>/<method>`
    Exact { service: String, method: String },
}

fn check_name(pattern: &str, part: &str, what: &str) -> Result<(), ConfigError> {
    let reason = if part.is_empty() {
        format!("{what} name is empty")
    } else if part.contains('*') {
        format!("{what} name `{part}` contains a wildcard")
    } else if part.chars().any(char::is_whitespace) {
        format!("{what} name `{part}` contains whitespace")
    } else {
        return Ok(());
    };
    Err(ConfigError::InvalidPattern {
        pattern: pattern.to_string(),
        reason,
    })
}

impl FromStr for RoutePattern {
    type Err = ConfigError;

    fn from_str(pattern: &str) -> Result<Self, Self::Err> {
        if pattern == "*" {
            return Ok(Self::Global);
        }
        let Some((service, method)) = pattern.split_once('/') else {
            return Err(ConfigError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "expected `*`, `<service>/*` or `<service>/<method>`".into(),
            });
        };
        check_name(pattern, service, "service")?;
        if method.contains('/') {
            return Err(ConfigError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "more than one `/` separator".into(),
            });
        }
        if method == "*" {
            return Ok(Self::Service(service.to_string()));
        }
        check_name(pattern, method, "method")?;
        Ok(Self::Exact {
            service: service.to_string(),
            method: method.to_string(),
        })
    }
}

impl std::fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Global => write!(f, "*"),
            Self::Service(service) => write!(f, "{service}/*"),
            Self::Exact { service, method } => write!(f, "{service}/{method}"),
        }
    }
}

#[derive(Default)]
struct RouteTable {
    global: Vec<SharedInterceptor>,
    by_service: HashMap<String, Vec<SharedInterceptor>>,
    exact: HashMap<String, Vec<SharedInterceptor>>,
}

impl RouteTable {
    fn matched(&self, service: &str, method: &str) -> Vec<SharedInterceptor> {
        let mut matched = self.global.clone();
        if let Some(list) = self.by_service.get(service) {
            matched.extend(list.iter().cloned());
        }
        if !self.exact.is_empty() {
            if let Some(list) = self.exact.get(&format!("{service}/{method}")) {
                matched.extend(list.iter().cloned());
            }
        }
        matched
    }
}

/// Interceptor dispatching each call through the interceptors its
/// service/method identity selects.
#[derive(Clone)]
pub struct MethodRouter {
    table: Arc<RouteTable>,
}

impl MethodRouter {
    /// Build a router from `(pattern, interceptors)` pairs.
    ///
    /// Fails on the first malformed pattern. Repeated patterns append to the
    /// same partition entry in the order given.
    pub fn new<I, P>(routes: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (P, Vec<SharedInterceptor>)>,
        P: AsRef<str>,
    {
        let mut table = RouteTable::default();
        for (pattern, interceptors) in routes {
            match pattern.as_ref().parse::<RoutePattern>()? {
                RoutePattern::Global => table.global.extend(interceptors),
                RoutePattern::Service(service) => {
                    table.by_service.entry(service).or_default().extend(interceptors)
                }
                RoutePattern::Exact { service, method } => table
                    .exact
                    .entry(format!("{service}/{method}"))
                    .or_default()
                    .extend(interceptors),
            }
        }
        tracing::debug!(
            global = table.global.len(),
            services = table.by_service.len(),
            methods = table.exact.len(),
            "method router built"
        );
        Ok(Self {
            table: Arc::new(table),
        })
    }

    /// Interceptors that apply to `service/method`, outermost first.
    pub fn matched(&self, service: &str, method: &str) -> Vec<SharedInterceptor> {
        self.table.matched(service, method)
    }

    /// Route table summary as `(pattern, interceptor names)`, sorted by pattern.
    pub fn describe(&self) -> Vec<(String, Vec<String>)> {
        fn names(list: &[SharedInterceptor]) -> Vec<String> {
            list.iter().map(|i| i.name().to_string()).collect()
        }
        let mut rows = Vec::new();
        if !self.table.global.is_empty() {
            rows.push(("*".to_string(), names(&self.table.global)));
        }
        let mut services: Vec<_> = self.table.by_service.iter().collect();
        services.sort_by(|a, b| a.0.cmp(b.0));
        rows.extend(services.into_iter().map(|(s, l)| (format!("{s}/*"), names(l))));
        let mut exact: Vec<_> = self.table.exact.iter().collect();
        exact.sort_by(|a, b| a.0.cmp(b.0));
        rows.extend(exact.into_iter().map(|(k, l)| (k.clone(), names(l))));
        rows
    }
}

impl Interceptor for MethodRouter {
    fn name(&self) -> &str {
        "router"
    }

    fn intercept(&self, next: Handler) -> Handler {
        Arc::new(RouterHandler {
            table: self.table.clone(),
            next,
        })
    }
}

struct RouterHandler {
    table: Arc<RouteTable>,
    next: Handler,
}

#[async_trait]
impl CallHandler for RouterHandler {
    async fn call(&self, call: CallEnvelope) -> Result<Payload, CallError> {
        let matched = self.table.matched(&call.service, &call.method);
        if matched.is_empty() {
            return self.next.call(call).await;
        }
        compose(&matched, self.next.clone()).call(call).await
    }
}
