//! Compiled route table and request matching.

use http::Method;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use tracing::debug;

use relay_config::EndpointRoute;
use relay_core::RouteId;

use crate::pattern::PathPattern;

/// Errors raised while compiling a route table from configuration.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    /// A route's pattern did not compile.
    #[error("route {route}: invalid pattern {pattern:?}: {message}")]
    InvalidPattern {
        /// Offending route id.
        route: String,
        /// Pattern text.
        pattern: String,
        /// Compiler diagnostic.
        message: String,
    },

    /// A route's method list contains an unparseable method.
    #[error("route {route}: invalid method {method:?}")]
    InvalidMethod {
        /// Offending route id.
        route: String,
        /// Method text.
        method: String,
    },
}

/// A route with its matchers precompiled.
#[derive(Debug, Clone)]
pub struct CompiledRoute {
    id: RouteId,
    pattern: PathPattern,
    methods: Vec<Method>,
    definition: EndpointRoute,
}

impl CompiledRoute {
    /// Route identifier.
    #[must_use]
    pub fn id(&self) -> &RouteId {
        &self.id
    }

    /// The full route definition from configuration.
    #[must_use]
    pub fn definition(&self) -> &EndpointRoute {
        &self.definition
    }

    /// Whether this route accepts `method` on `path`.
    #[must_use]
    pub fn accepts(&self, method: &Method, path: &str) -> bool {
        let method_ok = self.methods.is_empty() || self.methods.contains(method);
        method_ok && self.pattern.matches(path)
    }
}

/// Immutable, precompiled route table for one configuration snapshot.
#[derive(Debug, Clone)]
pub struct RouteTable {
    // Sorted by descending priority at build time.
    routes: Vec<CompiledRoute>,
}

impl RouteTable {
    /// Compiles a table from route definitions.
    pub fn build(definitions: &[EndpointRoute]) -> Result<Self, RoutingError> {
        let mut routes = Vec::with_capacity(definitions.len());
        for def in definitions {
            let pattern = PathPattern::compile(&def.pattern).map_err(|message| {
                RoutingError::InvalidPattern {
                    route: def.id.clone(),
                    pattern: def.pattern.clone(),
                    message,
                }
            })?;

            let mut methods = Vec::with_capacity(def.methods.len());
            for m in &def.methods {
                let parsed = Method::from_bytes(m.as_bytes()).map_err(|_| {
                    RoutingError::InvalidMethod {
                        route: def.id.clone(),
                        method: m.clone(),
                    }
                })?;
                methods.push(parsed);
            }

            routes.push(CompiledRoute {
                id: RouteId::new(def.id.clone()),
                pattern,
                methods,
                definition: def.clone(),
            });
        }

        routes.sort_by(|a, b| b.definition.priority.cmp(&a.definition.priority));
        debug!(routes = routes.len(), "route table compiled");
        Ok(Self { routes })
    }

    /// Number of routes in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// All compiled routes, highest priority first.
    #[must_use]
    pub fn routes(&self) -> &[CompiledRoute] {
        &self.routes
    }

    /// Looks up a route by id.
    #[must_use]
    pub fn route(&self, id: &RouteId) -> Option<&CompiledRoute> {
        self.routes.iter().find(|r| r.id() == id)
    }

    /// Matches a request using thread-local randomness for weighted ties.
    #[must_use]
    pub fn select(&self, method: &Method, path: &str) -> Option<&CompiledRoute> {
        self.select_with(method, path, &mut rand::thread_rng())
    }

    /// Matches a request with an explicit RNG, used by tests to pin the
    /// weighted pick.
    ///
    /// All matching routes of the highest matching priority are candidates;
    /// one is drawn with probability proportional to its weight.
    #[must_use]
    pub fn select_with<R: Rng>(
        &self,
        method: &Method,
        path: &str,
        rng: &mut R,
    ) -> Option<&CompiledRoute> {
        let mut candidates: Vec<&CompiledRoute> = Vec::new();
        let mut best_priority = i32::MIN;

        // The table is priority-sorted, so matching stops once a lower
        // priority band begins after a match was found.
        for route in &self.routes {
            let priority = route.definition.priority;
            if !candidates.is_empty() && priority < best_priority {
                break;
            }
            if route.accepts(method, path) {
                best_priority = priority;
                candidates.push(route);
            }
        }

        match candidates.len() {
            0 => None,
            1 => Some(candidates[0]),
            _ => {
                let weights: Vec<u32> = candidates
                    .iter()
                    .map(|r| r.definition.weight.max(1))
                    .collect();
                // Weights are all >= 1, so the distribution always builds.
                let dist = WeightedIndex::new(&weights).ok()?;
                Some(candidates[dist.sample(rng)])
            }
        }
    }
}
