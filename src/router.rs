//! Path-prefix routing table
//!
//! Routes are evaluated in registration order and the first matching prefix
//! wins. Prefixes are mount points: `/mcp` matches `/mcp` and `/mcp/...` but
//! not `/mcpx`. The forwarded path is never rewritten.

use crate::config::{BackendConfig, BackendDefaults};
use crate::error::GatewayError;
use std::time::Duration;

/// A mapping from a path prefix to a backend port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Backend name, for logs
    pub name: String,
    /// Normalised mount point (no trailing slash unless it is `/`)
    pub path_prefix: String,
    pub target_port: u16,
    /// Tunnel Upgrade requests to the backend
    pub allow_websocket: bool,
    /// Max wait for backend response headers
    pub request_timeout: Duration,
}

impl Route {
    pub fn new(name: &str, path_prefix: &str, target_port: u16, allow_websocket: bool) -> Self {
        Self {
            name: name.to_string(),
            path_prefix: normalize_prefix(path_prefix),
            target_port,
            allow_websocket,
            request_timeout: Duration::from_secs(BackendDefaults::default().request_timeout_secs),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn from_backend(config: &BackendConfig, defaults: &BackendDefaults) -> Self {
        Self::new(&config.name, &config.path_prefix, config.port, config.websocket)
            .with_request_timeout(config.request_timeout(defaults))
    }

    /// Whether `path` falls under this route's mount point
    pub fn matches(&self, path: &str) -> bool {
        if self.path_prefix == "/" {
            return true;
        }
        match path.strip_prefix(self.path_prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Ordered, immutable-after-startup set of routes
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route; duplicate prefixes are rejected
    pub fn register(&mut self, route: Route) -> Result<(), GatewayError> {
        if let Some(existing) = self
            .routes
            .iter()
            .find(|r| r.path_prefix == route.path_prefix)
        {
            return Err(GatewayError::DuplicateRoute {
                prefix: route.path_prefix,
                existing: existing.name.clone(),
            });
        }
        self.routes.push(route);
        Ok(())
    }

    /// First registered route whose prefix matches `path`
    pub fn match_path(&self, path: &str) -> Option<&Route> {
        self.routes.iter().find(|r| r.matches(path))
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RouteTable {
        let mut table = RouteTable::new();
        table.register(Route::new("exa", "/mcp", 3001, true)).unwrap();
        table
            .register(Route::new("websets", "/websets", 3002, true))
            .unwrap();
        table
    }

    #[test]
    fn test_match_exact_and_nested() {
        let table = table();
        assert_eq!(table.match_path("/mcp").unwrap().target_port, 3001);
        assert_eq!(table.match_path("/mcp/").unwrap().target_port, 3001);
        assert_eq!(table.match_path("/websets/sse").unwrap().target_port, 3002);
        assert_eq!(table.match_path("/websets/mcp").unwrap().target_port, 3002);
    }

    #[test]
    fn test_disjoint_routes_never_cross() {
        let table = table();
        for path in ["/mcp", "/mcp/a/b", "/mcp/websets"] {
            assert_eq!(table.match_path(path).unwrap().name, "exa", "{}", path);
        }
        for path in ["/websets", "/websets/mcp", "/websets/x/mcp"] {
            assert_eq!(table.match_path(path).unwrap().name, "websets", "{}", path);
        }
    }

    #[test]
    fn test_segment_boundary() {
        let table = table();
        assert!(table.match_path("/mcpx").is_none());
        assert!(table.match_path("/websetsfoo/sse").is_none());
        assert!(table.match_path("/").is_none());
        assert!(table.match_path("/other").is_none());
    }

    #[test]
    fn test_first_registration_wins() {
        let mut table = RouteTable::new();
        table.register(Route::new("root", "/", 4000, false)).unwrap();
        table.register(Route::new("api", "/api", 4001, false)).unwrap();

        // `/` swallows everything when registered first
        assert_eq!(table.match_path("/api/users").unwrap().name, "root");

        let mut table = RouteTable::new();
        table.register(Route::new("api", "/api", 4001, false)).unwrap();
        table.register(Route::new("root", "/", 4000, false)).unwrap();
        assert_eq!(table.match_path("/api/users").unwrap().name, "api");
        assert_eq!(table.match_path("/index.html").unwrap().name, "root");
    }

    #[test]
    fn test_overlapping_prefixes_in_order() {
        let mut table = RouteTable::new();
        table.register(Route::new("outer", "/a", 4000, false)).unwrap();
        table.register(Route::new("inner", "/a/b", 4001, false)).unwrap();
        assert_eq!(table.match_path("/a/b/c").unwrap().name, "outer");
    }

    #[test]
    fn test_duplicate_prefix_rejected() {
        let mut table = table();
        let err = table
            .register(Route::new("other", "/mcp/", 5000, false))
            .unwrap_err();
        assert!(matches!(err, GatewayError::DuplicateRoute { ref existing, .. } if existing == "exa"));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_prefix_normalisation() {
        assert_eq!(Route::new("a", "/mcp/", 1, true).path_prefix, "/mcp");
        assert_eq!(Route::new("a", "/", 1, true).path_prefix, "/");
        assert_eq!(Route::new("a", "//", 1, true).path_prefix, "/");
    }

    #[test]
    fn test_from_backend() {
        let mut backend = BackendConfig::new("exa", "node", 3001, "/mcp");
        backend.websocket = false;
        backend.request_timeout_secs = Some(5);
        let route = Route::from_backend(&backend, &BackendDefaults::default());
        assert_eq!(
            route,
            Route::new("exa", "/mcp", 3001, false).with_request_timeout(Duration::from_secs(5))
        );
    }
}
