//! Subdomain route table.
//!
//! Maps `<session>--<port>.<base-domain>` hostnames to the upstream a
//! request should be forwarded to. Clusters register their containers with
//! declared ports (and host port mappings, when published); lookups resolve
//! to either the published host port on loopback or the container's network
//! alias on the session network.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;

use crate::error::{LabError, LabResult};

/// One container's routing data within a cluster.
#[derive(Debug, Clone)]
pub struct ClusterContainer {
    pub container_id: String,
    pub hostname: String,
    /// Declared container ports and, when published, their host ports.
    pub ports: HashMap<u16, Option<u16>>,
}

/// A registered route for one declared port.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteInfo {
    pub container_port: u16,
    pub url: String,
}

/// Where to forward a proxied request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
struct SessionRoutes {
    #[allow(dead_code)]
    network: String,
    containers: Vec<ClusterContainer>,
}

/// The proxy's in-process route table.
pub struct ProxyRouter {
    base_domain: String,
    routes: DashMap<String, SessionRoutes>,
}

impl ProxyRouter {
    pub fn new(base_domain: impl Into<String>) -> Self {
        Self {
            base_domain: base_domain.into(),
            routes: DashMap::new(),
        }
    }

    pub fn base_domain(&self) -> &str {
        &self.base_domain
    }

    /// Register (or replace) the routes for a session's cluster.
    pub fn register_cluster(
        &self,
        session_id: &str,
        network: &str,
        containers: Vec<ClusterContainer>,
    ) -> Vec<RouteInfo> {
        self.routes.insert(
            session_id.to_string(),
            SessionRoutes {
                network: network.to_string(),
                containers,
            },
        );
        self.get_urls(session_id)
    }

    /// Drop every route for a session. Idempotent.
    pub fn unregister_cluster(&self, session_id: &str) {
        self.routes.remove(session_id);
    }

    /// Public URLs for every declared port of a session.
    pub fn get_urls(&self, session_id: &str) -> Vec<RouteInfo> {
        let Some(routes) = self.routes.get(session_id) else {
            return Vec::new();
        };
        let mut infos: Vec<RouteInfo> = routes
            .containers
            .iter()
            .flat_map(|container| container.ports.keys())
            .map(|port| RouteInfo {
                container_port: *port,
                url: format!("http://{session_id}--{port}.{}", self.base_domain),
            })
            .collect();
        infos.sort_by_key(|info| info.container_port);
        infos.dedup_by_key(|info| info.container_port);
        infos
    }

    /// Resolve a `(session, port)` pair to its upstream.
    pub fn resolve(&self, session_id: &str, port: u16) -> Option<Upstream> {
        let routes = self.routes.get(session_id)?;
        for container in &routes.containers {
            if let Some(host_port) = container.ports.get(&port) {
                return Some(match host_port {
                    // Published ports short-circuit through loopback.
                    Some(host_port) => Upstream {
                        host: "127.0.0.1".to_string(),
                        port: *host_port,
                    },
                    // Otherwise the per-port network alias resolves via DNS
                    // on the session network.
                    None => Upstream {
                        host: format!("{session_id}--{port}"),
                        port,
                    },
                });
            }
        }
        None
    }

    /// Parse a `Host` header into `(session_id, port)`.
    pub fn parse_host(&self, host: &str) -> LabResult<(String, u16)> {
        parse_subdomain_host(host, &self.base_domain)
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.routes.contains_key(session_id)
    }
}

/// Parse `<uuid>--<port>.<base>` with exactly one `--` separator, a
/// 36-character uuid, and a numeric port.
pub fn parse_subdomain_host(host: &str, base_domain: &str) -> LabResult<(String, u16)> {
    let invalid = || LabError::InvalidSubdomain {
        host: host.to_string(),
    };

    // Strip an explicit listener port before matching the domain.
    let host = host.split(':').next().unwrap_or(host);

    let subdomain = host
        .strip_suffix(base_domain)
        .and_then(|rest| rest.strip_suffix('.'))
        .ok_or_else(invalid)?;

    let (session_id, port) = subdomain.split_once("--").ok_or_else(invalid)?;
    if port.contains("--") {
        return Err(invalid());
    }

    if session_id.len() != 36
        || !session_id
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase() || c == '-')
    {
        return Err(invalid());
    }

    if port.is_empty() || port.len() > 5 || !port.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let port: u16 = port.parse().map_err(|_| invalid())?;

    Ok((session_id.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SESSION: &str = "123e4567-e89b-42d3-a456-426614174000";

    fn router() -> ProxyRouter {
        ProxyRouter::new("lab.localhost")
    }

    fn cluster() -> Vec<ClusterContainer> {
        vec![ClusterContainer {
            container_id: "def-1".to_string(),
            hostname: "s-123e4567-def1".to_string(),
            ports: HashMap::from([(3000, None), (8080, Some(41820))]),
        }]
    }

    #[test]
    fn register_returns_urls_for_declared_ports() {
        let router = router();
        let urls = router.register_cluster(SESSION, "lab-net", cluster());
        assert_eq!(urls.len(), 2);
        assert_eq!(urls[0].container_port, 3000);
        assert_eq!(
            urls[0].url,
            format!("http://{SESSION}--3000.lab.localhost")
        );
    }

    #[test]
    fn resolve_prefers_published_host_port() {
        let router = router();
        router.register_cluster(SESSION, "lab-net", cluster());

        assert_eq!(
            router.resolve(SESSION, 8080),
            Some(Upstream {
                host: "127.0.0.1".to_string(),
                port: 41820,
            })
        );
        assert_eq!(
            router.resolve(SESSION, 3000),
            Some(Upstream {
                host: format!("{SESSION}--3000"),
                port: 3000,
            })
        );
        assert_eq!(router.resolve(SESSION, 9999), None);
    }

    #[test]
    fn register_then_unregister_is_a_noop() {
        let router = router();
        router.register_cluster(SESSION, "lab-net", cluster());
        router.unregister_cluster(SESSION);
        assert!(router.get_urls(SESSION).is_empty());
        assert!(router.resolve(SESSION, 3000).is_none());
        // Second unregister stays quiet.
        router.unregister_cluster(SESSION);
    }

    #[test]
    fn register_is_idempotent_per_session() {
        let router = router();
        router.register_cluster(SESSION, "lab-net", cluster());
        let urls = router.register_cluster(SESSION, "lab-net", cluster());
        assert_eq!(urls.len(), 2);
        assert_eq!(router.get_urls(SESSION).len(), 2);
    }

    #[test]
    fn parses_valid_host() {
        let (session, port) =
            parse_subdomain_host(&format!("{SESSION}--3000.lab.localhost"), "lab.localhost")
                .unwrap();
        assert_eq!(session, SESSION);
        assert_eq!(port, 3000);
    }

    #[test]
    fn parses_host_with_listener_port() {
        let (_, port) = parse_subdomain_host(
            &format!("{SESSION}--3000.lab.localhost:4180"),
            "lab.localhost",
        )
        .unwrap();
        assert_eq!(port, 3000);
    }

    #[test]
    fn rejects_malformed_hosts() {
        for host in [
            "nope.lab.localhost",
            &format!("{SESSION}--x.lab.localhost"),
            &format!("{SESSION}--3000--4.lab.localhost"),
            &format!("{SESSION}--123456.lab.localhost"),
            &format!("{SESSION}--3000.other.domain"),
            "short--3000.lab.localhost",
            &format!("{SESSION}.lab.localhost"),
        ] {
            assert!(
                parse_subdomain_host(host, "lab.localhost").is_err(),
                "expected rejection for {host}"
            );
        }
    }
}
