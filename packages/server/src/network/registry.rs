//! Endpoint registry: duplicate rejection at build time, lock-free routing
//! at dispatch time.
//!
//! Uniqueness is checked on literal normalized (path, method) keys, so
//! `/{a}` and `/{b}` coexist as registrations. Dispatch is by shape: an
//! exact hit wins, otherwise the first registered template route whose
//! segments match, with `{name}` segments capturing their concrete value.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::network::endpoint::{normalize_path, Endpoint, EndpointKey};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Registration failure. Nothing is constructed when this is returned.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Two or more endpoints share a (path, method) key. Every duplicated
    /// key is listed, first-seen order, each once.
    #[error("duplicate endpoint bindings: {}", format_keys(.keys))]
    Duplicates {
        /// The offending keys.
        keys: Vec<EndpointKey>,
    },
}

fn format_keys(keys: &[EndpointKey]) -> String {
    keys.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

// ---------------------------------------------------------------------------
// Template routes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum TemplateSegment {
    Literal(String),
    Param(String),
}

fn parse_segments(path: &str) -> Vec<TemplateSegment> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            segment
                .strip_prefix('{')
                .and_then(|rest| rest.strip_suffix('}'))
                .map_or_else(
                    || TemplateSegment::Literal(segment.to_string()),
                    |name| TemplateSegment::Param(name.to_string()),
                )
        })
        .collect()
}

struct TemplateRoute {
    key: EndpointKey,
    segments: Vec<TemplateSegment>,
    endpoint: Arc<dyn Endpoint>,
}

fn match_segments(
    template: &[TemplateSegment],
    concrete: &[&str],
) -> Option<HashMap<String, String>> {
    if template.len() != concrete.len() {
        return None;
    }
    let mut params = HashMap::new();
    for (segment, value) in template.iter().zip(concrete) {
        match segment {
            TemplateSegment::Literal(literal) => {
                if literal != value {
                    return None;
                }
            }
            TemplateSegment::Param(name) => {
                params.insert(name.clone(), (*value).to_string());
            }
        }
    }
    Some(params)
}

// ---------------------------------------------------------------------------
// EndpointRegistry
// ---------------------------------------------------------------------------

/// A successful (path, method) lookup.
pub struct RouteMatch {
    /// The bound endpoint.
    pub endpoint: Arc<dyn Endpoint>,
    /// Captured `{name}` segment values; empty for exact hits.
    pub params: HashMap<String, String>,
}

impl fmt::Debug for RouteMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteMatch")
            .field(
                "endpoint",
                &EndpointKey::new(self.endpoint.method(), self.endpoint.path()),
            )
            .field("params", &self.params)
            .finish()
    }
}

/// Immutable routing table built once, before serving.
///
/// Lookups take no locks; the dispatcher publishes the whole registry as
/// a snapshot.
pub struct EndpointRegistry {
    exact: HashMap<EndpointKey, Arc<dyn Endpoint>>,
    templates: Vec<TemplateRoute>,
    all: Vec<Arc<dyn Endpoint>>,
    keys: Vec<EndpointKey>,
}

impl fmt::Debug for EndpointRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointRegistry")
            .field("keys", &self.keys)
            .finish()
    }
}

impl EndpointRegistry {
    /// Validates and indexes a set of endpoints.
    ///
    /// Keys are canonicalized here (paths normalized, methods uppercased),
    /// so differently spelled duplicates such as `/a` and `//a/.` still
    /// collide.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Duplicates`] naming every duplicated key;
    /// no partial registry is built.
    pub fn build(endpoints: Vec<Arc<dyn Endpoint>>) -> Result<Self, RegistryError> {
        let keys: Vec<EndpointKey> = endpoints
            .iter()
            .map(|endpoint| EndpointKey::new(endpoint.method(), endpoint.path()))
            .collect();

        let mut seen = HashSet::new();
        let mut duplicates: Vec<EndpointKey> = Vec::new();
        for key in &keys {
            if !seen.insert(key.clone()) && !duplicates.contains(key) {
                duplicates.push(key.clone());
            }
        }
        if !duplicates.is_empty() {
            return Err(RegistryError::Duplicates { keys: duplicates });
        }

        let mut exact = HashMap::new();
        let mut templates = Vec::new();
        for (key, endpoint) in keys.iter().cloned().zip(endpoints.iter()) {
            let segments = parse_segments(&key.path);
            if segments
                .iter()
                .any(|segment| matches!(segment, TemplateSegment::Param(_)))
            {
                templates.push(TemplateRoute {
                    key,
                    segments,
                    endpoint: Arc::clone(endpoint),
                });
            } else {
                exact.insert(key, Arc::clone(endpoint));
            }
        }

        Ok(Self {
            exact,
            templates,
            all: endpoints,
            keys,
        })
    }

    /// Resolves an inbound (path, method) pair.
    ///
    /// The path is normalized first. An exact hit wins over any template;
    /// among templates, registration order decides.
    #[must_use]
    pub fn resolve(&self, path: &str, method: &str) -> Option<RouteMatch> {
        let path = normalize_path(path);
        let method = method.to_ascii_uppercase();

        let key = EndpointKey {
            method: method.clone(),
            path: path.clone(),
        };
        if let Some(endpoint) = self.exact.get(&key) {
            return Some(RouteMatch {
                endpoint: Arc::clone(endpoint),
                params: HashMap::new(),
            });
        }

        let concrete: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        for route in &self.templates {
            if route.key.method != method {
                continue;
            }
            if let Some(params) = match_segments(&route.segments, &concrete) {
                return Some(RouteMatch {
                    endpoint: Arc::clone(&route.endpoint),
                    params,
                });
            }
        }
        None
    }

    /// Registered keys, in registration order.
    #[must_use]
    pub fn keys(&self) -> &[EndpointKey] {
        &self.keys
    }

    /// Registered endpoints, in registration order.
    #[must_use]
    pub fn endpoints(&self) -> &[Arc<dyn Endpoint>] {
        &self.all
    }

    /// Number of registered endpoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.all.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
