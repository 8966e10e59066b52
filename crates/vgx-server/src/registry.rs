// src/registry.rs
//! Read-mostly lookup tables built once at startup: plugin callables with
//! their phase bitmask, builtins, and file suffix to media type mappings.
//! Shared between the I/O thread and every executor as `Arc<Registry>`.

use crate::buffer::BufferError;
use crate::http::{HttpStatus, MediaType, Method};
use crate::parser::PartialIdent;
use crate::request::Headers;
use crate::response::Response;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

pub const HEALTH_CHECK_PATH: &str = "/vgx/hc";
pub const BUILTIN_PREFIX: &str = "/vgx/builtin/";
pub const PLUGIN_PREFIX: &str = "/vgx/plugin/";

/// Which plugin phases exist for a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PluginPhases(u8);

impl PluginPhases {
    pub const NONE: PluginPhases = PluginPhases(0);
    pub const PRE: PluginPhases = PluginPhases(1);
    pub const MAIN: PluginPhases = PluginPhases(2);
    pub const POST: PluginPhases = PluginPhases(4);

    #[inline(always)]
    pub fn contains(&self, other: PluginPhases) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    #[inline(always)]
    pub fn has_pre(&self) -> bool {
        self.contains(Self::PRE)
    }

    #[inline(always)]
    pub fn has_post(&self) -> bool {
        self.contains(Self::POST)
    }

    #[inline(always)]
    pub fn has_any_processor(&self) -> bool {
        self.has_pre() || self.has_post()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for PluginPhases {
    type Output = PluginPhases;
    fn bitor(self, rhs: PluginPhases) -> PluginPhases {
        PluginPhases(self.0 | rhs.0)
    }
}

/// Decoded query string of the request path.
#[derive(Debug, Clone, Default)]
pub struct QueryParams(Vec<(String, String)>);

impl QueryParams {
    pub fn parse(query: &str) -> Result<Self, serde_urlencoded::de::Error> {
        serde_urlencoded::from_str(query).map(QueryParams)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Read-only request handed to a plugin.
pub struct RequestView<'a> {
    pub method: Method,
    pub path: &'a str,
    pub headers: &'a Headers,
    pub content_type: MediaType,
    pub content: &'a [u8],
    pub ident: Option<PartialIdent>,
}

/// Write access to the response body.
pub struct ResponseSink<'a> {
    response: &'a mut Response,
}

impl<'a> ResponseSink<'a> {
    pub fn new(response: &'a mut Response) -> Self {
        Self { response }
    }

    pub fn write(&mut self, data: &[u8]) -> Result<(), BufferError> {
        self.response.content.write(data).map(|_| ())
    }

    pub fn write_json<T: Serialize>(&mut self, value: &T) -> Result<(), BufferError> {
        let bytes = serde_json::to_vec(value).map_err(|_| BufferError::Alloc)?;
        self.write(&bytes)
    }

    pub fn mediatype(&self) -> MediaType {
        self.response.mediatype
    }

    /// Switching the media type drops a JSON wrapper that was already opened.
    pub fn set_mediatype(&mut self, mediatype: MediaType) {
        if mediatype != self.response.mediatype {
            self.response.mediatype = mediatype;
            if self.response.is_prewrapped() {
                self.response.clear_body();
            }
        }
    }

    pub fn content_len(&self) -> usize {
        self.response.content.size()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginOutcome {
    pub status: HttpStatus,
    pub error: Option<String>,
    /// Run the request through the pipeline again.
    pub resubmit: bool,
}

impl PluginOutcome {
    pub fn ok() -> Self {
        Self { status: HttpStatus::OK, error: None, resubmit: false }
    }

    pub fn error(status: HttpStatus, message: impl Into<String>) -> Self {
        Self { status, error: Some(message.into()), resubmit: false }
    }

    pub fn resubmit() -> Self {
        Self { status: HttpStatus::OK, error: None, resubmit: true }
    }

    pub fn is_ok(&self) -> bool {
        self.status == HttpStatus::OK && self.error.is_none()
    }
}

/// External execution callable.
pub trait Plugin: Send + Sync {
    fn call(
        &self,
        name: &str,
        post: bool,
        params: &QueryParams,
        request: &RequestView<'_>,
        response: &mut ResponseSink<'_>,
    ) -> PluginOutcome;
}

impl<F> Plugin for F
where
    F: Fn(&str, bool, &QueryParams, &RequestView<'_>, &mut ResponseSink<'_>) -> PluginOutcome + Send + Sync,
{
    fn call(
        &self,
        name: &str,
        post: bool,
        params: &QueryParams,
        request: &RequestView<'_>,
        response: &mut ResponseSink<'_>,
    ) -> PluginOutcome {
        self(name, post, params, request, response)
    }
}

#[derive(Clone)]
pub struct PluginEntry {
    pub phases: PluginPhases,
    pub plugin: Arc<dyn Plugin>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouteKind {
    HealthCheck,
    Builtin,
    Plugin,
    #[default]
    NotFound,
}

/// Where a request path leads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Route {
    pub kind: RouteKind,
    pub name: String,
    pub query: String,
    pub phases: PluginPhases,
    /// Media type implied by the path suffix, if any.
    pub suffix_type: Option<MediaType>,
}

impl Route {
    pub fn is_plugin(&self) -> bool {
        self.kind == RouteKind::Plugin
    }

    pub fn is_health_check(&self) -> bool {
        self.kind == RouteKind::HealthCheck
    }

    pub fn allowed_methods(&self) -> &'static [Method] {
        match self.kind {
            RouteKind::Plugin | RouteKind::Builtin => &[Method::Get, Method::Head, Method::Post],
            _ => &[Method::Get, Method::Head],
        }
    }
}

pub struct Registry {
    plugins: HashMap<String, PluginEntry>,
    builtins: HashMap<String, PluginEntry>,
    suffixes: HashMap<String, MediaType>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn plugin(&self, name: &str) -> Option<&PluginEntry> {
        self.plugins.get(name)
    }

    pub fn builtin(&self, name: &str) -> Option<&PluginEntry> {
        self.builtins.get(name)
    }

    pub fn entry(&self, route: &Route) -> Option<&PluginEntry> {
        match route.kind {
            RouteKind::Plugin => self.plugin(&route.name),
            RouteKind::Builtin => self.builtin(&route.name),
            _ => None,
        }
    }

    pub fn media_type_for_suffix(&self, suffix: &str) -> Option<MediaType> {
        self.suffixes.get(&suffix.to_ascii_lowercase()).copied()
    }

    /// Classify a request path. A registered suffix on the last segment is
    /// stripped from the plugin name and reported as `suffix_type`.
    pub fn route(&self, path: &str) -> Route {
        let (path, query) = match path.find('?') {
            Some(idx) => (&path[..idx], &path[idx + 1..]),
            None => (path, ""),
        };
        let (path, suffix_type) = match path.rfind('.') {
            Some(dot) if !path[dot..].contains('/') => match self.media_type_for_suffix(&path[dot + 1..]) {
                Some(mt) => (&path[..dot], Some(mt)),
                None => (path, None),
            },
            _ => (path, None),
        };

        let (kind, name) = if path == HEALTH_CHECK_PATH {
            (RouteKind::HealthCheck, "")
        } else if let Some(name) = path.strip_prefix(BUILTIN_PREFIX) {
            (RouteKind::Builtin, name)
        } else if let Some(name) = path.strip_prefix(PLUGIN_PREFIX) {
            (RouteKind::Plugin, name)
        } else {
            (RouteKind::NotFound, path)
        };

        let phases = match kind {
            RouteKind::Plugin => self.plugins.get(name).map(|e| e.phases).unwrap_or_default(),
            RouteKind::Builtin => self.builtins.get(name).map(|e| e.phases).unwrap_or_default(),
            _ => PluginPhases::NONE,
        };

        Route {
            kind,
            name: name.to_string(),
            query: query.to_string(),
            phases,
            suffix_type,
        }
    }
}

pub struct RegistryBuilder {
    plugins: HashMap<String, PluginEntry>,
    builtins: HashMap<String, PluginEntry>,
    suffixes: HashMap<String, MediaType>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        let suffixes = [
            "js", "json", "pdf", "xml", "bin", "txt", "css", "htm", "html", "ico", "gif", "png", "jpg", "jpeg",
        ]
        .into_iter()
        .filter_map(|s| MediaType::from_suffix(s).map(|mt| (s.to_string(), mt)))
        .collect();
        Self {
            plugins: HashMap::new(),
            builtins: HashMap::new(),
            suffixes,
        }
    }

    pub fn plugin(mut self, name: &str, phases: PluginPhases, plugin: impl Plugin + 'static) -> Self {
        self.plugins.insert(
            name.to_string(),
            PluginEntry { phases: phases | PluginPhases::MAIN, plugin: Arc::new(plugin) },
        );
        self
    }

    pub fn builtin(mut self, name: &str, plugin: impl Plugin + 'static) -> Self {
        self.builtins.insert(
            name.to_string(),
            PluginEntry { phases: PluginPhases::MAIN, plugin: Arc::new(plugin) },
        );
        self
    }

    pub fn suffix(mut self, suffix: &str, mediatype: MediaType) -> Self {
        self.suffixes.insert(suffix.to_ascii_lowercase(), mediatype);
        self
    }

    pub fn build(self) -> Registry {
        Registry {
            plugins: self.plugins,
            builtins: self.builtins,
            suffixes: self.suffixes,
        }
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &str, _: bool, _: &QueryParams, _: &RequestView<'_>, _: &mut ResponseSink<'_>) -> PluginOutcome {
        PluginOutcome::ok()
    }

    fn registry() -> Registry {
        Registry::builder()
            .plugin("search", PluginPhases::PRE | PluginPhases::POST, noop)
            .plugin("echo", PluginPhases::NONE, noop)
            .builtin("status", noop)
            .build()
    }

    #[test]
    fn test_route_classification() {
        let registry = registry();
        assert!(registry.route("/vgx/hc").is_health_check());

        let route = registry.route("/vgx/plugin/search?q=a%20b&n=3");
        assert_eq!(route.kind, RouteKind::Plugin);
        assert_eq!(route.name, "search");
        assert_eq!(route.query, "q=a%20b&n=3");
        assert!(route.phases.has_pre());
        assert!(route.phases.has_post());

        let route = registry.route("/vgx/plugin/echo");
        assert!(route.phases.contains(PluginPhases::MAIN));
        assert!(!route.phases.has_any_processor());

        assert_eq!(registry.route("/vgx/builtin/status").kind, RouteKind::Builtin);
        assert_eq!(registry.route("/index.html").kind, RouteKind::NotFound);
    }

    #[test]
    fn test_suffix_is_stripped_from_name() {
        let registry = registry();
        let route = registry.route("/vgx/plugin/echo.txt?x=1");
        assert_eq!(route.name, "echo");
        assert_eq!(route.suffix_type, Some(MediaType::Text));

        let route = registry.route("/vgx/plugin/echo.unknown");
        assert_eq!(route.name, "echo.unknown");
        assert_eq!(route.suffix_type, None);
    }

    #[test]
    fn test_unknown_plugin_has_no_phases() {
        let route = registry().route("/vgx/plugin/missing");
        assert_eq!(route.kind, RouteKind::Plugin);
        assert!(route.phases.is_empty());
    }

    #[test]
    fn test_query_params() {
        let params = QueryParams::parse("q=a%20b&n=3&flag").unwrap();
        assert_eq!(params.get("q"), Some("a b"));
        assert_eq!(params.get("n"), Some("3"));
        assert_eq!(params.get("flag"), Some(""));
        assert_eq!(params.get("missing"), None);
        assert_eq!(params.len(), 3);
    }
}
