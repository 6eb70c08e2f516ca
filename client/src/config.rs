use url::Url;

use crate::constants::{CATALOG_API_URL, CATALOG_STORAGE_URL, GITHUB_RELEASES_API, LOCAL_WS_URL};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub label: &'static str,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub server_url: String,
    pub prefer_local: bool,
    pub disable_local: bool,
    pub catalog_url: String,
    pub storage_url: String,
    pub releases_url: String,
    pub skip_update_check: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: LOCAL_WS_URL.to_string(),
            prefer_local: false,
            disable_local: false,
            catalog_url: CATALOG_API_URL.to_string(),
            storage_url: CATALOG_STORAGE_URL.to_string(),
            releases_url: GITHUB_RELEASES_API.to_string(),
            skip_update_check: false,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or blank values keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let flag = |key: &str| lookup(key).is_some();
        let defaults = Self::default();

        Self {
            server_url: value("COWATCH_SERVER_URL").unwrap_or(defaults.server_url),
            prefer_local: flag("COWATCH_PREFER_LOCAL"),
            disable_local: flag("COWATCH_DISABLE_LOCAL"),
            catalog_url: value("COWATCH_CATALOG_URL").unwrap_or(defaults.catalog_url),
            storage_url: value("COWATCH_STORAGE_URL").unwrap_or(defaults.storage_url),
            releases_url: value("COWATCH_RELEASES_URL").unwrap_or(defaults.releases_url),
            skip_update_check: flag("COWATCH_SKIP_UPDATE_CHECK"),
        }
    }

    /// Room server endpoints in the order they should be tried.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        let configured = Endpoint {
            label: "configured",
            url: self.server_url.clone(),
        };
        if self.server_url == LOCAL_WS_URL {
            return vec![Endpoint {
                label: "local development",
                url: self.server_url.clone(),
            }];
        }

        let local = Endpoint {
            label: "local development",
            url: LOCAL_WS_URL.to_string(),
        };
        let mut endpoints = Vec::with_capacity(2);
        if self.prefer_local && !self.disable_local {
            endpoints.push(local.clone());
        }
        endpoints.push(configured);
        if !self.prefer_local && !self.disable_local {
            endpoints.push(local);
        }
        endpoints
    }
}

/// HTTP base of a room server given its WebSocket URL.
pub fn http_base_from_ws(ws_url: &str) -> Option<String> {
    let parsed = Url::parse(ws_url).ok()?;
    let scheme = match parsed.scheme() {
        "ws" => "http",
        "wss" => "https",
        _ => return None,
    };

    let mut http = parsed;
    http.set_scheme(scheme).ok()?;
    http.set_path("");
    http.set_query(None);
    http.set_fragment(None);
    Some(http.as_str().trim_end_matches('/').to_string())
}

pub fn health_url_from_ws(ws_url: &str) -> Option<String> {
    http_base_from_ws(ws_url).map(|base| format!("{base}/healthz"))
}
