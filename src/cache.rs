//! Origin-keyed cache for favicons and authorization-server metadata.
//!
//! Shared across tenants: entries hold only public origin-level facts. Each
//! entry expires on a TTL (default 24 h) and is evicted lazily on read. The
//! favicon resolver stores the resolved absolute URL; the bytes themselves
//! are never fetched by the gateway.

use std::sync::LazyLock;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use regex::Regex;
use reqwest::Client;
use tracing::debug;
use url::Url;

use crate::oauth::AuthorizationServerMetadata;

/// Default entry lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 3600);

struct Entry<T> {
    value: T,
    cached_at: Instant,
}

impl<T> Entry<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            cached_at: Instant::now(),
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.cached_at.elapsed() > ttl
    }
}

/// Tenant-agnostic cache keyed by URL origin.
pub struct OriginCache {
    favicons: DashMap<String, Entry<Option<String>>>,
    metadata: DashMap<String, Entry<AuthorizationServerMetadata>>,
    ttl: Duration,
}

impl OriginCache {
    /// Create with the default 24 h TTL.
    #[must_use]
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    /// Create with a custom TTL.
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            favicons: DashMap::new(),
            metadata: DashMap::new(),
            ttl,
        }
    }

    /// Cached favicon resolution for an origin, if fresh.
    /// The outer `Option` is a cache miss; the inner one a cached "no icon".
    pub fn get_favicon(&self, origin: &str) -> Option<Option<String>> {
        get_fresh(&self.favicons, origin, self.ttl)
    }

    /// Record a favicon resolution (including a negative one).
    pub fn put_favicon(&self, origin: &str, resolved: Option<String>) {
        self.favicons.insert(origin.to_string(), Entry::new(resolved));
    }

    /// Cached authorization-server metadata for an origin, if fresh.
    pub fn get_metadata(&self, origin: &str) -> Option<AuthorizationServerMetadata> {
        get_fresh(&self.metadata, origin, self.ttl)
    }

    /// Record discovered authorization-server metadata.
    pub fn put_metadata(&self, origin: &str, metadata: AuthorizationServerMetadata) {
        self.metadata.insert(origin.to_string(), Entry::new(metadata));
    }
}

impl Default for OriginCache {
    fn default() -> Self {
        Self::new()
    }
}

fn get_fresh<T: Clone>(map: &DashMap<String, Entry<T>>, key: &str, ttl: Duration) -> Option<T> {
    if let Some(entry) = map.get(key) {
        if entry.is_expired(ttl) {
            drop(entry);
            map.remove(key);
            None
        } else {
            Some(entry.value.clone())
        }
    } else {
        None
    }
}

static LINK_ICON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<link[^>]*rel\s*=\s*["'][^"']*icon[^"']*["'][^>]*href\s*=\s*["']([^"']+)["']"#)
        .expect("static regex")
});

static LINK_ICON_HREF_FIRST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<link[^>]*href\s*=\s*["']([^"']+)["'][^>]*rel\s*=\s*["'][^"']*icon[^"']*["']"#)
        .expect("static regex")
});

/// Resolve a favicon URL for `origin`, consulting the cache first.
///
/// Resolution order: the authorization server's `logo_uri` (when metadata is
/// cached for the origin), the standard well-known paths, then a
/// `<link rel="icon">` parsed out of the origin's HTML.
pub async fn resolve_favicon(cache: &OriginCache, client: &Client, origin: &str) -> Option<String> {
    if let Some(cached) = cache.get_favicon(origin) {
        return cached;
    }

    let resolved = resolve_favicon_uncached(cache, client, origin).await;
    cache.put_favicon(origin, resolved.clone());
    resolved
}

async fn resolve_favicon_uncached(
    cache: &OriginCache,
    client: &Client,
    origin: &str,
) -> Option<String> {
    if let Some(logo) = cache.get_metadata(origin).and_then(|m| m.logo_uri) {
        debug!(origin = %origin, "Favicon from authorization server logo_uri");
        return Some(logo);
    }

    for name in ["favicon.ico", "favicon.png", "favicon.svg"] {
        let candidate = format!("{}/{name}", origin.trim_end_matches('/'));
        if let Ok(response) = client.head(&candidate).send().await {
            if response.status().is_success() {
                return Some(candidate);
            }
        }
    }

    // Last resort: scrape the origin's HTML for a link tag
    let html = client
        .get(origin)
        .send()
        .await
        .ok()?
        .text()
        .await
        .ok()?;
    let href = extract_icon_href(&html)?;
    absolutize(origin, &href)
}

/// Pull the first `<link rel="…icon…" href="…">` out of an HTML document.
#[must_use]
pub fn extract_icon_href(html: &str) -> Option<String> {
    LINK_ICON
        .captures(html)
        .or_else(|| LINK_ICON_HREF_FIRST.captures(html))
        .map(|c| c[1].to_string())
}

fn absolutize(origin: &str, href: &str) -> Option<String> {
    let base = Url::parse(origin).ok()?;
    base.join(href).ok().map(|u| u.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(logo: Option<&str>) -> AuthorizationServerMetadata {
        AuthorizationServerMetadata {
            issuer: "https://as.example.com".to_string(),
            authorization_endpoint: "https://as.example.com/authorize".to_string(),
            token_endpoint: "https://as.example.com/token".to_string(),
            registration_endpoint: None,
            revocation_endpoint: None,
            grant_types_supported: vec![],
            scopes_supported: vec![],
            code_challenge_methods_supported: vec![],
            logo_uri: logo.map(String::from),
        }
    }

    // =========================================================================
    // TTL behavior
    // =========================================================================

    #[test]
    fn fresh_entries_are_served() {
        let cache = OriginCache::new();
        cache.put_favicon("https://a.example.com", Some("https://a.example.com/favicon.ico".into()));
        assert_eq!(
            cache.get_favicon("https://a.example.com"),
            Some(Some("https://a.example.com/favicon.ico".to_string()))
        );
    }

    #[test]
    fn negative_results_are_cached() {
        let cache = OriginCache::new();
        cache.put_favicon("https://b.example.com", None);
        assert_eq!(cache.get_favicon("https://b.example.com"), Some(None));
    }

    #[test]
    fn expired_entries_are_evicted() {
        let cache = OriginCache::with_ttl(Duration::ZERO);
        cache.put_favicon("https://c.example.com", Some("x".into()));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get_favicon("https://c.example.com"), None);
    }

    #[test]
    fn metadata_round_trip() {
        let cache = OriginCache::new();
        cache.put_metadata("https://as.example.com", metadata(None));
        let loaded = cache.get_metadata("https://as.example.com").unwrap();
        assert_eq!(loaded.token_endpoint, "https://as.example.com/token");
    }

    // =========================================================================
    // HTML link extraction
    // =========================================================================

    #[test]
    fn extracts_rel_then_href() {
        let html = r#"<html><head><link rel="icon" href="/assets/icon.svg"></head></html>"#;
        assert_eq!(extract_icon_href(html), Some("/assets/icon.svg".to_string()));
    }

    #[test]
    fn extracts_href_then_rel() {
        let html = r#"<link href="/fav.png" rel="shortcut icon">"#;
        assert_eq!(extract_icon_href(html), Some("/fav.png".to_string()));
    }

    #[test]
    fn ignores_non_icon_links() {
        let html = r#"<link rel="stylesheet" href="/style.css">"#;
        assert_eq!(extract_icon_href(html), None);
    }

    #[test]
    fn absolutizes_relative_href() {
        assert_eq!(
            absolutize("https://mcp.example.com", "/icon.png"),
            Some("https://mcp.example.com/icon.png".to_string())
        );
        assert_eq!(
            absolutize("https://mcp.example.com", "https://cdn.example.com/i.png"),
            Some("https://cdn.example.com/i.png".to_string())
        );
    }
}
