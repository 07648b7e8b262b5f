// SPDX-FileCopyrightText: © 2025 Treq Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Cookie storage capability.
//!
//! Jars are session-local and never shared between sessions. The service
//! hands the engine a [`CookieStore`] so cookie mutations stay observable:
//! `store_response_cookies` reports how many cookies actually changed,
//! which is what drives `snapshotVersion` bumps and `sessionUpdated` events.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use url::Url;

/// Capability the engine uses to read and write cookies for a request.
pub trait CookieStore: Send + Sync {
    /// Value for the outgoing `Cookie` header, if any cookie matches.
    fn cookie_header(&self, url: &Url) -> Option<String>;

    /// Ingests `Set-Cookie` values from a response. Returns the number of
    /// cookies added, changed, or removed.
    fn store_response_cookies(&self, url: &Url, set_cookie: &[String]) -> usize;

    /// Number of live (non-expired) cookies.
    fn cookie_count(&self) -> usize;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StoredCookie {
    name: String,
    value: String,
    domain: String,
    path: String,
    host_only: bool,
    secure: bool,
    expires_at_ms: Option<u64>,
}

impl StoredCookie {
    fn expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| at <= now_ms)
    }

    fn domain_matches(&self, host: &str) -> bool {
        if self.host_only {
            host == self.domain
        } else {
            host == self.domain || host.ends_with(&format!(".{}", self.domain))
        }
    }

    fn path_matches(&self, request_path: &str) -> bool {
        if self.path == "/" || self.path == request_path {
            return true;
        }
        request_path.starts_with(&self.path)
            && (self.path.ends_with('/')
                || request_path.as_bytes().get(self.path.len()) == Some(&b'/'))
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

fn parse_set_cookie(url: &Url, raw: &str) -> Option<StoredCookie> {
    let mut parts = raw.split(';');
    let (name, value) = parts.next()?.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let mut cookie = StoredCookie {
        name: name.to_string(),
        value: value.trim().to_string(),
        domain: url.host_str().unwrap_or_default().to_string(),
        path: "/".to_string(),
        host_only: true,
        secure: false,
        expires_at_ms: None,
    };

    for attribute in parts {
        let (key, attr_value) = match attribute.split_once('=') {
            Some((k, v)) => (k.trim().to_lowercase(), v.trim()),
            None => (attribute.trim().to_lowercase(), ""),
        };
        match key.as_str() {
            "path" if attr_value.starts_with('/') => cookie.path = attr_value.to_string(),
            "domain" if !attr_value.is_empty() => {
                cookie.domain = attr_value.trim_start_matches('.').to_lowercase();
                cookie.host_only = false;
            },
            "max-age" => {
                if let Ok(seconds) = attr_value.parse::<i64>() {
                    cookie.expires_at_ms = Some(if seconds <= 0 {
                        0
                    } else {
                        now_ms().saturating_add(seconds.unsigned_abs().saturating_mul(1000))
                    });
                }
            },
            "secure" => cookie.secure = true,
            // Expires and HttpOnly are accepted but not interpreted.
            _ => {},
        }
    }
    Some(cookie)
}

/// In-memory cookie jar with domain/path matching and Max-Age expiry.
#[derive(Debug, Default)]
pub struct MemoryCookieJar {
    cookies: Mutex<Vec<StoredCookie>>,
}

impl MemoryCookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<StoredCookie>> {
        self.cookies.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl CookieStore for MemoryCookieJar {
    fn cookie_header(&self, url: &Url) -> Option<String> {
        let host = url.host_str()?.to_lowercase();
        let path = url.path();
        let https = url.scheme() == "https";
        let now = now_ms();

        let header = self
            .lock()
            .iter()
            .filter(|c| !c.expired(now))
            .filter(|c| c.domain_matches(&host))
            .filter(|c| c.path_matches(path))
            .filter(|c| !c.secure || https)
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ");
        (!header.is_empty()).then_some(header)
    }

    fn store_response_cookies(&self, url: &Url, set_cookie: &[String]) -> usize {
        let now = now_ms();
        let mut cookies = self.lock();
        let mut changed = 0;

        for raw in set_cookie {
            let Some(incoming) = parse_set_cookie(url, raw) else { continue };
            let existing = cookies.iter().position(|c| {
                c.name == incoming.name && c.domain == incoming.domain && c.path == incoming.path
            });
            if incoming.expired(now) {
                if let Some(idx) = existing {
                    let _ = cookies.remove(idx);
                    changed += 1;
                }
                continue;
            }
            match existing {
                Some(idx) if cookies[idx] == incoming => {},
                Some(idx) => {
                    cookies[idx] = incoming;
                    changed += 1;
                },
                None => {
                    cookies.push(incoming);
                    changed += 1;
                },
            }
        }
        changed
    }

    fn cookie_count(&self) -> usize {
        let now = now_ms();
        self.lock().iter().filter(|c| !c.expired(now)).count()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn stores_and_returns_cookie() {
        let jar = MemoryCookieJar::new();
        let added = jar.store_response_cookies(&url("http://x.test/a"), &["s=1; Path=/".into()]);
        assert_eq!(added, 1);
        assert_eq!(jar.cookie_count(), 1);
        assert_eq!(jar.cookie_header(&url("http://x.test/b")).as_deref(), Some("s=1"));
    }

    #[test]
    fn identical_set_cookie_is_not_a_change() {
        let jar = MemoryCookieJar::new();
        let first = jar.store_response_cookies(&url("http://x.test/"), &["s=1; Path=/".into()]);
        let second = jar.store_response_cookies(&url("http://x.test/"), &["s=1; Path=/".into()]);
        assert_eq!(first, 1);
        assert_eq!(second, 0);
    }

    #[test]
    fn value_update_counts_as_change() {
        let jar = MemoryCookieJar::new();
        let _ = jar.store_response_cookies(&url("http://x.test/"), &["s=1".into()]);
        let changed = jar.store_response_cookies(&url("http://x.test/"), &["s=2".into()]);
        assert_eq!(changed, 1);
        assert_eq!(jar.cookie_header(&url("http://x.test/")).as_deref(), Some("s=2"));
    }

    #[test]
    fn host_only_cookie_does_not_leak_to_subdomain() {
        let jar = MemoryCookieJar::new();
        let _ = jar.store_response_cookies(&url("http://x.test/"), &["s=1".into()]);
        assert!(jar.cookie_header(&url("http://sub.x.test/")).is_none());
    }

    #[test]
    fn domain_cookie_matches_subdomains() {
        let jar = MemoryCookieJar::new();
        let _ = jar.store_response_cookies(&url("http://x.test/"), &["s=1; Domain=x.test".into()]);
        assert_eq!(jar.cookie_header(&url("http://sub.x.test/")).as_deref(), Some("s=1"));
    }

    #[test]
    fn path_scoping() {
        let jar = MemoryCookieJar::new();
        let _ = jar.store_response_cookies(&url("http://x.test/api"), &["s=1; Path=/api".into()]);
        assert_eq!(jar.cookie_header(&url("http://x.test/api/users")).as_deref(), Some("s=1"));
        assert!(jar.cookie_header(&url("http://x.test/apix")).is_none());
        assert!(jar.cookie_header(&url("http://x.test/")).is_none());
    }

    #[test]
    fn secure_cookie_needs_https() {
        let jar = MemoryCookieJar::new();
        let _ = jar.store_response_cookies(&url("https://x.test/"), &["s=1; Secure".into()]);
        assert!(jar.cookie_header(&url("http://x.test/")).is_none());
        assert_eq!(jar.cookie_header(&url("https://x.test/")).as_deref(), Some("s=1"));
    }

    #[test]
    fn zero_max_age_deletes() {
        let jar = MemoryCookieJar::new();
        let _ = jar.store_response_cookies(&url("http://x.test/"), &["s=1".into()]);
        let changed = jar.store_response_cookies(&url("http://x.test/"), &["s=1; Max-Age=0".into()]);
        assert_eq!(changed, 1);
        assert_eq!(jar.cookie_count(), 0);
    }
}
