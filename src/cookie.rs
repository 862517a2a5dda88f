//! # Cookie jar
//!
//! A small, shared read-mostly store of opaque `Set-Cookie` values keyed by
//! subscription-set location. Writes happen only on set registration and
//! replacement, under the [`crate::store::SubscriptionSetStore`] lock;
//! reads happen on every delivery and are lock-free beyond the short
//! `spin::RwLock` read guard, matching §5's "shared resource policy".

use spin::RwLock;
use std::collections::HashMap;

/// Shared cookie storage, one opaque cookie list per subscription-set
/// location, plus the dispatcher's own combined-set cookie.
#[derive(Debug, Default)]
pub struct CookieJar {
    by_location: RwLock<HashMap<String, Vec<String>>>,
    service_cookie: RwLock<Option<String>>,
}

impl CookieJar {
    /// Create an empty jar.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cookies carried by `location` (called on register/replace).
    pub fn set_cookies(&self, location: &str, cookies: Vec<String>) {
        if cookies.is_empty() {
            self.by_location.write().remove(location);
        } else {
            self.by_location.write().insert(location.to_string(), cookies);
        }
    }

    /// Drop all cookies for `location` (called on `remove`).
    pub fn clear(&self, location: &str) {
        self.by_location.write().remove(location);
    }

    /// Cookies to attach to a delivery routed through `location`.
    pub fn cookies_for(&self, location: &str) -> Vec<String> {
        self.by_location
            .read()
            .get(location)
            .cloned()
            .unwrap_or_default()
    }

    /// Set the cookie attached to the combined-set broadcast
    /// (`service_access_cookie`).
    pub fn set_service_cookie(&self, cookie: Option<String>) {
        *self.service_cookie.write() = cookie;
    }

    /// The combined-set broadcast's own cookie, if configured.
    pub fn service_cookie(&self) -> Option<String> {
        self.service_cookie.read().clone()
    }
}

#[cfg(test)]
mod should {
    use super::*;

    #[test]
    fn return_no_cookies_for_unknown_location() {
        let jar = CookieJar::new();
        assert!(jar.cookies_for("L1").is_empty());
    }

    #[test]
    fn replace_cookies_on_set_cookies() {
        let jar = CookieJar::new();
        jar.set_cookies("L1", vec!["a=1".into()]);
        jar.set_cookies("L1", vec!["b=2".into()]);
        assert_eq!(jar.cookies_for("L1"), vec!["b=2".to_string()]);
    }

    #[test]
    fn clear_removes_cookies() {
        let jar = CookieJar::new();
        jar.set_cookies("L1", vec!["a=1".into()]);
        jar.clear("L1");
        assert!(jar.cookies_for("L1").is_empty());
    }
}
