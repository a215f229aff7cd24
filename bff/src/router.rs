// src/router.rs
use std::collections::HashMap;

/// Fixed route table: exact-match, case-sensitive path to a static JSON
/// body. Built once at startup, then shared read-only across workers behind
/// an `Arc` — no interior mutation, no synchronization.
#[derive(Clone)]
pub struct Router {
    routes: HashMap<&'static str, &'static [u8]>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    /// Registers a GET route. Paths match exactly after query stripping.
    pub fn add(&mut self, path: &'static str, body: &'static [u8]) {
        debug_assert!(path.starts_with('/'));
        self.routes.insert(path, body);
    }

    pub fn lookup(&self, path: &[u8]) -> Option<&'static [u8]> {
        let path = std::str::from_utf8(path).ok()?;
        self.routes.get(path).copied()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match_only() {
        let mut router = Router::new();
        router.add("/health", br#"{"status":"OK"}"#);

        assert_eq!(router.lookup(b"/health"), Some(&br#"{"status":"OK"}"#[..]));
        assert_eq!(router.lookup(b"/health/"), None);
        assert_eq!(router.lookup(b"/Health"), None, "case-sensitive");
        assert_eq!(router.lookup(b"/"), None);
    }
}
