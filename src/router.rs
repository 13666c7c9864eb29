// src/router.rs
use crate::http::{Request, Response};
use std::collections::HashMap;

/// A route handler fills in the response and reports success. Captured
/// state travels inside the closure.
pub type Handler = Box<dyn Fn(&Request, &mut Response) -> bool>;

/// Exact-match URI table. Populated before the reactor runs, read-only
/// afterwards. Matching is case-sensitive and whole-string: no
/// wildcards, no prefixes, no per-method dispatch.
pub struct Router {
    routes: HashMap<String, Handler>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    pub fn handle(
        &mut self,
        uri: &str,
        handler: impl Fn(&Request, &mut Response) -> bool + 'static,
    ) {
        self.routes.insert(uri.to_string(), Box::new(handler));
    }

    pub fn lookup(&self, uri: &str) -> Option<&Handler> {
        self.routes.get(uri)
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
