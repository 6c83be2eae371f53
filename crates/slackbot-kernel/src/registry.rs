use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// A stored handler name no longer maps to a registered handler.
///
/// Records outlive deploys, so this usually means a handler was renamed or
/// removed while callbacks created under the old name were still live.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("handler class not found for {name}")]
pub struct HandlerNotFound {
    pub name: String,
    pub known: Vec<String>,
}

/// Name to handler mapping, filled once at startup.
pub struct HandlerRegistry<H: ?Sized> {
    handlers: HashMap<String, Arc<H>>,
}

impl<H: ?Sized> Default for HandlerRegistry<H> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<H: ?Sized> fmt::Debug for HandlerRegistry<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl<H: ?Sized> HandlerRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`, returning the handler it replaced.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<H>) -> Option<Arc<H>> {
        self.handlers.insert(name.into(), handler)
    }

    pub fn find(&self, name: &str) -> Result<Arc<H>, HandlerNotFound> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| HandlerNotFound {
                name: name.to_string(),
                known: self.names(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Sorted snapshot of registered names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
