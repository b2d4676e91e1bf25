//! Discovery catalog.
//!
//! Many stdio MCP servers answer discovery slowly or not at all,
//! while clients hit `tools/list` on their hot path. The bridge
//! therefore answers the discovery set from a local catalog: loaded
//! from a JSON file at boot, or populated lazily from the child's own
//! `initialize` response when the file is absent. Tool execution
//! still goes through the child.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::Path;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// The discovery methods the bridge may answer without the child.
pub const DISCOVERY_METHODS: [&str; 3] = ["tools/list", "resources/list", "prompts/list"];

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogDocument {
    pub tools: Vec<Value>,
    pub resources: Vec<Value>,
    pub prompts: Vec<Value>,
}

#[derive(Debug, Default)]
pub struct Catalog {
    inner: RwLock<CatalogDocument>,
    /// Set when the catalog came from an explicit file; an explicitly
    /// configured empty list is still short-circuited.
    configured: AtomicBool,
}

impl Catalog {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_document(document: CatalogDocument) -> Self {
        Self {
            inner: RwLock::new(document),
            configured: AtomicBool::new(true),
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let document: CatalogDocument = serde_json::from_str(&contents)
            .map_err(|e| BridgeError::InvalidConfig(format!("{}: {e}", path.display())))?;
        Ok(Self::from_document(document))
    }

    pub fn is_discovery_method(method: &str) -> bool {
        DISCOVERY_METHODS.contains(&method)
    }

    /// The result object for a discovery method, if the bridge should
    /// answer it locally. `None` means forward to the child.
    pub fn lookup(&self, method: &str) -> Option<Value> {
        let inner = self.inner.read().unwrap();
        let (key, entries) = match method {
            "tools/list" => ("tools", &inner.tools),
            "resources/list" => ("resources", &inner.resources),
            "prompts/list" => ("prompts", &inner.prompts),
            _ => return None,
        };
        if entries.is_empty() && !self.configured.load(Ordering::Relaxed) {
            return None;
        }
        Some(json!({ key: entries }))
    }

    /// Populate still-empty sections from a child `initialize` result
    /// that happens to advertise them. Never overwrites a configured
    /// or already-populated section.
    pub fn absorb_initialize_result(&self, result: &Value) {
        let mut inner = self.inner.write().unwrap();
        let document = &mut *inner;
        for (key, slot) in [
            ("tools", &mut document.tools),
            ("resources", &mut document.resources),
            ("prompts", &mut document.prompts),
        ] {
            if slot.is_empty()
                && let Some(entries) = result.get(key).and_then(|v| v.as_array())
            {
                *slot = entries.clone();
            }
        }
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        let inner = self.inner.read().unwrap();
        (inner.tools.len(), inner.resources.len(), inner.prompts.len())
    }
}
