//! Collaborators downstream of an access decision: the resource catalog and
//! the render pipeline.
//!
//! The access-control core only needs the traits. `InMemoryCatalog` is the
//! default catalog, seeded from a TOML manifest or built in code.

use crate::error::{CatalogError, RenderError};
use crate::token::Purpose;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::RwLock;

/// One protected resource and its display metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEntry {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub views: u64,
    #[serde(default)]
    pub likes: u64,
    #[serde(default)]
    pub camera: Option<String>,
    #[serde(default)]
    pub settings: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

impl ResourceEntry {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            tags: Vec::new(),
            date: None,
            views: 0,
            likes: 0,
            camera: None,
            settings: None,
            location: None,
        }
    }
}

/// Source of listable resources and their counters
pub trait Catalog: Send + Sync {
    fn list_resources(&self) -> Result<Vec<ResourceEntry>, CatalogError>;
    /// Returns the new view count
    fn record_view(&self, resource_id: &str) -> Result<u64, CatalogError>;
    /// Returns the new like count
    fn record_like(&self, resource_id: &str) -> Result<u64, CatalogError>;
}

/// Produces bytes for a resource a client has been granted
pub trait Renderer: Send + Sync {
    fn render(&self, resource_id: &str, purpose: Purpose) -> Result<Vec<u8>, RenderError>;
}

/// Manifest file layout: a list of `[[resource]]` tables
#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    resource: Vec<ResourceEntry>,
}

/// Catalog held in process memory
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    entries: RwLock<Vec<ResourceEntry>>,
}

impl InMemoryCatalog {
    pub fn new(entries: Vec<ResourceEntry>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Load entries from a TOML manifest
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading catalog manifest {}", path.display()))?;
        let manifest: Manifest = toml::from_str(&content)
            .with_context(|| format!("parsing catalog manifest {}", path.display()))?;
        Ok(Self::new(manifest.resource))
    }

    fn bump(
        &self,
        resource_id: &str,
        field: fn(&mut ResourceEntry) -> &mut u64,
    ) -> Result<u64, CatalogError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| CatalogError::Unavailable("catalog lock poisoned".to_string()))?;
        let entry = entries
            .iter_mut()
            .find(|e| e.id == resource_id)
            .ok_or_else(|| CatalogError::NotFound(resource_id.to_string()))?;
        let counter = field(entry);
        *counter += 1;
        Ok(*counter)
    }
}

impl Catalog for InMemoryCatalog {
    fn list_resources(&self) -> Result<Vec<ResourceEntry>, CatalogError> {
        self.entries
            .read()
            .map(|entries| entries.clone())
            .map_err(|_| CatalogError::Unavailable("catalog lock poisoned".to_string()))
    }

    fn record_view(&self, resource_id: &str) -> Result<u64, CatalogError> {
        self.bump(resource_id, |e| &mut e.views)
    }

    fn record_like(&self, resource_id: &str) -> Result<u64, CatalogError> {
        self.bump(resource_id, |e| &mut e.likes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_counters() {
        let catalog = InMemoryCatalog::new(vec![ResourceEntry::new("1", "Mountain Sunrise")]);
        assert_eq!(catalog.record_view("1").unwrap(), 1);
        assert_eq!(catalog.record_view("1").unwrap(), 2);
        assert_eq!(catalog.record_like("1").unwrap(), 1);

        let listed = catalog.list_resources().unwrap();
        assert_eq!(listed[0].views, 2);
        assert_eq!(listed[0].likes, 1);
    }

    #[test]
    fn test_unknown_resource() {
        let catalog = InMemoryCatalog::default();
        assert!(matches!(
            catalog.record_like("missing"),
            Err(CatalogError::NotFound(id)) if id == "missing"
        ));
    }

    #[test]
    fn test_load_manifest() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[[resource]]
id = "1"
title = "Mountain Sunrise"
tags = ["sunrise", "mountain"]
views = 156
likes = 24
camera = "Canon EOS R5"

[[resource]]
id = "2"
title = "Ocean Waves"
"#
        )
        .unwrap();

        let catalog = InMemoryCatalog::load_from(file.path()).unwrap();
        let entries = catalog.list_resources().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].tags, vec!["sunrise", "mountain"]);
        assert_eq!(entries[0].views, 156);
        assert_eq!(entries[1].camera, None);
    }
}
