use crate::error::{Result, SearchError};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Products,
    Collections,
    Pages,
    Blogs,
    Articles,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EntityKind::Products => "products",
            EntityKind::Collections => "collections",
            EntityKind::Pages => "pages",
            EntityKind::Blogs => "blogs",
            EntityKind::Articles => "articles",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpellCheck {
    pub original: String,
    pub corrected: String,
    #[serde(default)]
    pub words: Vec<String>,
}

/// Where a response came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseSource {
    Service { host: String },
    /// The host platform's own browse/search, used in degraded mode.
    Fallback,
}

/// A decoded search response. Entities stay opaque JSON for the rendering layer.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResponse {
    pub kind: EntityKind,
    pub entities: Vec<Json>,
    pub count: Option<u64>,
    /// Value→count per option facet slot, in request order.
    pub options: Vec<IndexMap<String, u64>>,
    /// `[min, max]` per boundary facet, in request order.
    pub boundaries: Vec<(f64, f64)>,
    pub spell_check: Option<SpellCheck>,
    pub warnings: Vec<String>,
    pub source: ResponseSource,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    products: Option<Vec<Json>>,
    collections: Option<Vec<Json>>,
    pages: Option<Vec<Json>>,
    blogs: Option<Vec<Json>>,
    articles: Option<Vec<Json>>,
    count: Option<u64>,
    #[serde(default)]
    options: Vec<IndexMap<String, u64>>,
    #[serde(default)]
    boundaries: Vec<(f64, f64)>,
    spell_check: Option<SpellCheck>,
    #[serde(default)]
    warnings: Vec<String>,
}

impl SearchResponse {
    /// Decode a service response body.
    pub fn decode(body: &str, source: ResponseSource) -> Result<Self> {
        let wire: WireResponse = serde_json::from_str(body)
            .map_err(|e| SearchError::Decode(format!("Failed to decode search response: {}", e)))?;

        let (kind, entities) = [
            (EntityKind::Products, wire.products),
            (EntityKind::Collections, wire.collections),
            (EntityKind::Pages, wire.pages),
            (EntityKind::Blogs, wire.blogs),
            (EntityKind::Articles, wire.articles),
        ]
        .into_iter()
        .find_map(|(kind, entities)| entities.map(|e| (kind, e)))
        .unwrap_or((EntityKind::Products, Vec::new()));

        Ok(Self {
            kind,
            entities,
            count: wire.count,
            options: wire.options,
            boundaries: wire.boundaries,
            spell_check: wire.spell_check,
            warnings: wire.warnings,
            source,
        })
    }

    pub fn empty(source: ResponseSource) -> Self {
        Self {
            kind: EntityKind::Products,
            entities: Vec::new(),
            count: None,
            options: Vec::new(),
            boundaries: Vec::new(),
            spell_check: None,
            warnings: Vec::new(),
            source,
        }
    }

    /// Total matches when the service counted them, else the number returned.
    pub fn total(&self) -> u64 {
        self.count.unwrap_or(self.entities.len() as u64)
    }

    pub fn is_fallback(&self) -> bool {
        self.source == ResponseSource::Fallback
    }
}
