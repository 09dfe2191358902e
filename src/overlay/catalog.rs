// Marker catalog: static category -> display metadata lookup.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::blip::CategoryKey;
use crate::config::ConfigError;

/// Icon geometry handed to the rendering surface untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IconStyle {
    #[serde(default)]
    pub icon_url: Option<String>,
    #[serde(default)]
    pub icon_size: Option<[f64; 2]>,
    #[serde(default)]
    pub icon_anchor: Option<[f64; 2]>,
    #[serde(default)]
    pub popup_anchor: Option<[f64; 2]>,
}

/// One catalog entry.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MarkerType {
    /// Default display name for blips of this category.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub icon: IconStyle,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CatalogFile {
    Wrapped {
        #[serde(rename = "MarkerTypes")]
        marker_types: HashMap<CategoryKey, MarkerType>,
    },
    Bare(HashMap<CategoryKey, MarkerType>),
}

/// Read-only category lookup consumed by the registry.
#[derive(Debug, Clone, Default)]
pub struct MarkerCatalog {
    types: HashMap<CategoryKey, MarkerType>,
}

impl MarkerCatalog {
    pub fn new(types: HashMap<CategoryKey, MarkerType>) -> Self {
        Self { types }
    }

    /// Parse a catalog, either bare or wrapped in a `MarkerTypes` object.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let types = match serde_json::from_str::<CatalogFile>(json)? {
            CatalogFile::Wrapped { marker_types } => marker_types,
            CatalogFile::Bare(types) => types,
        };
        Ok(Self { types })
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&contents)
    }

    pub fn get(&self, category: &CategoryKey) -> Option<&MarkerType> {
        self.types.get(category)
    }

    pub fn default_name(&self, category: &CategoryKey) -> Option<&str> {
        self.get(category)?.name.as_deref()
    }

    pub fn icon(&self, category: &CategoryKey) -> Option<&IconStyle> {
        self.get(category).map(|t| &t.icon)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
