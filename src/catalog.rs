use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default catalog bundled with the binary, used when `--catalog` is absent.
const DEFAULT_CATALOG: &str = include_str!("../assets/crypto-catalog-jce.yaml");

/// Errors raised while loading a catalog document. Fatal at startup.
#[derive(Debug, Error)]
pub(crate) enum CatalogLoadError {
    #[error("failed to read catalog {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse catalog {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Identity of a catalog API entry point.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ApiRef {
    pub(crate) class_name: String,
    pub(crate) method_name: String,
}

/// Zero-based positions of the cryptographically meaningful arguments of a
/// catalog API. A negative index marks the argument as absent for that API.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ArgSpec {
    pub(crate) algorithm_index: Option<i32>,
    pub(crate) provider_name_index: Option<i32>,
    /// Declared by the schema for future provider-object rules; preserved
    /// but not consulted during evaluation.
    pub(crate) provider_object_index: Option<i32>,
}

impl ArgSpec {
    /// Apply the positional defaults: algorithm at 0, provider name and
    /// provider object at 1. Idempotent.
    pub(crate) fn normalized(self) -> Self {
        Self {
            algorithm_index: Some(self.algorithm_index.unwrap_or(0)),
            provider_name_index: Some(self.provider_name_index.unwrap_or(1)),
            provider_object_index: Some(self.provider_object_index.unwrap_or(1)),
        }
    }
}

/// One recognized API and the layout of its arguments.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ApiEntry {
    pub(crate) api: ApiRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) arg_spec: Option<ArgSpec>,
}

/// Declarative registry of cryptographic entry points to audit.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Catalog {
    pub(crate) catalog_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) version: Option<String>,
    pub(crate) apis: Vec<ApiEntry>,
}

impl Catalog {
    /// Lookup key for an API: `"<class>#<method>"`, dotted class name.
    pub(crate) fn key(class_name: &str, method_name: &str) -> String {
        format!("{class_name}#{method_name}")
    }

    /// Apply ArgSpec defaults to every entry. Idempotent.
    pub(crate) fn normalized(mut self) -> Self {
        for entry in &mut self.apis {
            entry.arg_spec = Some(entry.arg_spec.unwrap_or_default().normalized());
        }
        self
    }

    /// Derived lookup map from API key to its ArgSpec. Entries are visited
    /// in document order; on duplicate keys the first entry wins.
    pub(crate) fn arg_spec_by_api(&self) -> BTreeMap<String, ArgSpec> {
        let mut specs = BTreeMap::new();
        for entry in &self.apis {
            let key = Self::key(&entry.api.class_name, &entry.api.method_name);
            let spec = entry.arg_spec.unwrap_or_default().normalized();
            specs.entry(key).or_insert(spec);
        }
        specs
    }
}

/// Load and normalize a catalog from a YAML file.
pub(crate) fn load_catalog(path: &Path) -> Result<Catalog, CatalogLoadError> {
    let text = fs::read_to_string(path).map_err(|source| CatalogLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let catalog: Catalog =
        serde_yaml::from_str(&text).map_err(|source| CatalogLoadError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(catalog.normalized())
}

/// Load and normalize the bundled default catalog.
pub(crate) fn load_default_catalog() -> Result<Catalog, CatalogLoadError> {
    let catalog: Catalog =
        serde_yaml::from_str(DEFAULT_CATALOG).map_err(|source| CatalogLoadError::Parse {
            path: PathBuf::from("crypto-catalog-jce.yaml"),
            source,
        })?;
    Ok(catalog.normalized())
}
