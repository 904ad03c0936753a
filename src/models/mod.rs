//! Rule content: one [`Model`] per record type and the registry that picks
//! the model for a revision.
//!
//! The model is chosen from the collection values in `980__a`. A revision
//! whose collections name no registered model falls back to the documents
//! model.

pub mod documents;
pub mod thesis;

use std::fmt;
use std::sync::Arc;

pub use documents::{base_model, model_with_lookup, person_or_org};
pub use thesis::thesis_model;

use crate::collaborators::{LookupPolicy, VocabularyLookup};
use crate::error::Result;
use crate::record::MarcBlob;
use crate::rules::Model;

struct Registered {
    collections: Vec<String>,
    model: Model,
}

/// Statically built set of models.
pub struct ModelRegistry {
    fallback: Model,
    models: Vec<Registered>,
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("fallback", &self.fallback.name())
            .field("models", &self.models.iter().map(|r| r.model.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl ModelRegistry {
    /// Registry using `fallback` for every revision.
    #[must_use]
    pub fn new(fallback: Model) -> Self {
        ModelRegistry {
            fallback,
            models: Vec::new(),
        }
    }

    /// Use `model` for revisions listing any of `collections` in `980__a`.
    #[must_use]
    pub fn register(mut self, collections: &[&str], model: Model) -> Self {
        self.models.push(Registered {
            collections: collections.iter().map(|c| c.to_uppercase()).collect(),
            model,
        });
        self
    }

    /// Documents plus thesis models.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a rule table is inconsistent.
    pub fn standard() -> Result<Self> {
        let base = base_model()?;
        let thesis = thesis_model(&base)?;
        Ok(ModelRegistry::new(base).register(&["THESIS"], thesis))
    }

    /// Like [`standard`](Self::standard), with creator affiliations resolved
    /// through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a rule table is inconsistent.
    pub fn with_lookup(lookup: Arc<dyn VocabularyLookup>, policy: LookupPolicy) -> Result<Self> {
        let base = model_with_lookup(lookup, policy)?;
        let thesis = thesis_model(&base)?;
        Ok(ModelRegistry::new(base).register(&["THESIS"], thesis))
    }

    /// Model for a revision, by its first `980__a` value naming a registered model.
    #[must_use]
    pub fn select(&self, blob: &MarcBlob) -> &Model {
        blob.subfield_values("980__", 'a')
            .map(|c| c.trim().to_uppercase())
            .find_map(|c| self.models.iter().find(|r| r.collections.contains(&c)))
            .map_or(&self.fallback, |r| &r.model)
    }

    /// Model by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Model> {
        std::iter::once(&self.fallback)
            .chain(self.models.iter().map(|r| &r.model))
            .find(|m| m.name() == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SubfieldMap;

    fn blob_with_collections(values: &[&str]) -> MarcBlob {
        let mut blob = MarcBlob::new();
        for value in values {
            let map: SubfieldMap = [('a', *value)].into_iter().collect();
            blob.add_data("980", ' ', ' ', map);
        }
        blob
    }

    #[test]
    fn test_select_by_collection() {
        let registry = ModelRegistry::standard().unwrap();
        assert_eq!(registry.select(&blob_with_collections(&["ARTICLE"])).name(), "documents");
        assert_eq!(registry.select(&blob_with_collections(&["CERN", "thesis"])).name(), "thesis");
        assert_eq!(registry.select(&MarcBlob::new()).name(), "documents");
        assert!(registry.get("thesis").is_some());
        assert!(registry.get("videos").is_none());
    }
}
