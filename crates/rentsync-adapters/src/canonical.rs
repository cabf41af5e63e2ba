//! Label canonicalization for entity names and composite category keys.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rentsync_core::{BaselineRow, Category};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use thiserror::Error;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Separator between the entity and category parts of a composite key.
pub const COMPOSITE_KEY_SEPARATOR: char = '|';

#[derive(Debug, Error)]
pub enum VocabularyError {
    #[error("reading vocabulary {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing vocabulary {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Normalized comparison form: decomposed, diacritics stripped, lowercased,
/// whitespace collapsed.
pub fn slug(input: &str) -> String {
    let stripped = strip_marks(input).to_lowercase();
    // Lowercasing can reintroduce combining marks (e.g. U+0130), so strip again.
    strip_marks(&stripped)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn strip_marks(input: &str) -> String {
    input.nfkd().filter(|c| !is_combining_mark(*c)).collect()
}

/// Trim, collapse whitespace, lowercase.
pub fn normalize_label(input: &str) -> String {
    input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Alias and synonym tables injected into the canonicalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vocabulary {
    #[serde(default)]
    pub category_synonyms: BTreeMap<String, Category>,
    /// Neighborhood -> parent entity display name.
    #[serde(default)]
    pub entity_aliases: BTreeMap<String, String>,
}

impl Default for Vocabulary {
    fn default() -> Self {
        let category_synonyms = [
            ("utilities", Category::Utilities),
            ("utility", Category::Utilities),
            ("groceries", Category::Groceries),
            ("grocery", Category::Groceries),
            ("internet", Category::Internet),
            ("cell phone", Category::CellPhone),
            ("cellphone", Category::CellPhone),
            ("mobile", Category::CellPhone),
            ("dining", Category::Dining),
            ("dining out", Category::Dining),
            ("restaurants", Category::Dining),
            ("entertainment", Category::Entertainment),
            ("travel", Category::Travel),
            ("transportation", Category::Travel),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let entity_aliases = [
            ("avenida balboa", "Panama City"),
            ("casco viejo", "Panama City"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            category_synonyms,
            entity_aliases,
        }
    }
}

impl Vocabulary {
    pub fn from_yaml_str(text: &str, origin: &Path) -> Result<Self, VocabularyError> {
        let parsed: Vocabulary = serde_yaml::from_str(text).map_err(|source| VocabularyError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        Ok(parsed.normalized())
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, VocabularyError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| VocabularyError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text, path)
    }

    /// Re-key both tables by their comparison forms.
    pub fn normalized(self) -> Self {
        Self {
            category_synonyms: self
                .category_synonyms
                .into_iter()
                .map(|(k, v)| (normalize_label(&k), v))
                .collect(),
            entity_aliases: self
                .entity_aliases
                .into_iter()
                .map(|(k, v)| (slug(&k), v))
                .collect(),
        }
    }
}

/// Resolves override labels against the entity set of the baseline source.
#[derive(Debug, Clone)]
pub struct Canonicalizer {
    canonical: BTreeMap<String, String>,
    vocabulary: Vocabulary,
}

impl Canonicalizer {
    /// Only baseline entities become canonical; aliases never add entities.
    pub fn new<'a, I>(vocabulary: Vocabulary, baseline_entities: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let canonical = baseline_entities
            .into_iter()
            .map(str::trim)
            .filter_map(|name| {
                let key = slug(name);
                (!key.is_empty()).then(|| (key, name.to_string()))
            })
            .collect();
        Self {
            canonical,
            vocabulary: vocabulary.normalized(),
        }
    }

    pub fn from_baseline(vocabulary: Vocabulary, rows: &[BaselineRow]) -> Self {
        Self::new(vocabulary, rows.iter().map(|r| r.entity.as_str()))
    }

    pub fn canonical_entities(&self) -> impl Iterator<Item = &str> {
        self.canonical.values().map(String::as_str)
    }

    pub fn resolve_entity(&self, label: &str) -> Option<&str> {
        let key = slug(label);
        if key.is_empty() {
            return None;
        }
        if let Some(name) = self.canonical.get(&key) {
            return Some(name);
        }
        let parent = self.vocabulary.entity_aliases.get(&key)?;
        self.canonical.get(&slug(parent)).map(String::as_str)
    }

    /// Category from the trailing segment of `"<entity> | <category>"`.
    pub fn parse_category(&self, composite_key: &str) -> Option<Category> {
        let label = composite_key.rsplit(COMPOSITE_KEY_SEPARATOR).next()?;
        let key = normalize_label(label);
        if key.is_empty() {
            return None;
        }
        self.vocabulary.category_synonyms.get(&key).copied()
    }

    /// Nearest canonical entity by Jaro-Winkler over slugs, for diagnostics.
    pub fn closest_entity(&self, label: &str) -> Option<(&str, f64)> {
        let key = slug(label);
        self.canonical
            .iter()
            .map(|(k, name)| (name.as_str(), jaro_winkler(&key, k)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }
}
