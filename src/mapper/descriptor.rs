//! Versioned field-mapping descriptors
//!
//! A descriptor names every source field a family is expected to carry. Any
//! source field it does not name (mapped, ignored, natural key or child
//! source) is treated as schema drift.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Mapping of one entity family
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct MappingDescriptor {
    pub family: String,

    /// Bumped whenever the mapping changes; stored with every record
    #[serde(default = "default_version")]
    pub version: u32,

    /// Source fields forming the natural key, in order
    pub natural_key: Vec<String>,

    /// Source fields copied onto the record
    #[serde(default)]
    pub fields: Vec<String>,

    /// Source fields known and deliberately dropped
    #[serde(default)]
    pub ignore: Vec<String>,

    #[serde(default)]
    pub children: Vec<ChildMapping>,
}

/// Mapping of a nested array of dependent rows
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct ChildMapping {
    /// Kind stored on each child row, e.g. "article"
    pub kind: String,

    /// Source field holding the array of child objects
    pub source: String,

    #[serde(default)]
    pub fields: Vec<String>,

    #[serde(default)]
    pub ignore: Vec<String>,

    #[serde(default)]
    pub children: Vec<ChildMapping>,
}

fn default_version() -> u32 {
    1
}

impl MappingDescriptor {
    /// Checks the descriptor for contradictions
    pub fn validate(&self) -> Result<(), String> {
        if self.family.trim().is_empty() {
            return Err("mapping family cannot be empty".to_string());
        }

        if self.version == 0 {
            return Err(format!("mapping '{}': version must be at least 1", self.family));
        }

        if self.natural_key.is_empty() {
            return Err(format!(
                "mapping '{}': natural-key must name at least one field",
                self.family
            ));
        }

        let mut known: Vec<&str> = self.natural_key.iter().map(String::as_str).collect();
        known.extend(self.fields.iter().map(String::as_str));
        known.extend(self.ignore.iter().map(String::as_str));
        known.extend(self.children.iter().map(|c| c.source.as_str()));
        check_unique(&self.family, &known)?;

        for child in &self.children {
            child.validate(&self.family)?;
        }

        Ok(())
    }

    /// Every top-level source field this descriptor accounts for
    pub fn known_fields(&self) -> HashSet<&str> {
        self.natural_key
            .iter()
            .chain(&self.fields)
            .chain(&self.ignore)
            .map(String::as_str)
            .chain(self.children.iter().map(|c| c.source.as_str()))
            .collect()
    }
}

impl ChildMapping {
    fn validate(&self, family: &str) -> Result<(), String> {
        if self.kind.trim().is_empty() || self.source.trim().is_empty() {
            return Err(format!(
                "mapping '{}': child mappings need both kind and source",
                family
            ));
        }

        let mut known: Vec<&str> = self.fields.iter().map(String::as_str).collect();
        known.extend(self.ignore.iter().map(String::as_str));
        known.extend(self.children.iter().map(|c| c.source.as_str()));
        check_unique(family, &known)?;

        for child in &self.children {
            child.validate(family)?;
        }

        Ok(())
    }

    pub fn known_fields(&self) -> HashSet<&str> {
        self.fields
            .iter()
            .chain(&self.ignore)
            .map(String::as_str)
            .chain(self.children.iter().map(|c| c.source.as_str()))
            .collect()
    }
}

fn check_unique(family: &str, names: &[&str]) -> Result<(), String> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(*name) {
            return Err(format!(
                "mapping '{}': field '{}' is listed more than once",
                family, name
            ));
        }
    }
    Ok(())
}
