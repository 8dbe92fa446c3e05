//! Typed entity graphs handed from the mapper to the upsert writer
//!
//! The core does not interpret field values; it only needs the family, the
//! natural key, the parent's mutable fields and the ordered child tree.

use serde_json::{Map, Value};

/// Field values of one row, keyed by column name
pub type Fields = Map<String, Value>;

/// External-source identifier of a domain record, possibly composite
///
/// Components keep the order of the mapping descriptor so that the canonical
/// form is stable across imports.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NaturalKey {
    components: Vec<(String, String)>,
}

impl NaturalKey {
    /// Builds a key from `(name, value)` pairs
    pub fn new<N, V>(components: impl IntoIterator<Item = (N, V)>) -> Self
    where
        N: Into<String>,
        V: Into<String>,
    {
        Self {
            components: components
                .into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        }
    }

    /// Builds a single-column key
    pub fn single(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            components: vec![(name.into(), value.into())],
        }
    }

    pub fn components(&self) -> &[(String, String)] {
        &self.components
    }

    /// Canonical string stored in the natural-key column
    ///
    /// `\`, `|` and `=` inside names and values are backslash-escaped, so
    /// distinct keys never share a canonical form.
    ///
    /// ```
    /// use chamber_sync::NaturalKey;
    ///
    /// let key = NaturalKey::new([("coalition_id", "3"), ("party_code", "PSL")]);
    /// assert_eq!(key.canonical(), "coalition_id=3|party_code=PSL");
    ///
    /// let odd = NaturalKey::single("code", "a|b=c");
    /// assert_eq!(odd.canonical(), r"code=a\|b\=c");
    /// ```
    pub fn canonical(&self) -> String {
        self.components
            .iter()
            .map(|(name, value)| {
                format!("{}={}", escape_component(name), escape_component(value))
            })
            .collect::<Vec<_>>()
            .join("|")
    }
}

fn escape_component(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '\\' | '|' | '=') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

impl std::fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

/// A dependent row owned by a domain record or by another child
#[derive(Debug, Clone, PartialEq)]
pub struct ChildRow {
    /// Row kind, e.g. "article", "item", "sub_item"
    pub kind: String,

    pub fields: Fields,

    pub children: Vec<ChildRow>,
}

impl ChildRow {
    pub fn new(kind: impl Into<String>, fields: Fields) -> Self {
        Self {
            kind: kind.into(),
            fields,
            children: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<ChildRow>) -> Self {
        self.children = children;
        self
    }

    /// Number of rows in this subtree, including this one
    pub fn row_count(&self) -> usize {
        1 + self.children.iter().map(ChildRow::row_count).sum::<usize>()
    }
}

/// A parsed record together with its dependent rows
#[derive(Debug, Clone, PartialEq)]
pub struct EntityGraph {
    /// Entity family, e.g. "budget_proposal", "deputy_term"
    pub family: String,

    pub natural_key: NaturalKey,

    /// Mutable fields of the parent record
    pub fields: Fields,

    pub children: Vec<ChildRow>,

    /// Version of the mapping descriptor that produced this graph
    pub mapping_version: u32,
}

impl EntityGraph {
    pub fn new(family: impl Into<String>, natural_key: NaturalKey, fields: Fields) -> Self {
        Self {
            family: family.into(),
            natural_key,
            fields,
            children: Vec::new(),
            mapping_version: 1,
        }
    }

    pub fn with_children(mut self, children: Vec<ChildRow>) -> Self {
        self.children = children;
        self
    }

    /// Total number of dependent rows in the graph
    pub fn child_row_count(&self) -> usize {
        self.children.iter().map(ChildRow::row_count).sum()
    }
}
