//! Mapping of fetched content into entity graphs
//!
//! The worker only sees the `Mapper` trait. `JsonMapper` is the stock
//! implementation, driven by the `[[mapping]]` descriptors of the
//! configuration.

mod descriptor;
mod json;

pub use descriptor::{ChildMapping, MappingDescriptor};
pub use json::JsonMapper;

use crate::entity::EntityGraph;
use crate::state::FailureKind;
use thiserror::Error;

/// Errors produced while mapping source content
#[derive(Debug, Error)]
pub enum MapError {
    #[error("No mapping for entity family: {0}")]
    UnknownFamily(String),

    #[error("Undecodable content: {0}")]
    InvalidContent(String),

    #[error("Schema drift in {family} (mapping v{version}): unmapped fields {unmapped:?}")]
    SchemaDrift {
        family: String,
        version: u32,
        unmapped: Vec<String>,
    },

    #[error("Missing natural key field '{field}' for {family}")]
    MissingNaturalKey { family: String, field: String },

    #[error("Unexpected shape at '{path}' for {family}: {detail}")]
    UnexpectedShape {
        family: String,
        path: String,
        detail: String,
    },
}

impl MapError {
    /// How the worker should classify this failure
    ///
    /// Undecodable bytes are usually a truncated or interrupted download and
    /// are retried; everything else means the source format moved away from
    /// the mapping.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::InvalidContent(_) => FailureKind::Transient,
            _ => FailureKind::SchemaDrift,
        }
    }
}

/// Result type for mapping operations
pub type MapResult<T> = Result<T, MapError>;

/// Turns the raw body of a resource into an entity graph
pub trait Mapper: Send + Sync {
    fn map(&self, family: &str, content: &[u8]) -> MapResult<EntityGraph>;
}
