//! Failure classification for per-resource errors

use std::fmt;

/// Why a single resource failed to import
///
/// The kind decides how the failure is resolved: retried under backoff,
/// retried once, or parked for the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Network timeout, connection error, 5xx, rate limiting
    Transient,

    /// 4xx, resource gone
    Permanent,

    /// The mapper met fields it does not know; fixed by updating the mapping
    SchemaDrift,
}

impl FailureKind {
    /// Whether this failure counts against the retry budget
    pub fn consumes_retry_budget(&self) -> bool {
        !matches!(self, Self::SchemaDrift)
    }

    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::SchemaDrift => "schema_drift",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "transient" => Some(Self::Transient),
            "permanent" => Some(Self::Permanent),
            "schema_drift" => Some(Self::SchemaDrift),
            _ => None,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

/// A classified failure with its operator-facing message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Permanent, message)
    }

    pub fn schema_drift(message: impl Into<String>) -> Self {
        Self::new(FailureKind::SchemaDrift, message)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
