/// Import status definitions for tracking crawl progress
///
/// This module defines every state an ImportRecord can be in and the only
/// transitions between them that the store will accept.
use std::fmt;

/// Represents the current state of a tracked resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImportStatus {
    // ===== Active States =====
    /// Resource is known and waiting for a worker to claim it
    Discovered,

    /// A worker holds the claim on this resource
    Claimed,

    /// Content was retrieved; mapping and commit are pending
    Fetched,

    // ===== Stable States =====
    /// Content was mapped and committed; stable until re-admitted
    Imported,

    // ===== Failure States =====
    /// Parked after a failure that retrying cannot fix (schema drift)
    Error,

    /// Retry budget exhausted; requires operator re-admission
    Abandoned,
}

impl ImportStatus {
    /// Returns true if a worker may currently be working on this resource
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Claimed | Self::Fetched)
    }

    /// Returns true if no automatic process will move this resource again
    ///
    /// `Imported` is stable but not terminal: the recrawl scheduler may
    /// re-admit it.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Abandoned | Self::Error)
    }

    /// Returns true if the operator has to look at this resource
    pub fn needs_operator(&self) -> bool {
        self.is_terminal()
    }

    /// Checks whether `self -> next` is one of the legal transitions
    ///
    /// ```text
    /// Discovered -> Claimed            claim (compare-and-set)
    /// Claimed    -> Fetched            content retrieved
    /// Fetched    -> Imported           parse + commit succeeded
    /// Claimed    -> Error | Discovered | Abandoned   failure resolution
    /// Fetched    -> Error | Discovered | Abandoned   failure resolution
    /// Imported   -> Discovered         token-refresh re-admission
    /// Error      -> Discovered         operator reset
    /// Abandoned  -> Discovered         operator reset
    /// ```
    pub fn can_transition_to(&self, next: ImportStatus) -> bool {
        use ImportStatus::*;
        matches!(
            (self, next),
            (Discovered, Claimed)
                | (Claimed, Fetched)
                | (Fetched, Imported)
                | (Claimed, Error)
                | (Claimed, Discovered)
                | (Claimed, Abandoned)
                | (Fetched, Error)
                | (Fetched, Discovered)
                | (Fetched, Abandoned)
                | (Imported, Discovered)
                | (Error, Discovered)
                | (Abandoned, Discovered)
        )
    }

    /// Converts the status to its database string representation
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Claimed => "claimed",
            Self::Fetched => "fetched",
            Self::Imported => "imported",
            Self::Error => "error",
            Self::Abandoned => "abandoned",
        }
    }

    /// Parses a status from its database string representation
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "discovered" => Some(Self::Discovered),
            "claimed" => Some(Self::Claimed),
            "fetched" => Some(Self::Fetched),
            "imported" => Some(Self::Imported),
            "error" => Some(Self::Error),
            "abandoned" => Some(Self::Abandoned),
            _ => None,
        }
    }

    /// Returns all possible statuses
    pub fn all_states() -> Vec<Self> {
        vec![
            Self::Discovered,
            Self::Claimed,
            Self::Fetched,
            Self::Imported,
            Self::Error,
            Self::Abandoned,
        ]
    }
}

impl fmt::Display for ImportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}
