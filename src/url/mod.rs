//! URL handling module for Chamber-Sync
//!
//! This module provides URL normalization (one identity per resource URL) and
//! URL pattern derivation (one identity per logical document across token
//! refreshes).

mod normalize;
mod pattern;

// Re-export main functions
pub use normalize::normalize_url;
pub use pattern::{derive_url_pattern, PatternRules, TOKEN_PLACEHOLDER};
