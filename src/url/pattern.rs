//! URL pattern derivation
//!
//! A URL pattern is the URL with its volatile token fields replaced by a
//! placeholder. Two URLs with the same pattern and the same anchor text are
//! the same logical document observed under different session tokens.

use url::Url;

/// Placeholder substituted for token-like values
pub const TOKEN_PLACEHOLDER: &str = "{token}";

/// Characters allowed in an opaque encoded blob (base64, base64url, hex, percent)
const TOKEN_EXTRA_CHARS: &[char] = &['+', '/', '=', '_', '-', '.', '%', '~'];

/// Rules deciding which URL parts are volatile tokens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternRules {
    /// Minimum length for a value to be considered an encoded blob
    pub token_min_length: usize,

    /// Query parameters that are always masked, whatever their value
    pub token_params: Vec<String>,
}

impl Default for PatternRules {
    fn default() -> Self {
        Self {
            token_min_length: 24,
            token_params: Vec::new(),
        }
    }
}

impl PatternRules {
    pub fn new(token_min_length: usize, token_params: Vec<String>) -> Self {
        Self {
            token_min_length,
            token_params,
        }
    }

    /// Returns true if the named query parameter is always a token
    pub fn is_token_param(&self, key: &str) -> bool {
        self.token_params
            .iter()
            .any(|param| param.eq_ignore_ascii_case(key))
    }

    /// Heuristic for opaque session/security tokens: long encoded blobs
    ///
    /// A value qualifies when it is at least `token_min_length` characters,
    /// uses only base64/hex/percent-encoding characters, and mixes letters
    /// with digits. Long purely numeric identifiers are kept.
    pub fn looks_like_token(&self, value: &str) -> bool {
        if value.chars().count() < self.token_min_length {
            return false;
        }

        let mut has_digit = false;
        let mut has_alpha = false;

        for c in value.chars() {
            if c.is_ascii_digit() {
                has_digit = true;
            } else if c.is_ascii_alphabetic() {
                has_alpha = true;
            } else if !TOKEN_EXTRA_CHARS.contains(&c) {
                return false;
            }
        }

        has_digit && has_alpha
    }
}

/// Derives the token-masked pattern of a URL
///
/// The pattern keeps scheme, host, port, every non-token path segment and every
/// query key; token-like path segments and query values become `{token}`.
/// Query pairs are ordered by key so parameter order never matters.
///
/// # Examples
///
/// ```
/// use chamber_sync::url::{derive_url_pattern, PatternRules};
/// use url::Url;
///
/// let rules = PatternRules::default();
/// let a = Url::parse("https://data.example.org/doc?id=42&tk=Zm9vYmFyOTk4ODc3NjY1NTQ0MzMyMjEx").unwrap();
/// let b = Url::parse("https://data.example.org/doc?tk=YmF6cXV4MTEyMjMzNDQ1NTY2Nzc4ODk5&id=42").unwrap();
///
/// assert_eq!(derive_url_pattern(&a, &rules), derive_url_pattern(&b, &rules));
/// assert_eq!(
///     derive_url_pattern(&a, &rules),
///     "https://data.example.org/doc?id=42&tk={token}"
/// );
/// ```
pub fn derive_url_pattern(url: &Url, rules: &PatternRules) -> String {
    let mut pattern = format!(
        "{}://{}",
        url.scheme(),
        url.host_str().unwrap_or_default().to_lowercase()
    );

    if let Some(port) = url.port() {
        pattern.push_str(&format!(":{}", port));
    }

    let path = match url.path_segments() {
        Some(segments) => segments
            .map(|segment| mask_path_segment(segment, rules))
            .collect::<Vec<_>>()
            .join("/"),
        None => String::new(),
    };
    pattern.push('/');
    pattern.push_str(&path);

    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .map(|(key, value)| {
            let masked = if rules.is_token_param(&key) || rules.looks_like_token(&value) {
                TOKEN_PLACEHOLDER.to_string()
            } else {
                value.to_string()
            };
            (key.to_string(), masked)
        })
        .collect();

    if !params.is_empty() {
        params.sort_by(|a, b| a.0.cmp(&b.0));
        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        pattern.push('?');
        pattern.push_str(&query);
    }

    pattern
}

fn mask_path_segment(segment: &str, rules: &PatternRules) -> String {
    if rules.looks_like_token(segment) {
        TOKEN_PLACEHOLDER.to_string()
    } else {
        segment.to_string()
    }
}
