use crate::UrlError;
use url::Url;

/// List of tracking query parameters to remove during normalization
const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "mc_eid", "_ga"];

/// Normalizes a URL so the same resource is tracked under one identity
///
/// # Normalization Steps
///
/// 1. Parse the URL; reject if malformed (dot segments are resolved by the parser)
/// 2. Accept only http:// and https://
/// 3. Lowercase the host
/// 4. Collapse repeated slashes in the path
/// 5. Remove fragment (everything after #)
/// 6. Remove tracking query parameters
/// 7. Sort remaining query parameters by key (stable for equal keys)
/// 8. Remove empty query string (trailing ?)
///
/// Unlike a crawler normalizer this keeps the scheme, `www.` and trailing
/// slashes untouched: open-data publishers routinely serve different
/// documents for those variants.
///
/// # Examples
///
/// ```
/// use chamber_sync::url::normalize_url;
///
/// let url = normalize_url("https://API.Example.ORG//acts?b=2&a=1#top").unwrap();
/// assert_eq!(url.as_str(), "https://api.example.org/acts?a=1&b=2");
/// ```
pub fn normalize_url(url_str: &str) -> Result<Url, UrlError> {
    let mut url = Url::parse(url_str.trim()).map_err(|e| UrlError::Parse(e.to_string()))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(UrlError::InvalidScheme(format!(
            "Only HTTP and HTTPS schemes are supported, got: {}",
            url.scheme()
        )));
    }

    let host = url.host_str().ok_or(UrlError::MissingHost)?.to_lowercase();
    url.set_host(Some(&host))
        .map_err(|e| UrlError::Malformed(format!("Failed to set host: {}", e)))?;

    let path = collapse_slashes(url.path());
    url.set_path(&path);

    url.set_fragment(None);

    if url.query().is_some() {
        let params = filter_and_sort_query_params(&url);
        if params.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(params);
        }
    }

    Ok(url)
}

/// Replaces runs of `/` with a single `/`
fn collapse_slashes(path: &str) -> String {
    let mut result = String::with_capacity(path.len());
    let mut previous_slash = false;

    for c in path.chars() {
        if c == '/' {
            if !previous_slash {
                result.push(c);
            }
            previous_slash = true;
        } else {
            result.push(c);
            previous_slash = false;
        }
    }

    if result.is_empty() {
        result.push('/');
    }
    result
}

/// Filters out tracking parameters and sorts remaining query parameters
fn filter_and_sort_query_params(url: &Url) -> Vec<(String, String)> {
    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    params.sort_by(|a, b| a.0.cmp(&b.0));

    params
}

/// Checks if a query parameter is a tracking parameter
fn is_tracking_param(key: &str) -> bool {
    TRACKING_PARAMS.contains(&key) || key.starts_with("utm_")
}
