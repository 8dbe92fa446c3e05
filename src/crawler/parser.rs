//! HTML parser for listing pages
//!
//! Listing pages link to the documents to track. Each anchor yields its
//! absolute URL and its visible text; the text is what tells two token
//! variants of one document apart from two different documents.

use crate::crawler::discovery::DiscoveredLink;
use scraper::{Html, Selector};
use url::Url;

/// Extracts all followable anchors from a listing page
///
/// # Link Extraction Rules
///
/// **Include:**
/// - `<a href="...">` tags, resolved against `base_url`
///
/// **Exclude:**
/// - `javascript:`, `mailto:`, `tel:` links
/// - Data URIs
/// - Fragment-only links
///
/// # Arguments
///
/// * `html` - The HTML content to parse
/// * `base_url` - The listing page URL, used to resolve relative links
///
/// # Example
///
/// ```
/// use chamber_sync::crawler::extract_links;
/// use url::Url;
///
/// let html = r#"<ul><li><a href="/doc?id=7">Proposal  7</a></li></ul>"#;
/// let base = Url::parse("https://example.org/list").unwrap();
/// let links = extract_links(html, &base);
/// assert_eq!(links[0].url, "https://example.org/doc?id=7");
/// assert_eq!(links[0].anchor_text.as_deref(), Some("Proposal 7"));
/// ```
pub fn extract_links(html: &str, base_url: &Url) -> Vec<DiscoveredLink> {
    let document = Html::parse_document(html);
    let mut links = Vec::new();

    let selector = match Selector::parse("a[href]") {
        Ok(selector) => selector,
        Err(_) => return links,
    };

    for element in document.select(&selector) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };

        if let Some(url) = resolve_link(href, base_url) {
            links.push(DiscoveredLink {
                url,
                anchor_text: anchor_text(element.text()),
                source_page_url: Some(base_url.to_string()),
            });
        }
    }

    links
}

/// Keeps only links whose URL contains the given fragment
pub fn filter_links(links: Vec<DiscoveredLink>, href_contains: Option<&str>) -> Vec<DiscoveredLink> {
    match href_contains {
        Some(needle) => links
            .into_iter()
            .filter(|link| link.url.contains(needle))
            .collect(),
        None => links,
    }
}

/// Collapses whitespace in the anchor's text nodes
fn anchor_text<'a>(text: impl Iterator<Item = &'a str>) -> Option<String> {
    let joined = text.collect::<Vec<_>>().join(" ");
    let collapsed = joined.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// Resolves a link href to an absolute URL and validates it
///
/// Returns None if the link should be excluded:
/// - javascript:, mailto:, tel: schemes
/// - data: URIs
/// - Invalid URLs
/// - Non-HTTP(S) URLs after resolution
fn resolve_link(href: &str, base_url: &Url) -> Option<String> {
    let href = href.trim();

    if href.is_empty() || href.starts_with('#') {
        return None;
    }

    let lowered = href.to_ascii_lowercase();
    if ["javascript:", "mailto:", "tel:", "data:"]
        .iter()
        .any(|scheme| lowered.starts_with(scheme))
    {
        return None;
    }

    let absolute_url = base_url.join(href).ok()?;
    if absolute_url.scheme() == "http" || absolute_url.scheme() == "https" {
        Some(absolute_url.to_string())
    } else {
        None
    }
}
