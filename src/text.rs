//! Small text helpers shared by the sync engine, cache service, and
//! outbound mail: snippets, HTML stripping, safe truncation, filename slugs.

use regex::Regex;
use std::sync::OnceLock;

pub const SNIPPET_MAX_CHARS: usize = 160;

/// Collapse all whitespace runs (including CR/LF) into single spaces.
pub fn squish(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Truncate to at most `max` characters, appending `...` when cut.
/// Character-based so multibyte input never splits a code point.
pub fn truncate_chars(value: &str, max: usize) -> String {
    if value.chars().count() <= max {
        return value.to_string();
    }

    let mut truncated: String = value.chars().take(max).collect();
    truncated.push_str("...");
    truncated
}

/// Plain-text preview: prefer the text body, fall back to stripped HTML,
/// squish whitespace, cap at 160 characters.
pub fn snippet(text_body: Option<&str>, html_body: Option<&str>) -> String {
    let body = match text_body {
        Some(text) if !text.trim().is_empty() => text.to_string(),
        _ => html_to_text(html_body.unwrap_or_default()),
    };

    truncate_chars(&squish(&body), SNIPPET_MAX_CHARS)
}

/// Strip tags and decode the handful of entities that matter for previews.
pub fn html_to_text(html: &str) -> String {
    let without_tags = html_tag_regex().replace_all(html, " ");
    let decoded = without_tags
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");

    squish(&decoded)
}

/// Escape text for embedding in an HTML body.
pub fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

/// Filesystem-safe attachment name: slugged stem plus the original
/// extension (`bin` when absent).
pub fn slugify_filename(filename: &str) -> String {
    let (stem, extension) = match filename.rsplit_once('.') {
        Some((stem, extension)) if !stem.is_empty() && !extension.is_empty() => (stem, extension),
        _ => (filename, "bin"),
    };

    let mut slug = String::new();
    let mut last_dash = true;
    for character in stem.to_ascii_lowercase().chars() {
        if character.is_ascii_alphanumeric() {
            slug.push(character);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }

    let slug = slug.trim_matches('-');
    let slug = if slug.is_empty() { "attachment" } else { slug };
    format!("{slug}.{}", extension.to_ascii_lowercase())
}

fn html_tag_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"(?is)<[^>]+>").expect("valid HTML tag regex"))
}
