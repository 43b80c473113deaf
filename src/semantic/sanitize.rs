//! Note text sanitization for embedding generation.
//!
//! Turns raw note text into the ordered list of sentences that get embedded:
//! 1. Parse each line as inline markup and keep only its text content
//! 2. Break sentences on runs of `.`
//! 3. Break sentences on runs of `#`, blank out single `#` header markers
//! 4. Split, trim and drop empty pieces

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::Html;

static DOTS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.+").expect("valid regex"));
static HASH_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"#{2,}").expect("valid regex"));

/// A line of the note could not be parsed as markup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed markup on line {line}: {reason}")]
pub struct SanitizationError {
    /// 1-based line number inside the sanitized text
    pub line: usize,
    pub reason: String,
}

/// Split raw note text into clean sentences, preserving input order.
///
/// Fails on the first line whose markup does not parse cleanly.
pub fn sanitize(raw: &str) -> Result<Vec<String>, SanitizationError> {
    let mut sentences = Vec::new();

    for (idx, line) in raw.lines().enumerate() {
        let text = extract_text(line).map_err(|reason| SanitizationError {
            line: idx + 1,
            reason,
        })?;

        sentences.extend(split_sentences(&text));
    }

    Ok(sentences)
}

/// Same as [`sanitize`], rejoined into a single line of text.
///
/// Used for search queries, which are embedded as one logical unit.
pub fn sanitize_query(raw: &str) -> Result<Option<String>, SanitizationError> {
    let sentences = sanitize(raw)?;
    if sentences.is_empty() {
        return Ok(None);
    }

    Ok(Some(sentences.join(" ")))
}

/// Parse a line as an HTML fragment and return its text content.
///
/// `&` and `<` in the text come back escaped, so the output parses to
/// itself again.
fn extract_text(line: &str) -> Result<String, String> {
    if !line.contains('<') && !line.contains('&') {
        return Ok(line.to_string());
    }

    let fragment = Html::parse_fragment(line);
    if let Some(err) = fragment.errors.first() {
        return Err(err.to_string());
    }

    let text: String = fragment.root_element().text().collect();
    Ok(text.replace('&', "&amp;").replace('<', "&lt;"))
}

fn split_sentences(text: &str) -> Vec<String> {
    let text = DOTS.replace_all(text, "\n");
    let text = HASH_RUNS.replace_all(&text, "\n");
    let text = text.replace('#', " ");

    text.trim()
        .split(['\n', '\r'])
        .map(str::trim)
        .filter(|piece| !piece.is_empty())
        .map(str::to_string)
        .collect()
}
