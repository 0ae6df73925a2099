use std::borrow::Cow;
use std::collections::HashSet;

/// Ellipsis marker appended when text is cut off.
const ELLIPSIS: &str = "...";

/// Strips control characters from a string (ANSI escape injection prevention).
///
/// Keeps `\n` and `\t`; everything else below U+0020 plus DEL is removed.
/// Returns a borrowed `Cow` when the input is already clean.
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    if s.chars().any(|c| c.is_control() && c != '\n' && c != '\t') {
        Cow::Owned(
            s.chars()
                .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
                .collect(),
        )
    } else {
        Cow::Borrowed(s)
    }
}

/// Converts HTML markup to plain text for prompt input and token overlap.
///
/// Falls back to the raw input when the HTML is too broken to render; the
/// summarizer would rather see tag soup than nothing.
pub fn strip_html(html: &str) -> String {
    // Wide enough that wrapping never splits a sentence the summarizer
    // would care about; html2text rejects unbounded widths.
    match html2text::from_read(html.as_bytes(), 500) {
        Ok(text) => text.trim().to_string(),
        Err(e) => {
            tracing::debug!(error = %e, "HTML rendering failed, using raw text");
            html.trim().to_string()
        }
    }
}

/// Truncates a string to at most `max_chars` characters on a char boundary.
///
/// Returns `Cow::Borrowed` when the string already fits (no allocation).
pub fn truncate_chars(s: &str, max_chars: usize) -> Cow<'_, str> {
    match s.char_indices().nth(max_chars) {
        None => Cow::Borrowed(s),
        Some((byte_idx, _)) => Cow::Owned(s[..byte_idx].to_string()),
    }
}

/// Hard-caps a string at `max_words` whitespace-separated words.
///
/// The result is trimmed; if anything was cut off, an `...` marker is
/// appended so truncation is visible to the reader.
pub fn cap_words(s: &str, max_words: usize) -> String {
    let trimmed = s.trim();
    let mut words = trimmed.split_whitespace();
    let capped: Vec<&str> = words.by_ref().take(max_words).collect();
    if words.next().is_some() {
        format!("{}{}", capped.join(" "), ELLIPSIS)
    } else {
        capped.join(" ")
    }
}

/// Lowercased alphanumeric tokens of length >= 3.
///
/// Short tokens (articles, prepositions) carry no signal for similarity
/// scoring and only inflate the denominator of the Jaccard overlap.
pub fn tokenize(s: &str) -> HashSet<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 3)
        .map(|t| t.to_lowercase())
        .collect()
}

/// Jaccard overlap of the token sets of two strings, in `[0.0, 1.0]`.
///
/// Two empty token sets score 0.0, not 1.0 — absence of signal is not
/// evidence of similarity.
pub fn token_overlap(a: &str, b: &str) -> f64 {
    let ta = tokenize(a);
    let tb = tokenize(b);
    let union = ta.union(&tb).count();
    if union == 0 {
        return 0.0;
    }
    let intersection = ta.intersection(&tb).count();
    intersection as f64 / union as f64
}

/// Extracts the host component of a URL, lowercased.
pub fn host_of(link: &str) -> Option<String> {
    url::Url::parse(link)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
}
