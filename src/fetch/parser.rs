use anyhow::Result;
use feed_rs::parser;

use crate::storage::NewItem;

/// Result of parsing one syndication payload.
pub struct ParseOutcome {
    pub items: Vec<NewItem>,
    /// Entries dropped because they carry no link. The link is the
    /// article's identity; an entry without one cannot be stored.
    pub skipped: usize,
}

/// Parse an RSS/Atom payload into store-ready items.
pub fn parse_feed(bytes: &[u8]) -> Result<ParseOutcome> {
    let feed = parser::parse(bytes)?;

    let total = feed.entries.len();
    let items: Vec<NewItem> = feed
        .entries
        .into_iter()
        .filter_map(|entry| {
            let link = entry.links.first().map(|l| l.href.clone())?;
            let published = entry.published.or(entry.updated).map(|dt| dt.timestamp());
            let content = entry
                .content
                .and_then(|c| c.body)
                .or_else(|| entry.summary.map(|s| s.content));
            let title = entry
                .title
                .map(|t| t.content)
                .unwrap_or_else(|| "Untitled".to_string());

            Some(NewItem {
                link,
                title,
                published,
                content,
            })
        })
        .collect();

    let skipped = total - items.len();
    Ok(ParseOutcome { items, skipped })
}
