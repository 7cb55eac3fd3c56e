//! Full-text search over a blogsearch database image.
//!
//! Drives the worker channel: opens a database image, issues FTS queries
//! against the indexed table, and formats rows into suggestions ready for
//! an autocomplete consumer. Rendering, templates and keyboard handling
//! live with that consumer, not here.

mod config;

pub use config::SearchConfig;

use std::collections::HashMap;

use blogsearch_engine::{Params, Value};
use blogsearch_worker::{ChannelClient, ChannelError};
use serde::Serialize;
use thiserror::Error;

/// Name of the indexed virtual table inside the database image.
const TABLE: &str = "blogsearch";
/// Index of the body column, the snippet source.
const BODY_COLUMN: u32 = 1;
/// Snippet length in tokens around the match.
const SNIPPET_TOKENS: u32 = 10;
/// Internal snippet markers, rewritten to the configured markup after
/// escaping. Chosen to pass through XML escaping untouched.
const MARK_PRE: &str = "{{%%%";
const MARK_POST: &str = "%%%}}";

pub type Result<T> = std::result::Result<T, SearchError>;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("failed to start the search worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// One chip: a single tag or category label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chip {
    pub value: String,
}

/// A formatted search hit.
#[derive(Debug, Clone, Serialize)]
pub struct Suggestion {
    pub title: String,
    pub body: String,
    pub body_highlight: String,
    pub url: String,
    pub categories: Vec<Chip>,
    pub tags: Vec<Chip>,
}

/// The search engine facade: one worker channel, one open database.
pub struct BlogSearch {
    client: ChannelClient,
    config: SearchConfig,
}

impl BlogSearch {
    /// Start a worker, load the engine, and open `db_image`.
    pub fn open(db_image: Vec<u8>, config: SearchConfig) -> Result<Self> {
        let mut client = blogsearch_worker::spawn()?;
        client.init()?;
        client.open(db_image)?;
        Ok(Self { client, config })
    }

    /// Query the index, returning up to `limit` suggestions ordered by
    /// relevance. `limit` falls back to the configured default.
    ///
    /// The term is bound as a parameter, so FTS query syntax inside it
    /// (prefixes, AND/OR) still applies while the SQL text stays fixed.
    pub fn search(&mut self, term: &str, limit: Option<usize>) -> Result<Vec<Suggestion>> {
        let limit = limit.unwrap_or(self.config.limit);
        let sql = format!(
            "SELECT *, snippet({TABLE}, {BODY_COLUMN}, '{MARK_PRE}', '{MARK_POST}', '', \
             {SNIPPET_TOKENS}) AS body_highlight \
             FROM {TABLE} WHERE {TABLE} MATCH ?1 ORDER BY bm25({TABLE}) LIMIT ?2"
        );
        let params = Params::positional([
            Value::Text(term.to_string()),
            Value::Integer(limit as i64),
        ]);
        tracing::debug!(term, limit, "search");
        let mut rows = Vec::new();
        self.client.each(&sql, Some(params), |row| rows.push(row))?;
        Ok(rows
            .into_iter()
            .filter_map(|row| self.suggestion(row))
            .collect())
    }

    fn suggestion(&self, mut row: HashMap<String, Value>) -> Option<Suggestion> {
        let title = take_text(&mut row, "title");
        if title.is_empty() {
            // Rows without a title render as nothing useful.
            return None;
        }
        let raw_highlight = take_text(&mut row, "body_highlight");
        let body_highlight = escape_xml(&raw_highlight)
            .replace(MARK_PRE, &self.config.highlight_pre)
            .replace(MARK_POST, &self.config.highlight_post);
        Some(Suggestion {
            title,
            body: take_text(&mut row, "body"),
            body_highlight,
            url: take_text(&mut row, "url"),
            categories: chips(&take_text(&mut row, "categories")),
            tags: chips(&take_text(&mut row, "tags")),
        })
    }

    /// Snapshot the open database as a raw file image.
    pub fn export(&mut self) -> Result<Vec<u8>> {
        Ok(self.client.export()?)
    }

    /// Close the database and shut the worker down.
    pub fn close(mut self) -> Result<()> {
        self.client.close()?;
        self.client.terminate();
        Ok(())
    }
}

fn take_text(row: &mut HashMap<String, Value>, key: &str) -> String {
    match row.remove(key) {
        Some(Value::Text(s)) => s,
        Some(Value::Integer(i)) => i.to_string(),
        Some(Value::Real(f)) => f.to_string(),
        _ => String::new(),
    }
}

/// Split a comma-joined label column into chips. The denormalized storage
/// keeps the index single-column; splitting is this boundary's job.
fn chips(joined: &str) -> Vec<Chip> {
    joined
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Chip {
            value: s.to_string(),
        })
        .collect()
}

/// Escape XML-significant characters per the W3C recommendation.
fn escape_xml(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use blogsearch_engine::{Engine, EngineConfig};

    use super::*;

    /// Build a database image with the indexed table and the given rows
    /// of (title, body, url, categories, tags).
    fn db_image(rows: &[(&str, &str, &str, &str, &str)]) -> Vec<u8> {
        let engine = Engine::load(EngineConfig::default()).expect("engine");
        let conn = engine.open(None).expect("open");
        conn.run(
            "CREATE VIRTUAL TABLE blogsearch USING fts5(title, body, url, categories, tags)",
            None,
        )
        .expect("create index");
        for row in rows {
            conn.run(
                "INSERT INTO blogsearch VALUES (?1, ?2, ?3, ?4, ?5)",
                Some(&Params::positional([
                    Value::Text(row.0.into()),
                    Value::Text(row.1.into()),
                    Value::Text(row.2.into()),
                    Value::Text(row.3.into()),
                    Value::Text(row.4.into()),
                ])),
            )
            .expect("insert");
        }
        let image = conn.export().expect("export");
        conn.close().expect("close");
        image
    }

    #[test]
    fn search_formats_tags_and_categories_into_chips() {
        let image = db_image(&[(
            "A post",
            "the quick brown fox jumps over the lazy dog",
            "https://example.com/a",
            "animals, prose",
            "x,y",
        )]);
        let mut search = BlogSearch::open(image, SearchConfig::default()).expect("open");
        let suggestions = search.search("fox", None).expect("search");
        assert_eq!(suggestions.len(), 1);
        let hit = &suggestions[0];
        assert_eq!(hit.title, "A post");
        assert_eq!(hit.url, "https://example.com/a");
        assert_eq!(
            hit.tags,
            vec![Chip { value: "x".into() }, Chip { value: "y".into() }]
        );
        assert_eq!(
            hit.categories,
            vec![
                Chip { value: "animals".into() },
                Chip { value: "prose".into() }
            ]
        );
        search.close().expect("close");
    }

    #[test]
    fn search_highlights_the_match_with_configured_markup() {
        let image = db_image(&[(
            "Highlighted",
            "rust makes systems programming approachable",
            "https://example.com/hl",
            "",
            "",
        )]);
        let config = SearchConfig {
            highlight_pre: "<em>".into(),
            highlight_post: "</em>".into(),
            ..SearchConfig::default()
        };
        let mut search = BlogSearch::open(image, config).expect("open");
        let suggestions = search.search("systems", None).expect("search");
        assert_eq!(suggestions.len(), 1);
        let hit = &suggestions[0];
        assert!(hit.body_highlight.contains("<em>systems</em>"), "got: {}", hit.body_highlight);
        assert!(hit.tags.is_empty());
        assert!(hit.categories.is_empty());
        search.close().expect("close");
    }

    #[test]
    fn search_escapes_markup_in_the_snippet() {
        let image = db_image(&[(
            "Escaped",
            "watch out for <b>bold & dangerous</b> markup",
            "https://example.com/esc",
            "",
            "",
        )]);
        let mut search = BlogSearch::open(image, SearchConfig::default()).expect("open");
        let suggestions = search.search("dangerous", None).expect("search");
        assert_eq!(suggestions.len(), 1);
        let highlight = &suggestions[0].body_highlight;
        assert!(highlight.contains("&lt;b&gt;"), "got: {highlight}");
        assert!(highlight.contains("&amp;"), "got: {highlight}");
        assert!(!highlight.contains("<b>"), "got: {highlight}");
    }

    #[test]
    fn rows_without_a_title_are_filtered_out() {
        let image = db_image(&[
            ("", "shared token here", "https://example.com/untitled", "", ""),
            ("Titled", "shared token here", "https://example.com/titled", "", ""),
        ]);
        let mut search = BlogSearch::open(image, SearchConfig::default()).expect("open");
        let suggestions = search.search("token", None).expect("search");
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].title, "Titled");
        search.close().expect("close");
    }

    #[test]
    fn limit_caps_the_suggestion_count() {
        let rows: Vec<(String, String, String)> = (0..8)
            .map(|i| {
                (
                    format!("Post {i}"),
                    "repeated corpus token".to_string(),
                    format!("https://example.com/{i}"),
                )
            })
            .collect();
        let borrowed: Vec<(&str, &str, &str, &str, &str)> = rows
            .iter()
            .map(|(t, b, u)| (t.as_str(), b.as_str(), u.as_str(), "", ""))
            .collect();
        let image = db_image(&borrowed);
        let mut search = BlogSearch::open(image, SearchConfig::default()).expect("open");
        assert_eq!(search.search("corpus", None).expect("default").len(), 5);
        assert_eq!(search.search("corpus", Some(2)).expect("explicit").len(), 2);
        assert_eq!(search.search("corpus", Some(100)).expect("all").len(), 8);
        search.close().expect("close");
    }

    #[test]
    fn no_match_yields_no_suggestions() {
        let image = db_image(&[(
            "Only",
            "nothing to see",
            "https://example.com/only",
            "",
            "",
        )]);
        let mut search = BlogSearch::open(image, SearchConfig::default()).expect("open");
        assert!(search.search("absent", None).expect("search").is_empty());
        search.close().expect("close");
    }

    #[test]
    fn chips_trim_and_drop_empty_fragments() {
        assert_eq!(
            chips(" x , y,,z "),
            vec![
                Chip { value: "x".into() },
                Chip { value: "y".into() },
                Chip { value: "z".into() }
            ]
        );
        assert!(chips("").is_empty());
    }

    #[test]
    fn escape_xml_covers_the_three_specials() {
        assert_eq!(escape_xml("a<b>&c"), "a&lt;b&gt;&amp;c");
        assert_eq!(escape_xml("plain"), "plain");
    }
}
