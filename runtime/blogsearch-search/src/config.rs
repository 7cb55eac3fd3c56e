//! Search configuration.

use serde::{Deserialize, Serialize};

pub(crate) const DEFAULT_LIMIT: usize = 5;
pub(crate) const DEFAULT_HIGHLIGHT_PRE: &str =
    "<span class=\"blogsearch-suggestion--highlight\">";
pub(crate) const DEFAULT_HIGHLIGHT_POST: &str = "</span>";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Maximum suggestions per query when the caller gives no limit.
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Markup inserted before each highlighted fragment.
    #[serde(default = "default_highlight_pre")]
    pub highlight_pre: String,
    /// Markup inserted after each highlighted fragment.
    #[serde(default = "default_highlight_post")]
    pub highlight_post: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            highlight_pre: DEFAULT_HIGHLIGHT_PRE.to_string(),
            highlight_post: DEFAULT_HIGHLIGHT_POST.to_string(),
        }
    }
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

fn default_highlight_pre() -> String {
    DEFAULT_HIGHLIGHT_PRE.to_string()
}

fn default_highlight_post() -> String {
    DEFAULT_HIGHLIGHT_POST.to_string()
}
