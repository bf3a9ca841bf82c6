//! Search filters shared by every storage backend.

use ctxflow_context::{Context, ContextType};
use serde::{Deserialize, Serialize};

/// Filters accepted by `search_contexts`. All set filters must match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchFilters {
    pub context_type: Option<ContextType>,
    pub source: Option<String>,
    /// Every listed tag must be present on the context.
    pub tags: Vec<String>,
    pub min_importance: Option<f64>,
    pub max_tokens: Option<usize>,
}

impl SearchFilters {
    /// Filters that match everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Only match contexts of this type.
    pub fn with_context_type(mut self, context_type: ContextType) -> Self {
        self.context_type = Some(context_type);
        self
    }

    /// Only match contexts from this source.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Only match contexts carrying every one of these tags.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Only match contexts at least this important.
    pub fn with_min_importance(mut self, min_importance: f64) -> Self {
        self.min_importance = Some(min_importance);
        self
    }

    /// Only match contexts at most this many tokens long.
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Whether no filter is set.
    pub fn is_empty(&self) -> bool {
        !self.has_index_filters() && self.min_importance.is_none() && self.max_tokens.is_none()
    }

    /// True when a type, source or tag filter is set.
    pub fn has_index_filters(&self) -> bool {
        self.context_type.is_some() || self.source.is_some() || !self.tags.is_empty()
    }

    /// Whether `context` carries every required tag.
    pub fn matches_tags(&self, context: &Context) -> bool {
        self.tags.iter().all(|tag| context.has_tag(tag))
    }

    /// Importance and token bounds.
    pub fn matches_bounds(&self, context: &Context) -> bool {
        self.min_importance
            .is_none_or(|min| context.importance >= min)
            && self.max_tokens.is_none_or(|max| context.tokens() <= max)
    }

    /// Whether `context` passes every filter.
    pub fn matches(&self, context: &Context) -> bool {
        self.context_type.is_none_or(|t| context.context_type == t)
            && self
                .source
                .as_deref()
                .is_none_or(|s| context.source.as_deref() == Some(s))
            && self.matches_tags(context)
            && self.matches_bounds(context)
    }
}
