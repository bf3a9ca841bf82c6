//! The `Context` value object and its type tag.
//!
//! A context is the unit that flows through the whole pipeline: chunkers
//! produce them, composers merge them and storage backends persist them.
//! Links to other contexts (`parent_id`, `chunks`) are plain ids and are
//! never resolved to owning pointers.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ContextError, Result};

/// Default importance assigned to new contexts.
pub const DEFAULT_IMPORTANCE: f64 = 0.5;

/// Crude token estimate: one token per four characters.
pub fn estimate_tokens(content: &str) -> usize {
    content.chars().count() / 4
}

/// Kind of content a context carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextType {
    #[default]
    Text,
    Code,
    Conversation,
    Document,
    Knowledge,
    Task,
    System,
    User,
    Custom,
}

impl ContextType {
    pub const ALL: [ContextType; 9] = [
        ContextType::Text,
        ContextType::Code,
        ContextType::Conversation,
        ContextType::Document,
        ContextType::Knowledge,
        ContextType::Task,
        ContextType::System,
        ContextType::User,
        ContextType::Custom,
    ];

    /// Lowercase name used in storage keys and metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextType::Text => "text",
            ContextType::Code => "code",
            ContextType::Conversation => "conversation",
            ContextType::Document => "document",
            ContextType::Knowledge => "knowledge",
            ContextType::Task => "task",
            ContextType::System => "system",
            ContextType::User => "user",
            ContextType::Custom => "custom",
        }
    }
}

impl fmt::Display for ContextType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextType {
    type Err = ContextError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == lower)
            .ok_or_else(|| ContextError::UnknownContextType(s.to_string()))
    }
}

/// A unit of content plus the metadata needed to retrieve it.
///
/// `id`, `content`, `tokens` and the timestamps are private so that the
/// token estimate always matches the last content set and `updated_at`
/// moves whenever content or metadata change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    id: String,

    content: String,

    pub context_type: ContextType,

    /// Open metadata map (chunk positions, composer info, caller data).
    pub metadata: HashMap<String, Value>,

    created_at: DateTime<Utc>,

    updated_at: DateTime<Utc>,

    pub expires_at: Option<DateTime<Utc>>,

    /// Importance in `[0, 1]`, used only as a search filter.
    pub importance: f64,

    /// Vector produced by an external embedding producer.
    pub embedding: Option<Vec<f32>>,

    tokens: usize,

    /// Ids of child contexts (weak references).
    pub chunks: Vec<String>,

    /// Id of the context this one was derived from (weak reference).
    pub parent_id: Option<String>,

    /// Origin of the content (file path, URL, ...).
    pub source: Option<String>,

    pub tags: Vec<String>,
}

impl Context {
    /// Create a new context with a generated id.
    pub fn new(content: impl Into<String>, context_type: ContextType) -> Self {
        let content = content.into();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            tokens: estimate_tokens(&content),
            content,
            context_type,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
            expires_at: None,
            importance: DEFAULT_IMPORTANCE,
            embedding: None,
            chunks: Vec::new(),
            parent_id: None,
            source: None,
            tags: Vec::new(),
        }
    }

    /// Create an empty text context.
    pub fn empty() -> Self {
        Self::new(String::new(), ContextType::Text)
    }

    /// Use a caller-provided id instead of a generated one.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set a metadata key.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Set the source the content came from.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Add tags, skipping duplicates.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for tag in tags {
            self.push_tag(tag.into());
        }
        self
    }

    /// Set the parent context id.
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Set the importance, clamped to `[0, 1]`.
    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = importance.clamp(0.0, 1.0);
        self
    }

    /// Set when the context stops being valid.
    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Attach a precomputed embedding.
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Unique id of this context.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The text content.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Estimated token count of the content.
    pub fn tokens(&self) -> usize {
        self.tokens
    }

    /// When the context was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// When the content or metadata last changed.
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Replace content and/or merge metadata, bumping `updated_at`.
    pub fn update(&mut self, content: Option<&str>, metadata: Option<HashMap<String, Value>>) {
        if let Some(content) = content {
            self.content = content.to_string();
            self.tokens = estimate_tokens(&self.content);
        }
        if let Some(metadata) = metadata {
            self.metadata.extend(metadata);
        }
        self.touch();
    }

    /// Set a single metadata key.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
        self.touch();
    }

    /// Add a tag unless it is already present.
    pub fn add_tag(&mut self, tag: impl Into<String>) {
        if self.push_tag(tag.into()) {
            self.touch();
        }
    }

    /// Remove a tag; returns whether it was present.
    pub fn remove_tag(&mut self, tag: &str) -> bool {
        let before = self.tags.len();
        self.tags.retain(|t| t != tag);
        let removed = self.tags.len() != before;
        if removed {
            self.touch();
        }
        removed
    }

    /// Whether the context carries `tag`.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Record a child context id.
    pub fn add_chunk(&mut self, chunk_id: impl Into<String>) {
        let chunk_id = chunk_id.into();
        if !self.chunks.contains(&chunk_id) {
            self.chunks.push(chunk_id);
            self.touch();
        }
    }

    /// Whether `expires_at` has passed.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// True iff `expires_at` is set and lies before `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }

    /// Persisted JSON representation.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Rebuild a context from its persisted representation.
    ///
    /// Missing optional fields take their defaults; a missing id is
    /// generated and a missing token count is recomputed from content.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut map) = value else {
            return Err(ContextError::InvalidOptions(
                "context must be a JSON object".to_string(),
            ));
        };

        let now = Value::String(Utc::now().to_rfc3339());
        map.entry("id")
            .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
        map.entry("content")
            .or_insert_with(|| Value::String(String::new()));
        map.entry("context_type")
            .or_insert_with(|| Value::String(ContextType::Text.as_str().to_string()));
        map.entry("metadata")
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        map.entry("created_at").or_insert_with(|| now.clone());
        map.entry("updated_at").or_insert(now);
        map.entry("expires_at").or_insert(Value::Null);
        map.entry("importance")
            .or_insert_with(|| Value::from(DEFAULT_IMPORTANCE));
        map.entry("embedding").or_insert(Value::Null);
        map.entry("chunks").or_insert_with(|| Value::Array(Vec::new()));
        map.entry("parent_id").or_insert(Value::Null);
        map.entry("source").or_insert(Value::Null);
        map.entry("tags").or_insert_with(|| Value::Array(Vec::new()));

        let recompute_tokens = !map.contains_key("tokens");
        map.entry("tokens").or_insert_with(|| Value::from(0));

        let mut context: Context = serde_json::from_value(Value::Object(map))?;
        if recompute_tokens {
            context.tokens = estimate_tokens(&context.content);
        }
        Ok(context)
    }

    /// Serialize to the persisted JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse the persisted JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(json)?)
    }

    /// Override the token count (used by composers that report input totals).
    pub(crate) fn set_tokens(&mut self, tokens: usize) {
        self.tokens = tokens;
    }

    fn push_tag(&mut self, tag: String) -> bool {
        if self.tags.contains(&tag) {
            return false;
        }
        self.tags.push(tag);
        true
    }

    fn touch(&mut self) {
        let now = Utc::now();
        // Keep created_at <= updated_at even if the wall clock steps back.
        self.updated_at = now.max(self.created_at);
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::empty()
    }
}
