//! Chunkers that split raw content into ordered `Context` chunks.
//!
//! All chunkers share the same building blocks: a fixed-size window with
//! overlap, and an accumulator that packs whole pieces (paragraphs,
//! sentences, code blocks) into chunks and seeds each new chunk with the
//! tail of the previous one. Sizes are counted in characters.

use std::sync::LazyLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::context::{Context, ContextType};
use crate::error::{ContextError, Result};

/// Default chunk size in characters.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Default overlap between consecutive chunks in characters.
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

/// Default language assumed by the code chunker.
pub const DEFAULT_CODE_LANGUAGE: &str = "python";

// Patterns are literals; failing to compile them is a programming error.
#[allow(clippy::expect_used)]
fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static chunker pattern must compile")
}

static PARAGRAPH_BREAK: LazyLock<Regex> = LazyLock::new(|| compile(r"\n\s*\n"));

static SENTENCE_BREAK: LazyLock<Regex> = LazyLock::new(|| compile(r"[.!?]+\s+"));

static PY_FUNCTION: LazyLock<Regex> =
    LazyLock::new(|| compile(r"^[ \t]*(?:async[ \t]+)?def[ \t]+\w+"));

static PY_CLASS: LazyLock<Regex> = LazyLock::new(|| compile(r"^class[ \t]+\w+"));

/// How a chunker should locate chunk boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStrategy {
    Fixed,
    Paragraph,
    Sentence,
    Function,
    Class,
    Semantic,
}

impl ChunkStrategy {
    /// Name recorded in chunk metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStrategy::Fixed => "fixed",
            ChunkStrategy::Paragraph => "paragraph",
            ChunkStrategy::Sentence => "sentence",
            ChunkStrategy::Function => "function",
            ChunkStrategy::Class => "class",
            ChunkStrategy::Semantic => "semantic",
        }
    }
}

/// Per-call chunking options. Unset fields fall back to the chunker's defaults.
#[derive(Debug, Clone, Default)]
pub struct ChunkOptions {
    pub chunk_size: Option<usize>,
    pub chunk_overlap: Option<usize>,
    pub strategy: Option<ChunkStrategy>,
    pub parent_id: Option<String>,
    pub source: Option<String>,
    pub tags: Vec<String>,
    /// Source language for the code chunker.
    pub language: Option<String>,
    /// Capability flag for the semantic chunker.
    pub embedding_model: Option<String>,
}

impl ChunkOptions {
    /// Options that use the chunker's defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the chunk size, in characters.
    pub fn with_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    /// Override the overlap between chunks, in characters.
    pub fn with_overlap(mut self, chunk_overlap: usize) -> Self {
        self.chunk_overlap = Some(chunk_overlap);
        self
    }

    /// Override the chunking strategy.
    pub fn with_strategy(mut self, strategy: ChunkStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Set the parent id on every chunk.
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Set the source on every chunk.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Add tags to every chunk.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Override the source language for code.
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Override the embedding model.
    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = Some(model.into());
        self
    }

    /// Resolve size and overlap against defaults and validate them.
    fn window(&self, default_size: usize, default_overlap: usize) -> Result<(usize, usize)> {
        let size = self.chunk_size.unwrap_or(default_size);
        let overlap = self.chunk_overlap.unwrap_or(default_overlap);
        if size == 0 {
            return Err(ContextError::InvalidOptions(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        if overlap >= size {
            return Err(ContextError::InvalidOptions(format!(
                "chunk_overlap ({overlap}) must be smaller than chunk_size ({size})"
            )));
        }
        Ok((size, overlap))
    }
}

/// Splits content into an ordered sequence of contexts.
pub trait Chunker: Send + Sync {
    /// Short name recorded in `metadata.chunker`.
    fn name(&self) -> &'static str;

    /// Split `content` into chunks of the given type.
    fn chunk(
        &self,
        content: &str,
        context_type: ContextType,
        options: &ChunkOptions,
    ) -> Result<Vec<Context>>;
}

/// Fixed-size windows with overlap.
///
/// The first window is `[0, size)`; each following window starts `overlap`
/// characters before the previous end. Content no longer than `size` comes
/// back as a single piece. `overlap` is capped below `size` so the window
/// always advances.
pub fn fixed_size_split(content: &str, size: usize, overlap: usize) -> Vec<String> {
    let size = size.max(1);
    let overlap = overlap.min(size - 1);
    let bounds = char_bounds(content);
    let len = bounds.len() - 1;
    if len <= size {
        return vec![content.to_string()];
    }

    let mut pieces = vec![content[..bounds[size]].to_string()];
    let mut prev_end = size;
    while prev_end < len {
        let start = prev_end.saturating_sub(overlap);
        let end = (start + size).min(len);
        pieces.push(content[bounds[start]..bounds[end]].to_string());
        prev_end = end;
    }
    pieces
}

/// Byte offsets of every char boundary, including the end of the string.
fn char_bounds(content: &str) -> Vec<usize> {
    content
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(content.len()))
        .collect()
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// The last `n` characters of `s`.
fn tail_chars(s: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    match s.char_indices().rev().nth(n - 1) {
        Some((i, _)) => &s[i..],
        None => s,
    }
}

/// Pack whole pieces into chunks of at most `size` characters.
///
/// When the next piece does not fit, the current chunk is flushed and the
/// next one starts with the last `overlap` characters of the flushed chunk.
/// A single piece larger than `size` is kept intact.
fn accumulate<'a>(
    pieces: impl IntoIterator<Item = &'a str>,
    joiner: &str,
    size: usize,
    overlap: usize,
) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for piece in pieces {
        if current.is_empty() {
            current.push_str(piece);
            continue;
        }
        if char_len(&current) + char_len(joiner) + char_len(piece) > size {
            let seed = tail_chars(&current, overlap).to_string();
            chunks.push(std::mem::take(&mut current));
            if !seed.is_empty() {
                current.push_str(&seed);
                current.push_str(joiner);
            }
            current.push_str(piece);
        } else {
            current.push_str(joiner);
            current.push_str(piece);
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn split_paragraphs(content: &str) -> Vec<&str> {
    PARAGRAPH_BREAK
        .split(content)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

fn split_sentences(content: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut last = 0;
    for m in SENTENCE_BREAK.find_iter(content) {
        sentences.push(content[last..m.end()].trim());
        last = m.end();
    }
    sentences.push(content[last..].trim());
    sentences.retain(|s| !s.is_empty());
    sentences
}

/// Turn text pieces into chunk contexts with position metadata.
fn build_chunks(
    pieces: Vec<String>,
    context_type: ContextType,
    options: &ChunkOptions,
    chunker: &str,
    strategy: &str,
    extra: &[(&str, Value)],
) -> Vec<Context> {
    let count = pieces.len();
    pieces
        .into_iter()
        .enumerate()
        .map(|(index, piece)| {
            let mut ctx = Context::new(piece, context_type)
                .with_tags(options.tags.iter().cloned())
                .with_metadata("chunk_index", index)
                .with_metadata("chunk_count", count)
                .with_metadata("chunker", chunker)
                .with_metadata("strategy", strategy);
            for (key, value) in extra {
                ctx = ctx.with_metadata(*key, value.clone());
            }
            if let Some(parent_id) = &options.parent_id {
                ctx = ctx.with_parent(parent_id.clone());
            }
            if let Some(source) = &options.source {
                ctx = ctx.with_source(source.clone());
            }
            ctx
        })
        .collect()
}

/// Chunker for prose: paragraph, sentence or fixed-size boundaries.
#[derive(Debug, Clone)]
pub struct TextChunker {
    chunk_size: usize,
    chunk_overlap: usize,
    strategy: ChunkStrategy,
}

impl TextChunker {
    /// Paragraph chunker with the default window.
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            strategy: ChunkStrategy::Paragraph,
        }
    }

    /// Set the default chunk size and overlap.
    pub fn with_size(mut self, chunk_size: usize, chunk_overlap: usize) -> Self {
        self.chunk_size = chunk_size;
        self.chunk_overlap = chunk_overlap;
        self
    }

    /// Set the default strategy.
    pub fn with_strategy(mut self, strategy: ChunkStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    fn split(
        &self,
        content: &str,
        strategy: ChunkStrategy,
        size: usize,
        overlap: usize,
    ) -> Result<Vec<String>> {
        match strategy {
            ChunkStrategy::Fixed => Ok(fixed_size_split(content, size, overlap)),
            ChunkStrategy::Paragraph => {
                Ok(accumulate(split_paragraphs(content), "\n\n", size, overlap))
            }
            ChunkStrategy::Sentence => Ok(accumulate(split_sentences(content), " ", size, overlap)),
            other => Err(ContextError::InvalidOptions(format!(
                "text chunker does not support the {} strategy",
                other.as_str()
            ))),
        }
    }
}

impl Default for TextChunker {
    fn default() -> Self {
        Self::new()
    }
}

impl Chunker for TextChunker {
    fn name(&self) -> &'static str {
        "text"
    }

    fn chunk(
        &self,
        content: &str,
        context_type: ContextType,
        options: &ChunkOptions,
    ) -> Result<Vec<Context>> {
        let (size, overlap) = options.window(self.chunk_size, self.chunk_overlap)?;
        let strategy = options.strategy.unwrap_or(self.strategy);
        let pieces = self.split(content, strategy, size, overlap)?;
        debug!(
            "Text chunker produced {} chunks ({} strategy)",
            pieces.len(),
            strategy.as_str()
        );
        Ok(build_chunks(pieces, context_type, options, self.name(), strategy.as_str(), &[]))
    }
}

/// Chunker for source code. Only Python is understood structurally;
/// other languages are split with fixed-size windows.
#[derive(Debug, Clone)]
pub struct CodeChunker {
    chunk_size: usize,
    chunk_overlap: usize,
    strategy: ChunkStrategy,
    language: String,
}

impl CodeChunker {
    /// Function chunker for Python with the default window.
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            strategy: ChunkStrategy::Function,
            language: DEFAULT_CODE_LANGUAGE.to_string(),
        }
    }

    /// Set the default chunk size and overlap.
    pub fn with_size(mut self, chunk_size: usize, chunk_overlap: usize) -> Self {
        self.chunk_size = chunk_size;
        self.chunk_overlap = chunk_overlap;
        self
    }

    /// Set the default strategy.
    pub fn with_strategy(mut self, strategy: ChunkStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the default language.
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// Split into pieces, returning the strategy that was actually applied.
    fn split(
        &self,
        content: &str,
        strategy: ChunkStrategy,
        language: &str,
        size: usize,
        overlap: usize,
    ) -> Result<(Vec<String>, ChunkStrategy)> {
        if !language.eq_ignore_ascii_case("python") {
            return Ok((fixed_size_split(content, size, overlap), ChunkStrategy::Fixed));
        }

        match strategy {
            ChunkStrategy::Fixed => {
                Ok((fixed_size_split(content, size, overlap), ChunkStrategy::Fixed))
            }
            ChunkStrategy::Class => {
                if let Some(pieces) = chunk_blocks(content, &PY_CLASS, size, overlap) {
                    return Ok((pieces, ChunkStrategy::Class));
                }
                Ok(self.by_function(content, size, overlap))
            }
            ChunkStrategy::Function => Ok(self.by_function(content, size, overlap)),
            other => Err(ContextError::InvalidOptions(format!(
                "code chunker does not support the {} strategy",
                other.as_str()
            ))),
        }
    }

    fn by_function(
        &self,
        content: &str,
        size: usize,
        overlap: usize,
    ) -> (Vec<String>, ChunkStrategy) {
        match chunk_blocks(content, &PY_FUNCTION, size, overlap) {
            Some(pieces) => (pieces, ChunkStrategy::Function),
            None => (fixed_size_split(content, size, overlap), ChunkStrategy::Fixed),
        }
    }
}

impl Default for CodeChunker {
    fn default() -> Self {
        Self::new()
    }
}

impl Chunker for CodeChunker {
    fn name(&self) -> &'static str {
        "code"
    }

    fn chunk(
        &self,
        content: &str,
        context_type: ContextType,
        options: &ChunkOptions,
    ) -> Result<Vec<Context>> {
        let (size, overlap) = options.window(self.chunk_size, self.chunk_overlap)?;
        let strategy = options.strategy.unwrap_or(self.strategy);
        let language = options.language.as_deref().unwrap_or(&self.language);
        let (pieces, applied) = self.split(content, strategy, language, size, overlap)?;
        debug!(
            "Code chunker produced {} chunks ({} strategy, {language})",
            pieces.len(),
            applied.as_str()
        );
        let extra = [("language", Value::from(language))];
        Ok(build_chunks(pieces, context_type, options, self.name(), applied.as_str(), &extra))
    }
}

/// Pack the blocks found by `pattern` into chunks.
///
/// Returns `None` when the pattern matches nothing. Code after the last
/// block becomes its own chunk(s), fixed-size split if it is too large.
fn chunk_blocks(
    content: &str,
    pattern: &Regex,
    size: usize,
    overlap: usize,
) -> Option<Vec<String>> {
    let (blocks, trailing) = find_blocks(content, pattern)?;
    let mut pieces = accumulate(blocks.iter().map(String::as_str), "\n\n", size, overlap);
    if !trailing.is_empty() {
        if char_len(&trailing) > size {
            pieces.extend(fixed_size_split(&trailing, size, overlap));
        } else {
            pieces.push(trailing);
        }
    }
    Some(pieces)
}

struct Line<'a> {
    start: usize,
    text: &'a str,
}

fn indentation(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

/// Cut content into the segments that start at lines matching `pattern`.
///
/// Decorators directly above a match belong to its block. Anything before
/// the first block is kept as a leading segment; anything after the body
/// of the last block is returned separately as trailing code.
fn find_blocks(content: &str, pattern: &Regex) -> Option<(Vec<String>, String)> {
    let mut lines = Vec::new();
    let mut offset = 0;
    for text in content.split_inclusive('\n') {
        lines.push(Line { start: offset, text });
        offset += text.len();
    }

    let mut starts: Vec<usize> = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        if !pattern.is_match(line.text) {
            continue;
        }
        let indent = indentation(line.text);
        let mut first = i;
        while first > 0 {
            let prev = lines[first - 1].text;
            if prev.trim_start().starts_with('@') && indentation(prev) == indent {
                first -= 1;
            } else {
                break;
            }
        }
        if starts.last().is_none_or(|&s| s < first) {
            starts.push(first);
        }
    }

    let &last_start = starts.last()?;
    let body_end = block_end(&lines, last_start);

    let mut segments = Vec::new();
    let head = &content[..lines[starts[0]].start];
    segments.push(head);
    for pair in starts.windows(2) {
        segments.push(&content[lines[pair[0]].start..lines[pair[1]].start]);
    }
    segments.push(&content[lines[last_start].start..body_end]);

    let blocks = segments
        .into_iter()
        .map(str::trim_end)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
        .collect();
    let trailing = content[body_end..].trim().to_string();
    Some((blocks, trailing))
}

/// Byte offset where the block starting at line `start` ends.
fn block_end(lines: &[Line<'_>], start: usize) -> usize {
    let mut header = start;
    while header < lines.len() && lines[header].text.trim_start().starts_with('@') {
        header += 1;
    }
    let Some(def_line) = lines.get(header) else {
        return lines.last().map_or(0, |l| l.start + l.text.len());
    };
    let indent = indentation(def_line.text);

    // The signature may span lines; it ends at the first ':' outside
    // brackets, strings and comments.
    let mut depth = 0usize;
    let mut body = header;
    while body < lines.len() && !closes_signature(lines[body].text, &mut depth) {
        body += 1;
    }
    if body == lines.len() {
        body = header;
    }

    for line in lines.iter().skip(body + 1) {
        if !line.text.trim().is_empty() && indentation(line.text) <= indent {
            return line.start;
        }
    }
    lines.last().map_or(0, |l| l.start + l.text.len())
}

/// Whether `line` holds the ':' that ends a `def`/`class` header, given the
/// bracket depth carried over from previous signature lines.
fn closes_signature(line: &str, depth: &mut usize) -> bool {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for ch in line.chars() {
        if let Some(open) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == open {
                quote = None;
            }
            continue;
        }
        match ch {
            '#' => return false,
            '\'' | '"' => quote = Some(ch),
            '(' | '[' | '{' => *depth += 1,
            ')' | ']' | '}' => *depth = depth.saturating_sub(1),
            ':' if *depth == 0 => return true,
            _ => {}
        }
    }
    false
}

/// Chunker meant to find boundaries with an embedding model.
///
/// Without a model it delegates to the text or code chunker depending on
/// the context type. With a model it currently splits on paragraphs; real
/// embedding-based boundary detection is not implemented.
#[derive(Debug, Clone, Default)]
pub struct SemanticChunker {
    text: TextChunker,
    code: CodeChunker,
    embedding_model: Option<String>,
}

impl SemanticChunker {
    /// Semantic chunker without a model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the embedding model.
    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = Some(model.into());
        self
    }

    /// Chunker used for text when no model is set.
    pub fn with_text_chunker(mut self, text: TextChunker) -> Self {
        self.text = text;
        self
    }

    /// Chunker used for code when no model is set.
    pub fn with_code_chunker(mut self, code: CodeChunker) -> Self {
        self.code = code;
        self
    }
}

impl Chunker for SemanticChunker {
    fn name(&self) -> &'static str {
        "semantic"
    }

    fn chunk(
        &self,
        content: &str,
        context_type: ContextType,
        options: &ChunkOptions,
    ) -> Result<Vec<Context>> {
        let model = options
            .embedding_model
            .as_deref()
            .or(self.embedding_model.as_deref());

        let Some(model) = model else {
            let mut delegated = options.clone();
            if delegated.strategy == Some(ChunkStrategy::Semantic) {
                delegated.strategy = None;
            }
            return match context_type {
                ContextType::Code => self.code.chunk(content, context_type, &delegated),
                _ => self.text.chunk(content, context_type, &delegated),
            };
        };

        let paragraph = options.clone().with_strategy(ChunkStrategy::Paragraph);
        let mut chunks = self.text.chunk(content, context_type, &paragraph)?;
        for chunk in &mut chunks {
            chunk.metadata.insert("chunker".to_string(), Value::from(self.name()));
            chunk
                .metadata
                .insert("embedding_model".to_string(), Value::from(model));
        }
        Ok(chunks)
    }
}
