//! Composers that merge several contexts into one.
//!
//! A composed context lists its inputs by id in `chunks` and records how it
//! was built under `metadata.composer`. Composing an empty input yields an
//! empty text context, never an error.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex_lite::{Captures, Regex};
use serde_json::Value;
use tracing::debug;

use crate::context::{Context, ContextType};

/// Default separator placed between composed parts.
pub const DEFAULT_SEPARATOR: &str = "\n\n";

/// Default indentation unit for hierarchical composition.
pub const DEFAULT_INDENT: &str = "  ";

/// Default depth limit for hierarchical composition.
pub const DEFAULT_MAX_DEPTH: usize = 5;

#[allow(clippy::expect_used)]
static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{(\w+)\}").expect("static placeholder pattern must compile")
});

/// Per-call composition options. Unset fields use the composer's defaults.
#[derive(Debug, Clone, Default)]
pub struct ComposeOptions {
    pub separator: Option<String>,
    /// Rendered before each context. Placeholders: `{index}`, `{count}`,
    /// `{id}`, `{type}`, `{source}` and any metadata key of that context.
    pub header_template: Option<String>,
    /// Rendered after each context, same placeholders as the header.
    pub footer_template: Option<String>,
    /// Copy every input's metadata into `context_{i}_{key}`.
    pub include_metadata: bool,
    /// Type of the composed context; defaults to the first input's type.
    pub context_type: Option<ContextType>,
    pub indent_string: Option<String>,
    pub max_depth: Option<usize>,
    pub embedding_model: Option<String>,
    pub query: Option<String>,
}

impl ComposeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = Some(separator.into());
        self
    }

    pub fn with_header(mut self, template: impl Into<String>) -> Self {
        self.header_template = Some(template.into());
        self
    }

    pub fn with_footer(mut self, template: impl Into<String>) -> Self {
        self.footer_template = Some(template.into());
        self
    }

    pub fn with_metadata(mut self, include: bool) -> Self {
        self.include_metadata = include;
        self
    }

    pub fn with_context_type(mut self, context_type: ContextType) -> Self {
        self.context_type = Some(context_type);
        self
    }

    pub fn with_indent(mut self, indent: impl Into<String>) -> Self {
        self.indent_string = Some(indent.into());
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = Some(max_depth);
        self
    }

    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = Some(model.into());
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }
}

/// Merges a list of contexts into one composed context.
pub trait Composer: Send + Sync {
    /// Short name recorded in `metadata.composer`.
    fn name(&self) -> &'static str;

    fn compose(&self, contexts: &[Context], options: &ComposeOptions) -> Context;
}

/// Render `{placeholder}` fields for the context at `index`.
/// Unknown placeholders are left untouched.
fn render_template(template: &str, ctx: &Context, index: usize, count: usize) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| {
            let key = &caps[1];
            match key {
                "index" => index.to_string(),
                "count" => count.to_string(),
                "id" => ctx.id().to_string(),
                "type" => ctx.context_type.to_string(),
                "source" => ctx.source.clone().unwrap_or_default(),
                _ => match ctx.metadata.get(key) {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => caps[0].to_string(),
                },
            }
        })
        .into_owned()
}

/// Union of the inputs' tags in first-seen order.
fn merged_tags<'a>(contexts: impl IntoIterator<Item = &'a Context>) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for ctx in contexts {
        for tag in &ctx.tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
    }
    tags
}

/// Concatenates contexts in input order.
#[derive(Debug, Clone)]
pub struct SequentialComposer {
    separator: String,
}

impl SequentialComposer {
    pub fn new() -> Self {
        Self {
            separator: DEFAULT_SEPARATOR.to_string(),
        }
    }

    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    fn compose_refs(&self, contexts: &[&Context], options: &ComposeOptions) -> Context {
        let Some(first) = contexts.first() else {
            return Context::empty();
        };

        let count = contexts.len();
        let separator = options.separator.as_deref().unwrap_or(&self.separator);
        let parts: Vec<String> = contexts
            .iter()
            .enumerate()
            .map(|(i, ctx)| {
                let mut part = String::new();
                if let Some(header) = &options.header_template {
                    part.push_str(&render_template(header, ctx, i, count));
                }
                part.push_str(ctx.content());
                if let Some(footer) = &options.footer_template {
                    part.push_str(&render_template(footer, ctx, i, count));
                }
                part
            })
            .collect();

        let context_type = options.context_type.unwrap_or(first.context_type);
        let original_tokens: usize = contexts.iter().map(|c| c.tokens()).sum();

        let mut composed = Context::new(parts.join(separator), context_type)
            .with_tags(merged_tags(contexts.iter().copied()))
            .with_metadata("composer", "sequential")
            .with_metadata("context_count", count)
            .with_metadata("original_tokens", original_tokens);
        composed.chunks = contexts.iter().map(|c| c.id().to_string()).collect();

        if options.include_metadata {
            for (i, ctx) in contexts.iter().enumerate() {
                for (key, value) in &ctx.metadata {
                    composed
                        .metadata
                        .insert(format!("context_{i}_{key}"), value.clone());
                }
            }
        }

        debug!("Sequentially composed {count} contexts");
        composed
    }
}

impl Default for SequentialComposer {
    fn default() -> Self {
        Self::new()
    }
}

impl Composer for SequentialComposer {
    fn name(&self) -> &'static str {
        "sequential"
    }

    fn compose(&self, contexts: &[Context], options: &ComposeOptions) -> Context {
        let refs: Vec<&Context> = contexts.iter().collect();
        self.compose_refs(&refs, options)
    }
}

/// Renders parent/child relations among the inputs as an indented outline.
///
/// Only links between inputs count: a context whose parent is not part of
/// the input set is rendered as a root.
#[derive(Debug, Clone)]
pub struct HierarchicalComposer {
    separator: String,
    indent_string: String,
    max_depth: usize,
}

impl HierarchicalComposer {
    pub fn new() -> Self {
        Self {
            separator: "\n".to_string(),
            indent_string: DEFAULT_INDENT.to_string(),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_indent(mut self, indent: impl Into<String>) -> Self {
        self.indent_string = indent.into();
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }
}

impl Default for HierarchicalComposer {
    fn default() -> Self {
        Self::new()
    }
}

struct Outline<'a> {
    children: HashMap<&'a str, Vec<&'a Context>>,
    indent: &'a str,
    max_depth: usize,
    visited: HashSet<&'a str>,
    blocks: Vec<String>,
}

impl<'a> Outline<'a> {
    fn render(&mut self, ctx: &'a Context, depth: usize) {
        if depth > self.max_depth || !self.visited.insert(ctx.id()) {
            return;
        }

        let prefix = self.indent.repeat(depth);
        let block = ctx
            .content()
            .lines()
            .map(|line| format!("{prefix}{line}"))
            .collect::<Vec<_>>()
            .join("\n");
        self.blocks.push(block);

        let children = self.children.get(ctx.id()).cloned().unwrap_or_default();
        for child in children {
            self.render(child, depth + 1);
        }
    }
}

impl Composer for HierarchicalComposer {
    fn name(&self) -> &'static str {
        "hierarchical"
    }

    fn compose(&self, contexts: &[Context], options: &ComposeOptions) -> Context {
        let Some(first) = contexts.first() else {
            return Context::empty();
        };

        let ids: HashSet<&str> = contexts.iter().map(Context::id).collect();
        let mut children: HashMap<&str, Vec<&Context>> = HashMap::new();
        let mut roots: Vec<&Context> = Vec::new();
        for ctx in contexts {
            match ctx.parent_id.as_deref() {
                Some(parent) if parent != ctx.id() && ids.contains(parent) => {
                    children.entry(parent).or_default().push(ctx);
                }
                _ => roots.push(ctx),
            }
        }

        // Parent links that loop never reach a root; the first member of
        // each loop, in input order, is promoted so nothing is dropped.
        let mut reachable: HashSet<&str> = HashSet::new();
        let mut pending: Vec<&Context> = roots.clone();
        let mut next = 0;
        loop {
            while let Some(ctx) = pending.pop() {
                if !reachable.insert(ctx.id()) {
                    continue;
                }
                if let Some(kids) = children.get(ctx.id()) {
                    pending.extend(kids.iter().copied());
                }
            }
            let Some(stranded) = contexts[next..]
                .iter()
                .position(|ctx| !reachable.contains(ctx.id()))
            else {
                break;
            };
            let promoted = &contexts[next + stranded];
            next += stranded + 1;
            debug!("Promoting {} to a root; its parent chain loops", promoted.id());
            roots.push(promoted);
            pending.push(promoted);
        }

        let max_depth = options.max_depth.unwrap_or(self.max_depth);
        let mut outline = Outline {
            children,
            indent: options.indent_string.as_deref().unwrap_or(&self.indent_string),
            max_depth,
            visited: HashSet::new(),
            blocks: Vec::new(),
        };
        for root in &roots {
            outline.render(root, 0);
        }

        let separator = options.separator.as_deref().unwrap_or(&self.separator);
        let context_type = options.context_type.unwrap_or(first.context_type);
        let total_tokens: usize = contexts.iter().map(Context::tokens).sum();

        let mut composed = Context::new(outline.blocks.join(separator), context_type)
            .with_tags(merged_tags(contexts))
            .with_metadata("composer", self.name())
            .with_metadata("context_count", contexts.len())
            .with_metadata("root_count", roots.len())
            .with_metadata("max_depth", max_depth)
            .with_metadata("original_tokens", total_tokens);
        composed.chunks = contexts.iter().map(|c| c.id().to_string()).collect();
        composed.set_tokens(total_tokens);

        debug!(
            "Hierarchically composed {} contexts ({} roots)",
            contexts.len(),
            roots.len()
        );
        composed
    }
}

/// Composer meant to order inputs by relevance to a query.
///
/// Needs both an embedding model and a query; otherwise it composes
/// sequentially. Ranking keeps the input order, since no relevance model
/// is wired in.
#[derive(Debug, Clone, Default)]
pub struct SemanticComposer {
    sequential: SequentialComposer,
    embedding_model: Option<String>,
}

impl SemanticComposer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = Some(model.into());
        self
    }

    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.sequential = self.sequential.with_separator(separator);
        self
    }

    fn rank<'a>(&self, contexts: &'a [Context], _query: &str) -> Vec<&'a Context> {
        contexts.iter().collect()
    }
}

impl Composer for SemanticComposer {
    fn name(&self) -> &'static str {
        "semantic"
    }

    fn compose(&self, contexts: &[Context], options: &ComposeOptions) -> Context {
        let model = options
            .embedding_model
            .as_deref()
            .or(self.embedding_model.as_deref());
        let (Some(model), Some(query)) = (model, options.query.as_deref()) else {
            return self.sequential.compose(contexts, options);
        };
        if contexts.is_empty() {
            return Context::empty();
        }

        let ranked = self.rank(contexts, query);
        let mut composed = self.sequential.compose_refs(&ranked, options);
        composed
            .metadata
            .insert("composer".to_string(), Value::from(self.name()));
        composed
            .metadata
            .insert("query".to_string(), Value::from(query));
        composed
            .metadata
            .insert("embedding_model".to_string(), Value::from(model));
        composed
    }
}
