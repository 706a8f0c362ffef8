//! Hybrid search and RAG context assembly.
//!
//! Implemented once against the [`Memory`] trait; backends inherit it through
//! the trait's default methods.
//!
//! Default layout:
//!
//! ```text
//! Query: <query>
//!
//! Personal Memory:
//! 1. <content>
//!
//! Knowledge Base:
//! 1. <content> (Source: <source>)
//!
//! Recent Conversation:
//! <role>: <content>
//! ```
//!
//! Items are added greedily while the estimated token count stays within the
//! budget; items that do not fit are left out of both the text and the
//! returned lists.

use crate::context::MemoryContext;
use crate::error::Result;
use crate::traits::Memory;
use crate::types::{
    ContextOptions, HybridResult, KnowledgeResult, MemoryResult, Message, RagContext,
    SearchOptions,
};
use chrono::Utc;
use std::time::Instant;

/// Rough token estimate: four bytes per token.
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}

/// Run the personal and knowledge branches concurrently.
pub async fn search_all<M>(
    memory: &M,
    ctx: &MemoryContext,
    query: &str,
    options: &SearchOptions,
) -> Result<HybridResult>
where
    M: Memory + ?Sized,
{
    let start = Instant::now();

    let personal = async {
        if options.include_personal {
            memory
                .query(ctx, query, options.limit)
                .await
                .map_err(|e| e.with_context("personal memory search"))
        } else {
            Ok(Vec::new())
        }
    };
    let knowledge = async {
        if options.include_knowledge {
            memory
                .search_knowledge(ctx, query, options)
                .await
                .map_err(|e| e.with_context("knowledge search"))
        } else {
            Ok(Vec::new())
        }
    };

    let (personal, knowledge) = tokio::join!(personal, knowledge);
    let personal = personal?;
    let knowledge = knowledge?;
    let total_results = personal.len() + knowledge.len();
    let search_time = start.elapsed();

    tracing::debug!(
        backend = memory.name(),
        personal = personal.len(),
        knowledge = knowledge.len(),
        elapsed_ms = search_time.as_millis() as u64,
        "Hybrid search complete"
    );

    Ok(HybridResult {
        query: query.to_string(),
        personal_memory: personal,
        knowledge,
        total_results,
        search_time,
    })
}

/// Search, fetch recent history and render a token-bounded context.
pub async fn build_context<M>(
    memory: &M,
    ctx: &MemoryContext,
    query: &str,
    options: &ContextOptions,
) -> Result<RagContext>
where
    M: Memory + ?Sized,
{
    let defaults = memory.defaults();
    let max_tokens = options.max_tokens.unwrap_or(defaults.max_context_tokens);
    let personal_weight = options.personal_weight.unwrap_or(defaults.personal_weight);
    let knowledge_weight = options.knowledge_weight.unwrap_or(defaults.knowledge_weight);
    let history_limit = options.history_limit.unwrap_or(defaults.history_limit);
    let include_sources = options.include_sources.unwrap_or(defaults.include_sources);

    // Roughly 100 tokens per result
    let search = SearchOptions::new()
        .limit((max_tokens / 100).max(1))
        .score_threshold(0.0)
        .include_personal(personal_weight > 0.0)
        .include_knowledge(knowledge_weight > 0.0);

    let hybrid = memory
        .search_all(ctx, query, &search)
        .await
        .map_err(|e| e.with_context("build_context search"))?;

    let history = if history_limit > 0 {
        memory
            .get_history(ctx, Some(history_limit))
            .await
            .map_err(|e| e.with_context("build_context history"))?
    } else {
        Vec::new()
    };

    let layout = Layout {
        query,
        include_sources,
        template: options.format_template.as_deref(),
        max_tokens,
    };
    Ok(assemble(
        &layout,
        &hybrid.personal_memory,
        &hybrid.knowledge,
        &history,
    ))
}

struct Layout<'a> {
    query: &'a str,
    include_sources: bool,
    template: Option<&'a str>,
    max_tokens: usize,
}

#[derive(Default)]
struct Selection<'a> {
    personal: Vec<&'a MemoryResult>,
    knowledge: Vec<&'a KnowledgeResult>,
    history: Vec<&'a Message>,
}

impl Selection<'_> {
    fn sources(&self) -> Vec<String> {
        let mut sources: Vec<String> = Vec::new();
        for k in &self.knowledge {
            if !k.source.is_empty() && !sources.contains(&k.source) {
                sources.push(k.source.clone());
            }
        }
        sources
    }
}

fn assemble(
    layout: &Layout<'_>,
    personal: &[MemoryResult],
    knowledge: &[KnowledgeResult],
    history: &[Message],
) -> RagContext {
    let mut sel = Selection::default();

    for item in personal {
        sel.personal.push(item);
        if !fits(layout, &sel) {
            sel.personal.pop();
        }
    }
    for item in knowledge {
        sel.knowledge.push(item);
        if !fits(layout, &sel) {
            sel.knowledge.pop();
        }
    }
    // Newest messages get priority; output stays chronological
    for item in history.iter().rev() {
        sel.history.insert(0, item);
        if !fits(layout, &sel) {
            sel.history.remove(0);
        }
    }

    let mut text = render(layout, &sel);
    truncate_to_tokens(&mut text, layout.max_tokens);

    RagContext {
        query: layout.query.to_string(),
        personal_memory: sel.personal.iter().map(|m| (*m).clone()).collect(),
        knowledge: sel.knowledge.iter().map(|k| (*k).clone()).collect(),
        chat_history: sel.history.iter().map(|m| (*m).clone()).collect(),
        sources: sel.sources(),
        token_count: estimate_tokens(&text),
        context_text: text,
        timestamp: Utc::now(),
    }
}

fn fits(layout: &Layout<'_>, sel: &Selection<'_>) -> bool {
    estimate_tokens(&render(layout, sel)) <= layout.max_tokens
}

fn knowledge_line(index: usize, item: &KnowledgeResult, include_sources: bool) -> String {
    if include_sources && !item.source.is_empty() {
        format!("{}. {} (Source: {})", index + 1, item.content, item.source)
    } else {
        format!("{}. {}", index + 1, item.content)
    }
}

fn render(layout: &Layout<'_>, sel: &Selection<'_>) -> String {
    match layout.template {
        Some(template) => render_template(template, layout, sel),
        None => render_default(layout, sel),
    }
}

fn render_default(layout: &Layout<'_>, sel: &Selection<'_>) -> String {
    let mut out = format!("Query: {}\n\n", layout.query);

    if !sel.personal.is_empty() {
        out.push_str("Personal Memory:\n");
        for (i, item) in sel.personal.iter().enumerate() {
            out.push_str(&format!("{}. {}\n", i + 1, item.content));
        }
        out.push('\n');
    }

    if !sel.knowledge.is_empty() {
        out.push_str("Knowledge Base:\n");
        for (i, item) in sel.knowledge.iter().enumerate() {
            out.push_str(&knowledge_line(i, item, layout.include_sources));
            out.push('\n');
        }
        out.push('\n');
    }

    if !sel.history.is_empty() {
        out.push_str("Recent Conversation:\n");
        for msg in &sel.history {
            out.push_str(&format!("{}: {}\n", msg.role, msg.content));
        }
    }

    out
}

fn render_template(template: &str, layout: &Layout<'_>, sel: &Selection<'_>) -> String {
    let personal = sel
        .personal
        .iter()
        .enumerate()
        .map(|(i, m)| format!("{}. {}", i + 1, m.content))
        .collect::<Vec<_>>()
        .join("\n");
    let knowledge = sel
        .knowledge
        .iter()
        .enumerate()
        .map(|(i, k)| knowledge_line(i, k, layout.include_sources))
        .collect::<Vec<_>>()
        .join("\n");
    let history = sel
        .history
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n");

    template
        .replace("{query}", layout.query)
        .replace("{personal_memory}", &personal)
        .replace("{knowledge}", &knowledge)
        .replace("{history}", &history)
        .replace("{sources}", &sel.sources().join(", "))
}

/// Cut `text` so that its estimate is within `max_tokens`, on a char boundary.
fn truncate_to_tokens(text: &mut String, max_tokens: usize) {
    if estimate_tokens(text) <= max_tokens {
        return;
    }
    let mut cut = max_tokens.saturating_mul(4).saturating_add(3).min(text.len());
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}
