//! Rewrite stage: raw chapter text in, narration text out.
//!
//! Long chapters are rewritten chunk by chunk. Each chunk gets a draft pass
//! and, unless disabled, an editor pass that returns the final narration
//! between `<FINAL_NARRATION>` tags. The prompt carries short summaries of
//! the neighbouring chapters and passages retrieved from the context memory.

use anyhow::Result;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::core::cache::{CacheState, UnitCache};
use crate::core::error::{content_skip_reason, PipelineError};
use crate::core::retry::{call_with_retry, RetryPolicy};
use crate::core::state::{Stage, StageStatus, WorkUnit};
use crate::services::llm::LlmClient;
use crate::services::memory::{truncate_chars, ContextMemory};
use crate::services::voice::NARRATOR_CUE;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RewriteConfig {
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,

    /// Number of chapters on each side summarized into the prompt.
    #[serde(default = "default_context_window")]
    pub context_window: usize,

    #[serde(default = "default_summary_chars")]
    pub summary_chars: usize,

    /// Sources shorter than this are skipped.
    #[serde(default = "default_min_source_chars")]
    pub min_source_chars: usize,

    #[serde(default = "crate::core::config::default_true")]
    pub editor_pass: bool,

    /// Sound-effect tags left in the narration, e.g. `[sigh]`.
    #[serde(default = "default_keep_tags")]
    pub keep_tags: Vec<String>,
}

fn default_chunk_chars() -> usize {
    4000
}
fn default_context_window() -> usize {
    2
}
fn default_summary_chars() -> usize {
    300
}
fn default_min_source_chars() -> usize {
    50
}
fn default_keep_tags() -> Vec<String> {
    [
        "chuckle",
        "laugh",
        "sigh",
        "gasp",
        "cough",
        "groan",
        "sniff",
        "clear throat",
        "shush",
    ]
    .iter()
    .map(|t| t.to_string())
    .collect()
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            chunk_chars: default_chunk_chars(),
            context_window: default_context_window(),
            summary_chars: default_summary_chars(),
            min_source_chars: default_min_source_chars(),
            editor_pass: true,
            keep_tags: default_keep_tags(),
        }
    }
}

const SYSTEM_PROMPT: &str = "You are a master storyteller preparing a book for audiobook narration. \
You stay faithful to the source: same events, same imagery, same pacing. \
You write plain text meant to be read aloud.";

const QUERY_SOURCE_CHARS: usize = 2000;
const QUERY_FALLBACK_CHARS: usize = 500;

pub struct RewriteStage {
    llm: Box<dyn LlmClient>,
    memory: Option<ContextMemory>,
    cache: UnitCache,
    config: RewriteConfig,
    retry: RetryPolicy,
    speakers: Vec<String>,
}

impl RewriteStage {
    pub fn new(
        llm: Box<dyn LlmClient>,
        memory: Option<ContextMemory>,
        cache: UnitCache,
        config: RewriteConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            llm,
            memory,
            cache,
            config,
            retry,
            speakers: Vec::new(),
        }
    }

    /// Speaker names the narration may switch to with a `[Name]` line.
    pub fn with_speakers(mut self, speakers: Vec<String>) -> Self {
        self.speakers = speakers;
        self
    }

    pub fn memory(&self) -> Option<&ContextMemory> {
        self.memory.as_ref()
    }

    /// Produces the narration artifact for `units[position]`.
    ///
    /// A successful status means the artifact is valid and listed in the
    /// memory. Failures are recorded in the cache and never returned as
    /// errors.
    pub async fn process(&mut self, units: &[WorkUnit], position: usize) -> StageStatus {
        let Some(unit) = units.get(position) else {
            return StageStatus::Failed(format!("no unit at position {}", position));
        };

        match self.cache.check(unit.index, &unit.name, Stage::Rewrite).await {
            Ok(CacheState::Valid) => return self.reuse_cached(unit).await,
            Ok(CacheState::StaleFailure) => {
                info!("Narration for '{}' failed previously, retrying", unit.name)
            }
            Ok(CacheState::Absent) => {}
            Err(e) => return StageStatus::Failed(format!("cache check failed: {:#}", e)),
        }

        match self.rewrite(units, position).await {
            Ok(narration) => {
                if let Err(e) = self
                    .cache
                    .store(unit.index, &unit.name, Stage::Rewrite, narration.as_bytes())
                    .await
                {
                    return StageStatus::Failed(format!("failed to store narration: {:#}", e));
                }
                self.memorize(unit, &narration).await;
                info!("Narration ready for '{}'", unit.name);
                StageStatus::Completed
            }
            Err(e) => {
                if let Some(reason) = content_skip_reason(&e) {
                    warn!("Skipping '{}': {}", unit.name, reason);
                    return StageStatus::Skipped(reason);
                }
                let reason = format!("{:#}", e);
                warn!("Rewrite failed for '{}': {}", unit.name, reason);
                if let Err(e) = self
                    .cache
                    .record_failure(unit.index, &unit.name, Stage::Rewrite, &reason)
                    .await
                {
                    warn!("Could not record failure for '{}': {:#}", unit.name, e);
                }
                StageStatus::Failed(reason)
            }
        }
    }

    async fn reuse_cached(&mut self, unit: &WorkUnit) -> StageStatus {
        info!("Using cached narration for '{}'", unit.name);
        match self.cache.load_text(unit.index, &unit.name, Stage::Rewrite).await {
            Ok(narration) => {
                self.memorize(unit, &narration).await;
                StageStatus::Cached
            }
            Err(e) => StageStatus::Failed(format!("failed to read cached narration: {:#}", e)),
        }
    }

    async fn memorize(&mut self, unit: &WorkUnit, narration: &str) {
        if let Some(memory) = self.memory.as_mut() {
            if let Err(e) = memory.add_unit(&unit.name, unit.index, narration).await {
                warn!("Failed to memorize '{}': {:#}", unit.name, e);
            }
        }
    }

    async fn rewrite(&self, units: &[WorkUnit], position: usize) -> Result<String> {
        let unit = &units[position];
        let source = unit.source_text.trim();
        let source_chars = source.chars().count();
        if source_chars < self.config.min_source_chars {
            let reason = if source_chars == 0 {
                "source text is empty".to_string()
            } else {
                format!("source text too short ({} chars)", source_chars)
            };
            return Err(PipelineError::content(&unit.name, reason).into());
        }

        let semantic_context = self.semantic_context(unit).await;
        let (previous, upcoming) = neighbor_context(
            units,
            position,
            self.config.context_window,
            self.config.summary_chars,
        );

        let chunks = chunk_source(source, self.config.chunk_chars);
        let mut narrated = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.iter().enumerate() {
            if chunks.len() > 1 {
                info!("'{}': rewriting chunk {}/{}", unit.name, i + 1, chunks.len());
            }
            let prompt = PromptContext {
                previous: &previous,
                upcoming: &upcoming,
                semantic: &semantic_context,
                speakers: &self.speakers,
            };
            let text = self.rewrite_chunk(&unit.name, chunk, &prompt).await?;
            narrated.push(text);
        }

        let narration = clean_narration(&narrated.join("\n\n"), &self.config.keep_tags);
        if narration.trim().is_empty() {
            anyhow::bail!("generated narration is empty after cleaning");
        }
        Ok(narration)
    }

    async fn rewrite_chunk(
        &self,
        unit_name: &str,
        chunk: &str,
        context: &PromptContext<'_>,
    ) -> Result<String> {
        let llm = self.llm.as_ref();
        let draft_prompt = draft_prompt(chunk, context);
        let draft_ref = &draft_prompt;
        let draft = call_with_retry(
            &format!("draft narration for '{}'", unit_name),
            &self.retry,
            move || llm.chat(SYSTEM_PROMPT, draft_ref),
        )
        .await?;

        if !self.config.editor_pass {
            return Ok(draft.trim().to_string());
        }

        let review_prompt = review_prompt(chunk, &draft);
        let review_ref = &review_prompt;
        let reply = call_with_retry(
            &format!("editor pass for '{}'", unit_name),
            &self.retry,
            move || llm.chat(SYSTEM_PROMPT, review_ref),
        )
        .await?;
        Ok(extract_final_narration(&reply))
    }

    /// Memory passages relevant to `unit`, formatted for the prompt. Empty
    /// when the memory is disabled, empty, or unreachable.
    async fn semantic_context(&self, unit: &WorkUnit) -> String {
        let Some(memory) = self.memory.as_ref() else {
            return String::new();
        };
        if memory.is_empty() {
            return String::new();
        }

        let query = self.memory_query(unit).await;
        match memory.query(&query, unit.index).await {
            Ok(hits) => {
                if !hits.is_empty() {
                    info!(
                        "'{}': {} memory passage(s) from {}",
                        unit.name,
                        hits.len(),
                        hits.iter()
                            .map(|h| h.unit_name.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    );
                }
                memory.format_context(&hits)
            }
            Err(e) => {
                warn!("Memory search failed for '{}': {:#}", unit.name, e);
                String::new()
            }
        }
    }

    /// A two-sentence thematic summary of the chapter, or a prefix of it
    /// when the summary request fails.
    async fn memory_query(&self, unit: &WorkUnit) -> String {
        let llm = self.llm.as_ref();
        let prompt = format!(
            "Summarize the core themes and key terms of this text in 2 sentences for a vector search query:\n\n{}",
            unit.source_text.chars().take(QUERY_SOURCE_CHARS).collect::<String>()
        );
        let prompt_ref = &prompt;
        match call_with_retry(
            &format!("memory query for '{}'", unit.name),
            &self.retry,
            move || llm.chat("You write concise search queries.", prompt_ref),
        )
        .await
        {
            Ok(summary) if !summary.trim().is_empty() => summary.trim().to_string(),
            Ok(_) | Err(_) => {
                warn!("Using text prefix as memory query for '{}'", unit.name);
                unit.source_text
                    .trim()
                    .chars()
                    .take(QUERY_FALLBACK_CHARS)
                    .collect()
            }
        }
    }
}

struct PromptContext<'a> {
    previous: &'a str,
    upcoming: &'a str,
    semantic: &'a str,
    speakers: &'a [String],
}

const NARRATION_RULES: &str = "FORMATTING RULES:
1. Plain text only. No markdown: no asterisks, no bold or italics, no headers, no bullet lists.
2. Make it clear to a listener who is speaking. Add dialogue attributions (\"she said\", \"he replied\") wherever the speaker is not obvious.
3. Each blank line becomes a short pause in the audio. Separate paragraphs with one blank line and scenes with two.
4. Do not emit XML-like artifacts such as <parameter> tags.
5. Do not add commentary, notes or headings of your own.";

fn draft_prompt(chunk: &str, context: &PromptContext<'_>) -> String {
    let mut prompt = String::from(
        "Rewrite the following chapter text as audiobook narration. \
         Stay as close to the source as possible.\n\n",
    );
    prompt.push_str(NARRATION_RULES);
    prompt.push_str("\n\n");

    if context.speakers.is_empty() {
        prompt.push_str("Do not use any bracketed tags like [Narrator] or [Name].\n\n");
    } else {
        prompt.push_str(&format!(
            "Dedicated voices exist for: {}. When one of them speaks, put [Name] on its own line \
             before their words, and [{}] on its own line when narration resumes. \
             Use no other bracketed tags.\n\n",
            context.speakers.join(", "),
            NARRATOR_CUE
        ));
    }

    if !context.previous.is_empty() || !context.upcoming.is_empty() {
        prompt.push_str("CONTEXT (for continuity only, do not narrate):\n");
        if !context.previous.is_empty() {
            prompt.push_str(context.previous);
            prompt.push('\n');
        }
        if !context.upcoming.is_empty() {
            prompt.push_str(context.upcoming);
            prompt.push('\n');
        }
        prompt.push('\n');
    }

    if !context.semantic.is_empty() {
        prompt.push_str(
            "RELATED PASSAGES ALREADY NARRATED (keep names, terms and tone consistent):\n",
        );
        prompt.push_str(context.semantic);
        prompt.push_str("\n\n");
    }

    prompt.push_str("SOURCE TEXT:\n");
    prompt.push_str(chunk);
    prompt
}

fn review_prompt(chunk: &str, draft: &str) -> String {
    format!(
        "EDITOR REVIEW & REWRITE:
Compare the DRAFT narration to the SOURCE. Act as a senior editor: find every error and rewrite the draft to perfection.

CHECKLIST:
1. No asterisks or other markdown anywhere.
2. Every event and image of the source is present, nothing is invented.
3. Names are spelled consistently.
4. It is always clear who is speaking.

{rules}

SOURCE:
{chunk}

DRAFT:
{draft}

First, list the specific edits needed. Then provide the complete, final version wrapped in <FINAL_NARRATION> tags:
<FINAL_NARRATION>
final narration here
</FINAL_NARRATION>",
        rules = NARRATION_RULES,
        chunk = chunk,
        draft = draft
    )
}

/// Pulls the final narration out of an editor reply.
pub fn extract_final_narration(reply: &str) -> String {
    const OPEN: &str = "<FINAL_NARRATION>";
    const CLOSE: &str = "</FINAL_NARRATION>";

    if let Some(start) = reply.find(OPEN) {
        let body = &reply[start + OPEN.len()..];
        let body = match body.find(CLOSE) {
            Some(end) => &body[..end],
            None => body,
        };
        return body.trim().to_string();
    }
    if let Some((_, after)) = reply.rsplit_once("---FINAL---") {
        return after.trim().to_string();
    }
    reply.trim().to_string()
}

/// Summaries of up to `window` chapters before and after `position`, each
/// cut to `summary_chars` characters.
pub fn neighbor_context(
    units: &[WorkUnit],
    position: usize,
    window: usize,
    summary_chars: usize,
) -> (String, String) {
    let summarize = |unit: &WorkUnit| {
        format!(
            "\n{}:\n{}\n",
            unit.name,
            truncate_chars(unit.source_text.trim(), summary_chars)
        )
    };

    let start = position.saturating_sub(window);
    let previous: Vec<String> = units[start..position.min(units.len())]
        .iter()
        .map(summarize)
        .collect();

    let end = (position + window + 1).min(units.len());
    let upcoming: Vec<String> = if position + 1 < end {
        units[position + 1..end].iter().map(summarize).collect()
    } else {
        Vec::new()
    };

    let render = |title: &str, parts: Vec<String>| {
        if parts.is_empty() {
            String::new()
        } else {
            format!("{}\n{}", title, parts.join("\n"))
        }
    };

    (
        render("PREVIOUS CHAPTERS:", previous),
        render("UPCOMING CHAPTERS:", upcoming),
    )
}

/// Splits source text into chunks of at most `max_chars` characters,
/// keeping paragraphs whole where possible.
pub fn chunk_source(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for paragraph in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        let len = paragraph.chars().count();

        if len > max_chars {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            let chars: Vec<char> = paragraph.chars().collect();
            chunks.extend(chars.chunks(max_chars).map(|c| c.iter().collect::<String>()));
            continue;
        }

        if !current.is_empty() && current_len + 2 + len > max_chars {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if !current.is_empty() {
            current.push_str("\n\n");
            current_len += 2;
        }
        current.push_str(paragraph);
        current_len += len;
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Strips wrapping code fences from a model reply.
pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    if let Some(rest) = s.strip_prefix("```") {
        // Drop an optional language tag on the opening fence.
        let rest = match rest.find('\n') {
            Some(nl) if !rest[..nl].trim().contains(' ') => &rest[nl + 1..],
            _ => rest,
        };
        rest.trim_end().trim_end_matches("```").trim().to_string()
    } else {
        s.to_string()
    }
}

/// Makes generated narration safe to read aloud.
///
/// Removes markdown, stray `<parameter>` artifacts and bracket tags other
/// than speaker names and the `keep_tags` sound effects, then normalizes
/// whitespace so there is never more than one blank line in a row.
pub fn clean_narration(text: &str, keep_tags: &[String]) -> String {
    let text = strip_code_blocks(text);
    let text = remove_parameter_artifacts(&text);

    let mut lines: Vec<String> = Vec::new();
    for line in text.lines() {
        let line = strip_markdown_line(line);
        let line = filter_tags(&line, keep_tags);
        let line = line.split_whitespace().collect::<Vec<_>>().join(" ");

        if line.is_empty() && lines.last().map_or(true, |l| l.is_empty()) {
            continue;
        }
        lines.push(line);
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

fn remove_parameter_artifacts(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        let open = rest.find("<parameter");
        let close = rest.find("</parameter>");
        let next = match (open, close) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => break,
        };
        out.push_str(&rest[..next]);
        rest = &rest[next..];
        match rest.find('>') {
            Some(end) => rest = &rest[end + 1..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

fn strip_markdown_line(line: &str) -> String {
    let trimmed = line.trim();

    // Horizontal rules.
    if trimmed.chars().count() >= 3
        && (trimmed.chars().all(|c| c == '-')
            || trimmed.chars().all(|c| c == '=')
            || trimmed.chars().all(|c| c == '*'))
    {
        return String::new();
    }

    // Headers.
    let hashes = trimmed.chars().take_while(|c| *c == '#').count();
    let body = if (1..=6).contains(&hashes)
        && trimmed[hashes..].starts_with(|c: char| c.is_whitespace())
    {
        trimmed[hashes..].trim_start()
    } else {
        trimmed
    };

    let body = unwrap_links(body);
    body.replace("__", "").replace(['*', '`'], "")
}

/// `[text](url)` becomes `text`.
fn unwrap_links(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    while let Some(open) = rest.find('[') {
        let after = &rest[open + 1..];
        let Some(close) = after.find(']') else {
            break;
        };
        let tail = &after[close + 1..];
        match tail.strip_prefix('(').and_then(|t| t.find(')').map(|end| (t, end))) {
            Some((target, end)) => {
                out.push_str(&rest[..open]);
                out.push_str(&after[..close]);
                rest = &target[end + 1..];
            }
            None => {
                out.push_str(&rest[..open + 1 + close + 1]);
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    out
}

fn filter_tags(line: &str, keep_tags: &[String]) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    while let Some(open) = rest.find('[') {
        let after = &rest[open + 1..];
        let Some(close) = after.find(']') else {
            break;
        };
        out.push_str(&rest[..open]);
        let content = after[..close].trim();
        if keep_tag(content, keep_tags) {
            out.push('[');
            out.push_str(content);
            out.push(']');
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}

fn keep_tag(content: &str, keep_tags: &[String]) -> bool {
    if content.eq_ignore_ascii_case(NARRATOR_CUE)
        || keep_tags.iter().any(|t| t.eq_ignore_ascii_case(content))
    {
        return true;
    }
    looks_like_name(content)
}

/// One or more capitalized words, e.g. `Narrator` or `Old Man`.
fn looks_like_name(content: &str) -> bool {
    let mut words = content.split_whitespace().peekable();
    if words.peek().is_none() {
        return false;
    }
    words.all(|word| {
        let mut chars = word.chars();
        matches!(chars.next(), Some(c) if c.is_uppercase())
            && chars.all(|c| c.is_lowercase())
            && word.chars().count() > 1
    })
}
