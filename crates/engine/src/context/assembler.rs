//! Context assembly: attached files, retrieved chunks and related history
//! merged into one bounded block.
//!
//! # Budget
//!
//! The rendered block never exceeds `max_chars`. Space is granted in
//! priority order:
//!
//! 1. **File snippets** (documents the user attached) - truncated to fit
//! 2. **Retrieved chunks** - kept whole, in score order; once one does not
//!    fit it and everything scored below it is dropped
//! 3. **History summary** - truncated to whatever is left
//!
//! Assembly never fails. Missing extraction becomes a placeholder snippet,
//! index errors leave the chunk layer empty, and everything dropped is
//! recorded in [`ContextBlock::drops`].

use std::collections::HashMap;
use std::sync::Arc;

use quill_config::ContextConfig;
use quill_core::document::{Document, DocumentId, DocumentStore};
use quill_core::error::ExtractionError;
use quill_core::index::{ChunkIndex, RetrievalResult};
use quill_core::message::{ConversationId, Message, OwnerId};
use quill_core::storage::ConversationDirectory;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::context::history::{self, clip};

const FILES_HEADER: &str = "[Attached files]";
const CHUNKS_HEADER: &str = "[Retrieved excerpts]";
const HISTORY_HEADER: &str = "[Related conversations]";

/// Whether the assembler consults the owner's other conversations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryMode {
    #[default]
    Off,
    Relevant,
}

/// One assembly call.
#[derive(Debug, Clone)]
pub struct AssemblyRequest {
    pub query: String,
    pub owner_id: OwnerId,
    /// Attached documents. `None` or empty searches the owner's whole corpus.
    pub scope_file_ids: Option<Vec<DocumentId>>,
    pub history_mode: HistoryMode,
    pub max_chars: usize,
    /// The conversation this turn belongs to, left out of the history pass.
    pub exclude_conversation: Option<ConversationId>,
}

impl AssemblyRequest {
    pub fn new(query: impl Into<String>, owner_id: OwnerId, max_chars: usize) -> Self {
        Self {
            query: query.into(),
            owner_id,
            scope_file_ids: None,
            history_mode: HistoryMode::Off,
            max_chars,
            exclude_conversation: None,
        }
    }

    pub fn with_scope(mut self, ids: Vec<DocumentId>) -> Self {
        self.scope_file_ids = Some(ids);
        self
    }

    pub fn with_history(mut self, mode: HistoryMode) -> Self {
        self.history_mode = mode;
        self
    }

    pub fn excluding(mut self, conversation: ConversationId) -> Self {
        self.exclude_conversation = Some(conversation);
        self
    }

    fn scope(&self) -> Option<&[DocumentId]> {
        self.scope_file_ids
            .as_deref()
            .filter(|ids| !ids.is_empty())
    }
}

/// Text pulled from one attached document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSnippet {
    pub doc_id: DocumentId,
    pub display_name: String,
    pub text: String,
    /// `false` when `text` is a placeholder explaining why nothing was extracted.
    pub extracted: bool,
    /// Cut short by the per-document cap or the block budget.
    pub truncated: bool,
}

/// Material left out of a [`ContextBlock`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropInfo {
    pub layer: String,
    pub items_dropped: usize,
    pub chars_dropped: usize,
    pub reason: String,
}

/// The assembled local context for one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextBlock {
    pub file_snippets: Vec<FileSnippet>,
    pub retrieved_chunks: Vec<RetrievalResult>,
    pub history_summary: String,
    /// Whether anything was cut or dropped to respect the budget.
    pub truncated: bool,
    pub drops: Vec<DropInfo>,
    /// Display names for the documents referenced by `retrieved_chunks`.
    #[serde(default)]
    pub document_names: HashMap<DocumentId, String>,
}

impl ContextBlock {
    pub fn is_empty(&self) -> bool {
        self.file_snippets.is_empty()
            && self.retrieved_chunks.is_empty()
            && self.history_summary.is_empty()
    }

    /// Render as prompt text. Chunks are tagged `[doc <name> #<ordinal>]`
    /// so the model can cite them.
    pub fn render(&self) -> String {
        let mut sections = Vec::new();

        if !self.file_snippets.is_empty() {
            let mut s = format!("{FILES_HEADER}\n");
            for snippet in &self.file_snippets {
                s.push_str(&render_snippet(snippet));
                s.push('\n');
            }
            sections.push(s);
        }

        if !self.retrieved_chunks.is_empty() {
            let mut s = format!("{CHUNKS_HEADER}\n");
            for result in &self.retrieved_chunks {
                s.push_str(&render_chunk(result, self.name_of(&result.chunk.doc_id)));
                s.push('\n');
            }
            sections.push(s);
        }

        if !self.history_summary.is_empty() {
            sections.push(format!("{HISTORY_HEADER}\n{}\n", self.history_summary));
        }

        sections.join("\n")
    }

    fn name_of<'a>(&'a self, id: &'a DocumentId) -> &'a str {
        self.document_names
            .get(id)
            .map_or(id.as_str(), String::as_str)
    }
}

fn render_snippet(snippet: &FileSnippet) -> String {
    format!("[file {}]\n{}", snippet.display_name, snippet.text)
}

fn render_chunk(result: &RetrievalResult, name: &str) -> String {
    format!("[doc {} #{}] {}", name, result.chunk.ordinal, result.chunk.text)
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

// ── Assembler ─────────────────────────────────────────────────────────────

/// Builds [`ContextBlock`]s. Read-only over its collaborators; create one
/// and share it.
pub struct ContextAssembler {
    documents: Arc<dyn DocumentStore>,
    index: Arc<dyn ChunkIndex>,
    directory: Option<Arc<dyn ConversationDirectory>>,
    config: ContextConfig,
    top_k: usize,
}

impl ContextAssembler {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        index: Arc<dyn ChunkIndex>,
        config: ContextConfig,
        top_k: usize,
    ) -> Self {
        Self {
            documents,
            index,
            directory: None,
            config,
            top_k,
        }
    }

    /// Conversations visible to the history pass.
    pub fn with_directory(mut self, directory: Arc<dyn ConversationDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub async fn assemble(&self, request: &AssemblyRequest) -> ContextBlock {
        let mut block = ContextBlock::default();
        // Every section costs its header, one newline, and one separator.
        let mut remaining = request.max_chars;

        // ── Layer 1: attached files ────────────────────────────────────────
        let snippets = self.pull_snippets(request, &mut block).await;
        if !snippets.is_empty() {
            remaining = remaining.saturating_sub(char_len(FILES_HEADER) + 2);
            let mut dropped = 0;
            let mut dropped_chars = 0;
            for mut snippet in snippets {
                let overhead = char_len(&render_snippet(&FileSnippet {
                    text: String::new(),
                    ..snippet.clone()
                })) + 1;
                let text_len = char_len(&snippet.text);
                if overhead + text_len <= remaining {
                    remaining -= overhead + text_len;
                    block.file_snippets.push(snippet);
                } else if overhead < remaining {
                    let keep = remaining - overhead;
                    dropped_chars += text_len - keep;
                    snippet.text = clip(&snippet.text, keep);
                    snippet.truncated = true;
                    remaining -= overhead + char_len(&snippet.text);
                    block.truncated = true;
                    block.file_snippets.push(snippet);
                } else {
                    dropped += 1;
                    dropped_chars += text_len;
                    block.truncated = true;
                }
            }
            if block.file_snippets.is_empty() {
                // header reserved but unused
                remaining = request.max_chars;
            }
            push_drop(&mut block, "file_snippets", dropped, dropped_chars, "Block budget exhausted");
        }

        // ── Layer 2: retrieved chunks ──────────────────────────────────────
        let results = match self
            .index
            .query(&request.owner_id, request.scope(), &request.query, self.top_k)
            .await
        {
            Ok(results) => results,
            Err(e) => {
                warn!(error = %e, owner = %request.owner_id, "Chunk retrieval failed, continuing without chunks");
                Vec::new()
            }
        };
        if !results.is_empty() {
            self.resolve_names(&results, &mut block).await;

            let header = char_len(CHUNKS_HEADER) + 2;
            let mut budget = remaining.saturating_sub(header);
            let mut kept = Vec::new();
            let mut cut_at = results.len();
            for (i, result) in results.iter().enumerate() {
                let cost = char_len(&render_chunk(result, block.name_of(&result.chunk.doc_id))) + 1;
                if cost > budget {
                    cut_at = i;
                    break;
                }
                budget -= cost;
                kept.push(result.clone());
            }

            if cut_at < results.len() {
                let dropped = &results[cut_at..];
                block.truncated = true;
                push_drop(
                    &mut block,
                    "retrieved_chunks",
                    dropped.len(),
                    dropped.iter().map(|r| char_len(&r.chunk.text)).sum(),
                    "Lowest-scoring chunks dropped",
                );
            }
            if !kept.is_empty() {
                remaining = budget;
            }
            block
                .document_names
                .retain(|id, _| kept.iter().any(|r| &r.chunk.doc_id == id));
            block.retrieved_chunks = kept;
        }

        // ── Layer 3: related conversations ─────────────────────────────────
        if request.history_mode == HistoryMode::Relevant {
            let summary = self.history_summary(request).await;
            if !summary.is_empty() {
                let header = char_len(HISTORY_HEADER) + 2;
                let budget = remaining.saturating_sub(header);
                let len = char_len(&summary);
                if len <= budget {
                    block.history_summary = summary;
                } else {
                    block.truncated = true;
                    block.history_summary = if budget > 1 {
                        clip(&summary, budget)
                    } else {
                        String::new()
                    };
                    let dropped = usize::from(block.history_summary.is_empty());
                    let dropped_chars = len - char_len(&block.history_summary);
                    push_drop(
                        &mut block,
                        "history",
                        dropped,
                        dropped_chars,
                        "History summary truncated",
                    );
                }
            }
        }

        debug!(
            owner = %request.owner_id,
            snippets = block.file_snippets.len(),
            chunks = block.retrieved_chunks.len(),
            history_chars = block.history_summary.len(),
            truncated = block.truncated,
            "Context assembled"
        );
        block
    }

    /// Text for the first `max_scoped_documents` attached documents, each
    /// capped at `per_document_chars`.
    async fn pull_snippets(
        &self,
        request: &AssemblyRequest,
        block: &mut ContextBlock,
    ) -> Vec<FileSnippet> {
        let Some(scope) = request.scope() else {
            return Vec::new();
        };

        let limit = self.config.max_scoped_documents;
        if scope.len() > limit {
            block.truncated = true;
            push_drop(
                block,
                "file_snippets",
                scope.len() - limit,
                0,
                "More documents attached than are pulled in full",
            );
        }

        let mut snippets = Vec::new();
        for id in scope.iter().take(limit) {
            let document = self
                .documents
                .get(id)
                .await
                .filter(|d| d.owner_id == request.owner_id);
            snippets.push(match document {
                Some(doc) => self.snippet_for(&doc).await,
                None => placeholder(
                    id,
                    id.as_str(),
                    &ExtractionError::NotFound(id.to_string()),
                ),
            });
        }
        snippets
    }

    async fn snippet_for(&self, document: &Document) -> FileSnippet {
        match self.documents.extract_text(document).await {
            Ok(text) => {
                let cap = self.config.per_document_chars;
                let truncated = char_len(&text) > cap;
                FileSnippet {
                    doc_id: document.id.clone(),
                    display_name: document.display_name.clone(),
                    text: if truncated { clip(&text, cap) } else { text },
                    extracted: true,
                    truncated,
                }
            }
            Err(e) => {
                debug!(doc_id = %document.id, error = %e, "Attached document has no text");
                placeholder(&document.id, &document.display_name, &e)
            }
        }
    }

    async fn resolve_names(&self, results: &[RetrievalResult], block: &mut ContextBlock) {
        for result in results {
            let id = &result.chunk.doc_id;
            if block.document_names.contains_key(id) {
                continue;
            }
            let name = match self.documents.get(id).await {
                Some(doc) => doc.display_name,
                None => id.to_string(),
            };
            block.document_names.insert(id.clone(), name);
        }
    }

    async fn history_summary(&self, request: &AssemblyRequest) -> String {
        let Some(directory) = &self.directory else {
            return String::new();
        };
        let records = directory.conversations(&request.owner_id).await;
        let matches = history::relevant_conversations(
            &request.query,
            &records,
            request.exclude_conversation.as_ref(),
            &self.config.history,
        );
        history::summarize(&matches)
    }
}

fn placeholder(id: &DocumentId, name: &str, error: &ExtractionError) -> FileSnippet {
    let reason = match error {
        ExtractionError::Failed { reason, .. } => reason.clone(),
        ExtractionError::NotFound(_) => "document not found".to_string(),
    };
    FileSnippet {
        doc_id: id.clone(),
        display_name: name.to_string(),
        text: format!("(No text could be read from this file: {reason}. Its content was not shown to the model.)"),
        extracted: false,
        truncated: false,
    }
}

fn push_drop(block: &mut ContextBlock, layer: &str, count: usize, chars: usize, reason: &str) {
    if count > 0 || chars > 0 {
        block.drops.push(DropInfo {
            layer: layer.into(),
            items_dropped: count,
            chars_dropped: chars,
            reason: reason.into(),
        });
    }
}

/// The outbound message list: system prompt with the rendered context,
/// prior conversation messages, then the new user message.
pub fn build_messages(
    system_prompt: &str,
    context: &ContextBlock,
    prior: &[Message],
    user_message: Message,
) -> Vec<Message> {
    let system = if context.is_empty() {
        system_prompt.to_string()
    } else {
        format!("{system_prompt}\n\n{}", context.render())
    };

    let mut messages = Vec::with_capacity(prior.len() + 2);
    if !system.is_empty() {
        messages.push(Message::system(system));
    }
    messages.extend(prior.iter().cloned());
    messages.push(user_message);
    messages
}

// ── Tests ─────────────────────────────────────────────────────────────────
