//! `quill chat`: One streamed turn.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use quill_config::{AppConfig, ScorerKind};
use quill_core::index::Embedder;
use quill_core::message::ConversationId;
use quill_engine::{Engine, HistoryMode, TurnRequest, TurnStatus};
use quill_index::{Chunker, InMemoryChunkIndex, InMemoryDocumentStore, Library, build_scorer};
use quill_providers::{OpenAiEmbedder, build_from_config};
use tracing::debug;

pub struct ChatArgs {
    pub message: String,
    pub files: Vec<PathBuf>,
    pub conversation: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub history: bool,
    pub save_partial: bool,
}

pub async fn run(args: ChatArgs) -> anyhow::Result<()> {
    let config = AppConfig::load().context("Failed to load config")?;
    let secret = super::secret()?;
    let owner = super::owner();

    let embedder: Option<Arc<dyn Embedder>> = match config.index.scorer {
        ScorerKind::Lexical => None,
        _ => Some(Arc::new(OpenAiEmbedder::from_config(&config))),
    };
    let library = Library::new(
        Arc::new(InMemoryDocumentStore::new()),
        Arc::new(InMemoryChunkIndex::new(build_scorer(&config.index, embedder))),
        Chunker::new(config.index.window_chars, config.index.overlap_chars)?,
    );

    let mut attached = Vec::new();
    for path in &args.files {
        let report = library
            .add_file(&owner, path)
            .await
            .with_context(|| format!("Failed to attach {}", path.display()))?;
        if let Some(reason) = &report.extraction_error {
            eprintln!("  [warn] {}: {reason}", report.document.display_name);
        }
        attached.push(report.document.id);
    }

    let engine = Engine::new(
        library.store(),
        library.index(),
        build_from_config(&config),
        Arc::new(super::conversation_store(&config)),
        config,
    );

    let mut request = TurnRequest::new(owner.clone(), args.message).with_attachments(attached);
    if args.history {
        let unlocked = engine.unlock_conversations(&owner, &secret).await?;
        debug!(conversations = unlocked, "Unlocked conversation history");
        request = request.with_history(HistoryMode::Relevant);
    }
    if let Some(id) = args.conversation {
        request = request.in_conversation(ConversationId(id));
    }
    if let Some(provider) = args.provider {
        request = request.with_provider(provider);
    }
    if let Some(model) = args.model {
        request = request.with_model(model);
    }
    if args.save_partial {
        request = request.save_partial(true);
    }

    let pending = engine.begin_turn(request, &secret).await?;
    for trim in &pending.context().drops {
        debug!(
            layer = %trim.layer,
            items = trim.items_dropped,
            chars = trim.chars_dropped,
            reason = %trim.reason,
            "Context trimmed"
        );
    }

    let canceller = pending.canceller();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            canceller.cancel();
        }
    });

    let mut stdout = std::io::stdout();
    let outcome = pending
        .drive(&secret, |delta| {
            print!("{delta}");
            let _ = stdout.flush();
        })
        .await;
    interrupt.abort();
    let outcome = outcome?;
    println!();

    match &outcome.status {
        TurnStatus::Completed => eprintln!("  [conversation {}]", outcome.conversation_id),
        TurnStatus::Cancelled if outcome.persisted => eprintln!(
            "  [cancelled, partial reply saved to {}]",
            outcome.conversation_id
        ),
        TurnStatus::Cancelled => eprintln!("  [cancelled]"),
        TurnStatus::Failed { failure } => bail!("Stream failed: {failure}"),
    }

    Ok(())
}
