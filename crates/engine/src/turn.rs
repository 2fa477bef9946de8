//! Turn orchestration: one user query to one streamed, persisted reply.
//!
//! The flow for a turn:
//!
//! 1. **Load** the conversation (decrypting it with the caller's secret)
//! 2. **Assemble** local context and build the outbound message list
//! 3. **Open** a provider stream and register it with the multiplexer
//! 4. **Drive** the subscription, forwarding deltas to the caller
//! 5. **Persist** the transcript when the stream completed
//!
//! Cancelled turns are discarded unless the caller asked to keep partial
//! replies. Failed turns are never persisted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quill_config::AppConfig;
use quill_core::document::{DocumentId, DocumentStore};
use quill_core::error::{Error, StreamFailure, SubscribeError};
use quill_core::index::ChunkIndex;
use quill_core::message::{ConversationId, ConversationRecord, Message, OwnerId, title_from_query};
use quill_core::provider::{
    NormalizedRequest, ProviderKind, StreamAdapter, StreamEvent, TurnId,
};
use quill_core::storage::ConversationDirectory;
use quill_core::cancel::CancelHandle;
use quill_providers::ProviderRouter;
use quill_security::EncryptedConversationStore;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::context::{
    AssemblyRequest, ContextAssembler, ContextBlock, HistoryMode, build_messages,
};
use crate::multiplexer::{StreamMultiplexer, Subscription};

/// Decrypted conversations opened during this session.
///
/// Feeds the history relevance pass without the core ever holding a secret.
#[derive(Default)]
pub struct SessionDirectory {
    records: RwLock<HashMap<ConversationId, ConversationRecord>>,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: ConversationRecord) {
        self.records.write().await.insert(record.id.clone(), record);
    }

    pub async fn get(&self, id: &ConversationId) -> Option<ConversationRecord> {
        self.records.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &ConversationId) -> Option<ConversationRecord> {
        self.records.write().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl ConversationDirectory for SessionDirectory {
    async fn conversations(&self, owner_id: &OwnerId) -> Vec<ConversationRecord> {
        let mut records: Vec<_> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| &r.owner_id == owner_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        records
    }
}

/// What the caller wants from one turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub owner_id: OwnerId,
    /// Continue this conversation; `None` starts a new one.
    pub conversation_id: Option<ConversationId>,
    pub query: String,
    pub attached: Vec<DocumentId>,
    pub history_mode: HistoryMode,
    pub provider: Option<String>,
    pub model: Option<String>,
    /// Overrides `storage.save_partial_on_cancel`.
    pub save_partial_on_cancel: Option<bool>,
}

impl TurnRequest {
    pub fn new(owner_id: OwnerId, query: impl Into<String>) -> Self {
        Self {
            owner_id,
            conversation_id: None,
            query: query.into(),
            attached: Vec::new(),
            history_mode: HistoryMode::Off,
            provider: None,
            model: None,
            save_partial_on_cancel: None,
        }
    }

    pub fn in_conversation(mut self, id: ConversationId) -> Self {
        self.conversation_id = Some(id);
        self
    }

    pub fn with_attachments(mut self, ids: Vec<DocumentId>) -> Self {
        self.attached = ids;
        self
    }

    pub fn with_history(mut self, mode: HistoryMode) -> Self {
        self.history_mode = mode;
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn save_partial(mut self, save: bool) -> Self {
        self.save_partial_on_cancel = Some(save);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnStatus {
    Completed,
    Cancelled,
    Failed { failure: StreamFailure },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnOutcome {
    pub turn_id: TurnId,
    pub conversation_id: ConversationId,
    pub status: TurnStatus,
    /// Everything streamed before the terminal event.
    pub reply: String,
    pub persisted: bool,
}

/// Cancels one turn from anywhere.
#[derive(Clone)]
pub struct TurnCanceller {
    multiplexer: Arc<StreamMultiplexer>,
    turn: TurnId,
}

impl TurnCanceller {
    /// Returns `false` when the turn has already finished.
    pub fn cancel(&self) -> bool {
        self.multiplexer.cancel(&self.turn).is_ok()
    }
}

pub struct Engine {
    router: ProviderRouter,
    assembler: ContextAssembler,
    multiplexer: Arc<StreamMultiplexer>,
    store: Arc<EncryptedConversationStore>,
    sessions: Arc<SessionDirectory>,
    config: AppConfig,
}

impl Engine {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        index: Arc<dyn ChunkIndex>,
        router: ProviderRouter,
        store: Arc<EncryptedConversationStore>,
        config: AppConfig,
    ) -> Self {
        let sessions = Arc::new(SessionDirectory::new());
        let assembler =
            ContextAssembler::new(documents, index, config.context.clone(), config.index.top_k)
                .with_directory(sessions.clone());
        Self {
            router,
            assembler,
            multiplexer: StreamMultiplexer::with_claim_timeout(Duration::from_secs(
                config.stream.turn_timeout_secs,
            )),
            store,
            sessions,
            config,
        }
    }

    pub fn router(&self) -> &ProviderRouter {
        &self.router
    }

    pub fn multiplexer(&self) -> &Arc<StreamMultiplexer> {
        &self.multiplexer
    }

    pub fn sessions(&self) -> &Arc<SessionDirectory> {
        &self.sessions
    }

    pub fn store(&self) -> &Arc<EncryptedConversationStore> {
        &self.store
    }

    pub async fn assemble(&self, request: &AssemblyRequest) -> ContextBlock {
        self.assembler.assemble(request).await
    }

    /// Start streaming `request` from the named provider.
    pub async fn open_provider_stream(
        &self,
        provider: &str,
        request: NormalizedRequest,
    ) -> Result<TurnId, Error> {
        let adapter = self.router.get(provider).ok_or_else(|| Error::Config {
            message: format!("Unknown provider: {provider}"),
        })?;
        Ok(self.open_with(adapter, request).await)
    }

    /// Start streaming `request` from the first provider of a wire family.
    pub async fn open_stream_for_kind(
        &self,
        kind: ProviderKind,
        request: NormalizedRequest,
    ) -> Result<TurnId, Error> {
        let adapter = self.router.by_kind(kind).ok_or_else(|| Error::Config {
            message: format!("No provider configured for {kind}"),
        })?;
        Ok(self.open_with(adapter, request).await)
    }

    async fn open_with(&self, adapter: Arc<dyn StreamAdapter>, request: NormalizedRequest) -> TurnId {
        let turn = TurnId::new();
        let cancel = CancelHandle::new();
        debug!(turn_id = %turn, provider = adapter.name(), model = %request.model, "Opening stream");
        let receiver = adapter.open(request, cancel.signal()).await;
        self.multiplexer.register(turn.clone(), receiver, cancel);
        turn
    }

    pub fn subscribe(&self, turn: &TurnId) -> Result<Subscription, SubscribeError> {
        self.multiplexer.subscribe(turn)
    }

    pub fn cancel(&self, turn: &TurnId) -> Result<(), SubscribeError> {
        self.multiplexer.cancel(turn)
    }

    /// Decrypt a stored conversation and make it visible to the history pass.
    pub async fn open_conversation(
        &self,
        id: &ConversationId,
        secret: &str,
    ) -> Result<ConversationRecord, Error> {
        let record = self
            .store
            .load(id, secret)
            .await?
            .ok_or_else(|| Error::ConversationNotFound(id.to_string()))?;
        self.sessions.insert(record.clone()).await;
        Ok(record)
    }

    /// Open every stored conversation of `owner_id` that `secret` unlocks.
    /// Returns how many were opened.
    pub async fn unlock_conversations(&self, owner_id: &OwnerId, secret: &str) -> Result<usize, Error> {
        let mut opened = 0;
        for id in self.store.list().await? {
            match self.store.load(&id, secret).await {
                Ok(Some(record)) if &record.owner_id == owner_id => {
                    self.sessions.insert(record).await;
                    opened += 1;
                }
                Ok(_) => {}
                Err(e) => debug!(conversation = %id, error = %e, "Skipping conversation"),
            }
        }
        Ok(opened)
    }

    /// Load, assemble and open the stream for one turn.
    pub async fn begin_turn(&self, request: TurnRequest, secret: &str) -> Result<PendingTurn, Error> {
        let existing = match &request.conversation_id {
            Some(id) => {
                let record = self.open_conversation(id, secret).await?;
                if record.owner_id != request.owner_id {
                    return Err(Error::ConversationNotFound(id.to_string()));
                }
                Some(record)
            }
            None => None,
        };

        let provider = request
            .provider
            .clone()
            .or_else(|| {
                existing
                    .as_ref()
                    .map(|r| r.provider.clone())
                    .filter(|p| self.router.get(p).is_some())
            })
            .unwrap_or_else(|| self.router.default_provider().to_string());
        let model = request
            .model
            .clone()
            .or_else(|| {
                existing
                    .as_ref()
                    .filter(|r| r.provider == provider)
                    .map(|r| r.model.clone())
            })
            .unwrap_or_else(|| self.config.model_for(&provider));

        let record = existing.unwrap_or_else(|| {
            ConversationRecord::new(
                request.owner_id.clone(),
                title_from_query(&request.query),
                provider.clone(),
                model.clone(),
            )
        });

        let mut assembly = AssemblyRequest::new(
            request.query.clone(),
            request.owner_id.clone(),
            self.config.context.max_chars,
        )
        .with_history(request.history_mode)
        .excluding(record.id.clone());
        if !request.attached.is_empty() {
            assembly = assembly.with_scope(request.attached.clone());
        }
        let context = self.assembler.assemble(&assembly).await;

        let user_message = Message::user(request.query.clone())
            .with_attachments(request.attached.iter().map(|id| id.to_string()));
        let messages = build_messages(
            &self.config.context.system_prompt,
            &context,
            &record.messages,
            user_message.clone(),
        );

        let mut outbound = NormalizedRequest::new(model.clone(), messages);
        outbound.temperature = self.config.default_temperature;
        outbound.top_p = self.config.default_top_p;
        outbound.max_tokens = Some(self.config.default_max_tokens);

        let turn = self.open_provider_stream(&provider, outbound).await?;
        let subscription = self.subscribe(&turn)?;
        info!(
            turn_id = %turn,
            conversation = %record.id,
            %provider,
            %model,
            chunks = context.retrieved_chunks.len(),
            snippets = context.file_snippets.len(),
            "Turn started"
        );

        Ok(PendingTurn {
            subscription,
            record,
            user_message,
            context,
            provider,
            model,
            save_partial: request
                .save_partial_on_cancel
                .unwrap_or(self.config.storage.save_partial_on_cancel),
            multiplexer: self.multiplexer.clone(),
            store: self.store.clone(),
            sessions: self.sessions.clone(),
        })
    }
}

/// A turn whose stream is open and subscribed.
pub struct PendingTurn {
    subscription: Subscription,
    record: ConversationRecord,
    user_message: Message,
    context: ContextBlock,
    provider: String,
    model: String,
    save_partial: bool,
    multiplexer: Arc<StreamMultiplexer>,
    store: Arc<EncryptedConversationStore>,
    sessions: Arc<SessionDirectory>,
}

impl PendingTurn {
    pub fn turn_id(&self) -> &TurnId {
        self.subscription.turn_id()
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.record.id
    }

    pub fn context(&self) -> &ContextBlock {
        &self.context
    }

    pub fn canceller(&self) -> TurnCanceller {
        TurnCanceller {
            multiplexer: self.multiplexer.clone(),
            turn: self.turn_id().clone(),
        }
    }

    /// Stream the reply to `on_token` and settle the transcript.
    pub async fn drive<F>(mut self, secret: &str, mut on_token: F) -> Result<TurnOutcome, Error>
    where
        F: FnMut(&str),
    {
        let mut reply = String::new();
        let status = loop {
            match self.subscription.recv().await {
                Some(StreamEvent::Token(token)) => {
                    if !token.delta_text.is_empty() {
                        on_token(&token.delta_text);
                        reply.push_str(&token.delta_text);
                    }
                    if token.is_final {
                        break TurnStatus::Completed;
                    }
                }
                Some(StreamEvent::Failed(failure)) => break TurnStatus::Failed { failure },
                Some(StreamEvent::Cancelled) => break TurnStatus::Cancelled,
                None => {
                    break TurnStatus::Failed {
                        failure: StreamFailure::transport("subscription closed"),
                    };
                }
            }
        };

        let persist = match &status {
            TurnStatus::Completed => true,
            TurnStatus::Cancelled => self.save_partial && !reply.is_empty(),
            TurnStatus::Failed { failure } => {
                warn!(turn_id = %self.turn_id(), error = %failure, "Turn failed, transcript not saved");
                false
            }
        };

        if persist {
            self.record.push(self.user_message);
            self.record.push(Message::assistant(reply.clone()));
            self.record.provider = self.provider;
            self.record.model = self.model;
            self.store.save(&self.record, secret).await?;
            self.sessions.insert(self.record.clone()).await;
        }

        info!(
            turn_id = %self.subscription.turn_id(),
            conversation = %self.record.id,
            status = ?status,
            reply_chars = reply.len(),
            persisted = persist,
            "Turn finished"
        );

        Ok(TurnOutcome {
            turn_id: self.subscription.turn_id().clone(),
            conversation_id: self.record.id.clone(),
            status,
            reply,
            persisted: persist,
        })
    }
}
