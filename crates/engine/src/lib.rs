//! The turn engine: local context in, one normalized stream out.
//!
//! A turn moves through:
//!
//! 1. **Load** the conversation from the encrypted store
//! 2. **Assemble** attached files, retrieved chunks and related history
//! 3. **Stream** the reply from the selected provider through the multiplexer
//! 4. **Persist** the updated transcript once the stream completes
//!
//! Cancellation is routed from the subscriber back to the adapter, and every
//! subscription ends with exactly one terminal event.

pub mod context;
pub mod multiplexer;
pub mod turn;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use context::{
    AssemblyRequest, ContextAssembler, ContextBlock, DropInfo, FileSnippet, HistoryMatch,
    HistoryMode, build_messages, relevant_conversations,
};
pub use multiplexer::{StreamMultiplexer, Subscription};
pub use turn::{
    Engine, PendingTurn, SessionDirectory, TurnCanceller, TurnOutcome, TurnRequest, TurnStatus,
};
