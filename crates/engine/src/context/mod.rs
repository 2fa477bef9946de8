//! Context assembly for one request.
//!
//! | Layer | Source | Trim strategy |
//! |-------|--------|---------------|
//! | File snippets | Attached documents | Truncated to fit, kept first |
//! | Retrieved chunks | Chunk index top-K | Lowest score dropped |
//! | History summary | Owner's other conversations | Truncated last |

pub mod assembler;
pub mod history;

pub use assembler::{
    AssemblyRequest, ContextAssembler, ContextBlock, DropInfo, FileSnippet, HistoryMode,
    build_messages,
};
pub use history::{HistoryMatch, relevant_conversations};
