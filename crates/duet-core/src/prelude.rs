//! Common imports for typical usage.
pub use crate::{
    AbortHandle, Agent, AgentCommands, Chunk, ChunkKind, ChunkStream, ConversationStore,
    DuetConfig, DuetError, GenerateOptions, Generation, Generator, InMemoryConversationStore,
    Role, RunFailure,
};
