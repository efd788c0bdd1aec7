//! Streams external code-generation CLIs as typed chunks and chains two of
//! them into a generate-then-review pipeline.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use duet_core::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), DuetError> {
//! let config = DuetConfig::from_env()?;
//! let store = Arc::new(InMemoryConversationStore::new());
//! let generator = Generator::from_config(&config, store);
//!
//! let mut generation = generator.generate("Write a binary search in Rust", GenerateOptions::default())?;
//! while let Some(chunk) = generation.stream.next_chunk().await {
//!     print!("{}", chunk.content);
//! }
//! generation.stream.finish().await?;
//! # Ok(())
//! # }
//! ```

/// Agent and message role identifiers.
pub mod agent;
/// Chunk type and the producer/consumer hand-off.
pub mod chunk;
/// Runtime configuration.
pub mod config;
/// Conversation records and storage.
pub mod conversation;
/// Public error types.
pub mod errors;
/// Fenced code block parsing.
pub mod extract;
/// CLI availability probe.
pub mod health;
/// Tracing subscriber setup.
pub mod observability;
/// Two-stage generate-then-review pipeline.
pub mod pipeline;
/// Common imports for typical usage.
pub mod prelude;
/// Single CLI run with timeout escalation.
pub mod runner;

pub use agent::{Agent, Role};
pub use chunk::{AbortHandle, Chunk, ChunkKind, ChunkSender, ChunkStream, chunk_channel};
pub use config::{AgentCommands, DuetConfig};
pub use conversation::{Conversation, ConversationStore, InMemoryConversationStore, Message};
pub use errors::{DuetError, RunFailure};
pub use extract::{CodeBlock, extract_first, extract_first_code, parse_code_blocks};
pub use health::{HealthState, HealthStatus};
pub use observability::init_observability;
pub use pipeline::{GenerateOptions, Generation, Generator, RunSettings, review_prompt};
pub use runner::{AgentRunner, CliRunner, RunRequest};
